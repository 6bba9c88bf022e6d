use std::fmt::Debug;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Response as HttpResponse, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use uuid::Uuid;

use crate::body::Body;
use crate::errors::{new_io_error, Error, Result};
use crate::request::Request;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// A response to a proxied [`Request`].
///
/// Keeps a back reference to the originating request so the exchange
/// identifier can always be recovered, and preserves the upstream's reason
/// phrase verbatim.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  reason: Option<String>,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
  request: Option<Box<Request>>,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      status_code: parts.status,
      reason: None,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
      request: None,
    }
  }
}

impl Response {
  /// Assemble a response from already-validated parts.
  pub fn from_parts(
    version: Version,
    status_code: StatusCode,
    headers: HeaderMap<HeaderValue>,
    body: Option<Body>,
  ) -> Self {
    Self {
      version,
      status_code,
      reason: None,
      headers,
      body,
      request: None,
    }
  }

  /// Serialize into raw HTTP/1.1 wire bytes, preserving the reason phrase
  /// the upstream sent.
  pub fn to_raw(&self) -> Bytes {
    let mut raw = Vec::new();
    raw.extend(format!("{:?}", self.version).as_bytes());
    raw.extend(SPACE);
    raw.extend(self.status_code.as_str().as_bytes());
    raw.extend(SPACE);
    raw.extend(self.reason_phrase().as_bytes());
    raw.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      raw.extend(k.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(v.as_bytes());
      raw.extend(CR_LF);
    }
    raw.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        raw.extend(b.bytes().as_ref());
      }
    }
    Bytes::from(raw)
  }

  /// Get the status code of this response.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }

  /// The reason phrase as received, falling back to the canonical one.
  pub fn reason_phrase(&self) -> &str {
    self
      .reason
      .as_deref()
      .or_else(|| self.status_code.canonical_reason())
      .unwrap_or("Unknown")
  }

  /// Get the HTTP version of this response.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// Get the headers of this response.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// Get the body of this response, if any.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }

  /// Get a mutable reference to the body slot.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }

  /// The request that produced this response, if attached.
  #[inline]
  pub fn request(&self) -> Option<&Request> {
    self.request.as_deref()
  }

  /// Attach the originating request. The response inherits its identifier.
  pub fn set_request(&mut self, request: Request) {
    self.request = Some(Box::new(request));
  }

  /// The exchange identifier inherited from the originating request.
  pub fn id(&self) -> Option<Uuid> {
    self.request.as_ref().map(|r| r.id())
  }

  pub(crate) fn set_reason(&mut self, reason: Option<String>) {
    self.reason = reason;
  }

  /// Content length advertised by the upstream, if any.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }

  /// Whether this response permits connection reuse under HTTP/1.1 framing.
  pub(crate) fn keep_alive(&self) -> bool {
    if self.version != Version::HTTP_11 {
      return false;
    }
    let close = self
      .headers
      .get(http::header::CONNECTION)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.eq_ignore_ascii_case("close"))
      .unwrap_or(false);
    if close {
      return false;
    }
    // Without a length the body is delimited by EOF, so the connection
    // cannot carry another exchange.
    self.content_length().is_some()
      || self
        .headers
        .get(http::header::TRANSFER_ENCODING)
        .map(|te| te == "chunked")
        .unwrap_or(false)
      || !self.may_have_body()
  }

  fn may_have_body(&self) -> bool {
    let code = self.status_code.as_u16();
    !(self.status_code.is_informational() || code == 204 || code == 304)
  }
}

/// Parses one HTTP/1.1 response off an async buffered stream.
pub struct ResponseReader<'a, T: AsyncRead + Unpin> {
  reader: &'a mut BufReader<T>,
  method: Method,
}

impl<'a, T: AsyncRead + Unpin> ResponseReader<'a, T> {
  /// Build a reader; `method` is the request method, which controls whether
  /// a body is expected (`HEAD` responses never carry one).
  pub fn new(reader: &'a mut BufReader<T>, method: Method) -> Self {
    Self { reader, method }
  }

  async fn parse_status_line(&mut self) -> Result<(Version, StatusCode, Option<String>)> {
    let mut line = Vec::new();
    let n = self.reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed before status line",
      ));
    }
    let line = line.strip_suffix(CR_LF).unwrap_or(&line);
    let mut fields = line.splitn(3, |b| b == &b' ');
    let version = fields
      .next()
      .ok_or_else(|| Error::invalid_request("missing http version"))
      .and_then(parse_version)?;
    let status = fields
      .next()
      .filter(|vc| !vc.is_empty())
      .ok_or_else(|| new_io_error(std::io::ErrorKind::InvalidData, "missing status code"))?;
    let status = StatusCode::try_from(status).map_err(|x| Error::Http(http::Error::from(x)))?;
    let reason = fields
      .next()
      .map(|r| String::from_utf8_lossy(r).to_string())
      .filter(|r| !r.is_empty());
    Ok((version, status, reason))
  }

  async fn read_headers(&mut self) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut header_line = Vec::new();
    while let Ok(length) = self.reader.read_until(b'\n', &mut header_line).await {
      if length == 0 || header_line == b"\r\n" {
        break;
      }
      if let Ok((Some(k), Some(v))) = parser_headers(&header_line) {
        if headers.contains_key(&k) {
          headers.append(k, v);
        } else {
          headers.insert(k, v);
        }
      }
      header_line.clear();
    }
    headers
  }

  async fn read_body(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    if matches!(self.method, Method::HEAD) {
      return Ok(body);
    }
    let code = status.as_u16();
    if status.is_informational() || code == 204 || code == 304 {
      return Ok(body);
    }
    if let Some(te) = headers.get(http::header::TRANSFER_ENCODING) {
      if te == "chunked" {
        return read_chunked_body(self.reader).await;
      }
    }
    let content_length: Option<u64> = headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok());
    match content_length {
      Some(0) => {}
      Some(length) => {
        body = vec![0u8; length as usize];
        self.reader.read_exact(&mut body).await?;
      }
      None => {
        // EOF-delimited body; the connection is done after this exchange.
        self.reader.read_to_end(&mut body).await?;
      }
    }
    Ok(body)
  }

  /// Read one complete response.
  pub async fn read(mut self) -> Result<Response> {
    let (version, status_code, reason) = self.parse_status_line().await?;
    let mut headers = self.read_headers().await;
    let body = self.read_body(status_code, &headers).await?;
    // Chunked framing was decoded away; re-frame by length so the
    // serialized form matches the body it carries.
    if headers
      .get(http::header::TRANSFER_ENCODING)
      .map(|te| te == "chunked")
      .unwrap_or(false)
    {
      headers.remove(http::header::TRANSFER_ENCODING);
      headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    }
    let mut response = Response::from_parts(
      version,
      status_code,
      headers,
      if body.is_empty() { None } else { Some(body.into()) },
    );
    response.set_reason(reason);
    Ok(response)
  }
}

pub(crate) fn parse_version(vc: &[u8]) -> Result<Version> {
  match vc {
    b"HTTP/0.9" => Ok(Version::HTTP_09),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    b"HTTP/2.0" => Ok(Version::HTTP_2),
    b"HTTP/3.0" => Ok(Version::HTTP_3),
    _ => Err(new_io_error(
      std::io::ErrorKind::InvalidData,
      "invalid http version",
    )),
  }
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &b':').enumerate() {
    let h = h.strip_prefix(SPACE).unwrap_or(h);
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      1 => match http::HeaderValue::from_bytes(h) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}

pub(crate) async fn read_chunked_body<T: AsyncRead + Unpin>(
  reader: &mut BufReader<T>,
) -> Result<Vec<u8>> {
  let mut body: Vec<u8> = Vec::new();
  loop {
    let mut size_line = Vec::new();
    let n = reader.read_until(b'\n', &mut size_line).await?;
    if n == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside chunked body",
      ));
    }
    let size_line = size_line.strip_suffix(CR_LF).unwrap_or(&size_line);
    let size_line = size_line.strip_suffix(b"\n").unwrap_or(size_line);
    if size_line.is_empty() {
      continue;
    }
    // chunk extensions after ';' are ignored
    let size_field = size_line.split(|b| b == &b';').next().unwrap_or(size_line);
    let size_text = String::from_utf8_lossy(size_field);
    let size = usize::from_str_radix(size_text.trim(), 16)
      .map_err(|_| new_io_error(std::io::ErrorKind::InvalidData, "invalid chunk size"))?;
    if size == 0 {
      // trailing CRLF after the last chunk
      let mut trailer = Vec::new();
      let _ = reader.read_until(b'\n', &mut trailer).await;
      break;
    }
    let mut chunk = vec![0u8; size];
    reader.read_exact(&mut chunk).await?;
    body.append(&mut chunk);
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
  Ok(body)
}
