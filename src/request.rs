use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use uuid::Uuid;

use crate::body::Body;
use crate::errors::{Error, Result};
use crate::response::{parse_version, parser_headers, read_chunked_body};
use crate::{COLON_SPACE, CR_LF, SPACE};

const MAX_HEADER_BYTES: usize = 64 * 1024;

/// A proxied HTTP request.
///
/// Carries the identifier assigned when the request first entered the proxy;
/// the identifier travels with every clone and with the response produced for
/// this exchange.
#[derive(Clone)]
pub struct Request {
  id: Uuid,
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  host: String,
  body: Option<Body>,
}

impl Default for Request {
  fn default() -> Self {
    Self {
      id: Uuid::new_v4(),
      uri: http::Uri::default(),
      version: Version::HTTP_11,
      method: Method::GET,
      headers: HeaderMap::new(),
      host: String::new(),
      body: None,
    }
  }
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("id", &self.id)
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    let host = parts
      .uri
      .authority()
      .map(|a| a.to_string())
      .or_else(|| {
        parts
          .headers
          .get(http::header::HOST)
          .and_then(|v| v.to_str().ok())
          .map(|v| v.to_string())
      })
      .unwrap_or_default();
    Self {
      id: Uuid::new_v4(),
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      host,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Assemble a request from already-validated parts. Used when a plugin
  /// returns a rewritten message over the RPC link.
  #[allow(clippy::too_many_arguments)]
  pub fn from_parts(
    id: Uuid,
    method: Method,
    uri: http::Uri,
    version: Version,
    headers: HeaderMap<HeaderValue>,
    host: String,
    body: Option<Body>,
  ) -> Self {
    Self {
      id,
      uri,
      version,
      method,
      headers,
      host,
      body,
    }
  }

  /// Serialize into raw HTTP/1.1 wire bytes with an origin-form target.
  ///
  /// A `Host` header is synthesized from the request's host field when the
  /// header map lacks one, and `Content-Length` is added for non-empty bodies.
  pub fn to_raw(&self) -> Bytes {
    let mut raw = Vec::new();
    raw.extend(self.method.as_str().as_bytes());
    raw.extend(SPACE);
    let path = self.uri.path();
    raw.extend(if path.is_empty() { "/".as_bytes() } else { path.as_bytes() });
    if let Some(q) = self.uri.query() {
      raw.extend([b'?']);
      raw.extend(q.as_bytes());
    }
    raw.extend(SPACE);
    raw.extend(format!("{:?}", self.version).as_bytes());
    raw.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      raw.extend(http::header::HOST.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      if !self.host.is_empty() {
        raw.extend(self.host.as_bytes());
      } else if let Some(a) = self.uri.authority() {
        raw.extend(a.as_str().as_bytes());
      }
      raw.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    if let Some(b) = self.body() {
      if !b.is_empty() {
        headers
          .entry(http::header::CONTENT_LENGTH)
          .or_insert(HeaderValue::from(b.len()));
      }
    }
    for (k, v) in headers.iter() {
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

  /// The identifier assigned when this request entered the proxy.
  #[inline]
  pub fn id(&self) -> Uuid {
    self.id
  }

  #[inline]
  pub(crate) fn set_id(&mut self, id: Uuid) {
    self.id = id;
  }

  /// Get the HTTP method of this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// Get a mutable reference to the HTTP method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }

  /// Get the target URI of this request.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }

  /// Get a mutable reference to the target URI.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }

  /// Get the headers of this request. Iteration order is insertion order and
  /// repeated names keep every value.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// The authority this request targets (`host` or `host:port`).
  #[inline]
  pub fn host(&self) -> &str {
    &self.host
  }

  /// Replace the target authority.
  #[inline]
  pub fn set_host(&mut self, host: impl Into<String>) {
    self.host = host.into();
  }

  /// Get the body of this request, if any.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }

  /// Get a mutable reference to the body slot.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }

  /// Get the HTTP version of this request.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// Whether the client asked to close the connection after this exchange.
  pub fn connection_close(&self) -> bool {
    let close = self
      .headers
      .get(http::header::CONNECTION)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.eq_ignore_ascii_case("close"))
      .unwrap_or(false);
    close || self.version == Version::HTTP_10
  }
}

/// Parses one HTTP/1.1 request off an async buffered stream.
///
/// The reader is borrowed so a keep-alive connection can yield a sequence of
/// requests from the same buffer without losing pipelined bytes.
pub struct RequestReader<'a, T: AsyncRead + Unpin> {
  reader: &'a mut BufReader<T>,
  scheme: &'static str,
  authority: Option<String>,
}

impl<'a, T: AsyncRead + Unpin> RequestReader<'a, T> {
  /// Reader for forward-proxy traffic (absolute-form request targets).
  pub fn new(reader: &'a mut BufReader<T>) -> Self {
    Self {
      reader,
      scheme: "http",
      authority: None,
    }
  }

  /// Reader for tunneled traffic: origin-form targets are resolved against
  /// the CONNECT authority.
  pub fn with_origin(
    reader: &'a mut BufReader<T>,
    scheme: &'static str,
    authority: impl Into<String>,
  ) -> Self {
    Self {
      reader,
      scheme,
      authority: Some(authority.into()),
    }
  }

  /// Read one request. `Ok(None)` signals a clean EOF before the first byte,
  /// i.e. the peer closed an idle keep-alive connection.
  pub async fn read(self) -> Result<Option<Request>> {
    let mut line = Vec::new();
    let n = self.reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Ok(None);
    }
    if line.len() > MAX_HEADER_BYTES {
      return Err(Error::invalid_request("request line too long"));
    }
    let line = line.strip_suffix(CR_LF).unwrap_or(&line);
    let line = String::from_utf8_lossy(line);
    let mut parts = line.split_whitespace();
    let method = parts
      .next()
      .ok_or_else(|| Error::invalid_request("empty request line"))?;
    let method = Method::from_bytes(method.as_bytes())?;
    let target = parts
      .next()
      .ok_or_else(|| Error::invalid_request("request line without target"))?
      .to_string();
    let version = parts
      .next()
      .ok_or_else(|| Error::invalid_request("request line without version"))
      .and_then(|v| parse_version(v.as_bytes()))?;

    let headers = read_header_block(self.reader).await?;

    let absolute = target.starts_with("http://") || target.starts_with("https://");
    let host = if method == Method::CONNECT {
      target.clone()
    } else if absolute {
      target
        .parse::<http::Uri>()
        .ok()
        .and_then(|u| u.authority().map(|a| a.to_string()))
        .unwrap_or_default()
    } else {
      self
        .authority
        .clone()
        .or_else(|| {
          headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
        })
        .unwrap_or_default()
    };

    let uri: http::Uri = if absolute || method == Method::CONNECT {
      target.parse()?
    } else if host.is_empty() {
      target.parse()?
    } else {
      format!("{}://{}{}", self.scheme, host, target).parse()?
    };

    let body = read_request_body(self.reader, &headers).await?;

    // Chunked framing was decoded away; re-frame by length so the
    // serialized form matches the body it carries.
    let mut headers = headers;
    if headers
      .get(http::header::TRANSFER_ENCODING)
      .map(|te| te == "chunked")
      .unwrap_or(false)
    {
      headers.remove(http::header::TRANSFER_ENCODING);
      let len = body.as_ref().map(|b| b.len()).unwrap_or(0);
      headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(len));
    }

    Ok(Some(Request {
      id: Uuid::new_v4(),
      uri,
      version,
      method,
      headers,
      host,
      body,
    }))
  }
}

async fn read_header_block<T: AsyncRead + Unpin>(
  reader: &mut BufReader<T>,
) -> Result<HeaderMap<HeaderValue>> {
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  let mut total = 0usize;
  loop {
    let length = reader.read_until(b'\n', &mut header_line).await?;
    if length == 0 || header_line == b"\r\n" || header_line == b"\n" {
      break;
    }
    total += length;
    if total > MAX_HEADER_BYTES {
      return Err(Error::invalid_request("header block too large"));
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
  Ok(headers)
}

async fn read_request_body<T: AsyncRead + Unpin>(
  reader: &mut BufReader<T>,
  headers: &HeaderMap<HeaderValue>,
) -> Result<Option<Body>> {
  if let Some(te) = headers.get(http::header::TRANSFER_ENCODING) {
    if te == "chunked" {
      let body = read_chunked_body(reader).await?;
      return Ok(if body.is_empty() { None } else { Some(body.into()) });
    }
  }
  let content_length: usize = headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|x| x.to_str().ok()?.parse().ok())
    .unwrap_or(0);
  if content_length == 0 {
    return Ok(None);
  }
  let mut body = vec![0u8; content_length];
  reader.read_exact(&mut body).await?;
  Ok(Some(body.into()))
}
