//! Conversions between pipeline messages and their RPC form.
//!
//! Outgoing messages serialize headers as (name, value) pairs preserving
//! multiplicity, with `Host` synthesized when absent. Incoming mutation
//! results rebuild the message from the proto fields, re-attach the exchange
//! identifier from `id`, and inherit the protocol version from the original.

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use uuid::Uuid;

use crate::body::Body;
use crate::errors::Result;
use crate::grpc::proto;
use crate::request::Request;
use crate::response::Response;

/// Serialize a request for the RPC link.
pub fn request_to_proto(request: &Request) -> proto::HttpRequest {
  let mut headers = Vec::new();
  let mut host_present = false;
  for (name, value) in request.headers().iter() {
    if name == http::header::HOST {
      host_present = true;
    }
    headers.push(proto::Header {
      name: name.as_str().to_string(),
      value: String::from_utf8_lossy(value.as_bytes()).to_string(),
    });
  }
  if !host_present && !request.host().is_empty() {
    headers.push(proto::Header {
      name: "Host".to_string(),
      value: request.host().to_string(),
    });
  }
  proto::HttpRequest {
    id: request.id().to_string(),
    method: request.method().to_string(),
    url: request.uri().to_string(),
    headers,
    body: request
      .body()
      .map(|b| b.bytes().to_vec())
      .unwrap_or_default(),
  }
}

/// Rebuild a request from a plugin's modified message. The protocol version
/// carries over from the original; the identifier comes from the proto `id`
/// and falls back to the original's when unparsable.
pub fn request_from_proto(message: proto::HttpRequest, original: &Request) -> Result<Request> {
  let uri: http::Uri = message.url.parse()?;
  let method: Method = message.method.parse()?;
  let mut headers = HeaderMap::new();
  let mut host = String::new();
  for header in &message.headers {
    let name = HeaderName::from_bytes(header.name.as_bytes())?;
    let value = HeaderValue::from_str(&header.value)?;
    if name == http::header::HOST {
      host = header.value.clone();
    }
    if headers.contains_key(&name) {
      headers.append(name, value);
    } else {
      headers.insert(name, value);
    }
  }
  if host.is_empty() {
    host = uri
      .authority()
      .map(|a| a.to_string())
      .unwrap_or_else(|| original.host().to_string());
  }
  let id = Uuid::parse_str(&message.id).unwrap_or_else(|_| original.id());
  let body = if message.body.is_empty() {
    None
  } else {
    Some(Body::from(message.body))
  };
  Ok(Request::from_parts(
    id,
    method,
    uri,
    original.version(),
    headers,
    host,
    body,
  ))
}

/// Serialize a response for the RPC link.
pub fn response_to_proto(response: &Response) -> proto::HttpResponse {
  let headers = response
    .headers()
    .iter()
    .map(|(name, value)| proto::Header {
      name: name.as_str().to_string(),
      value: String::from_utf8_lossy(value.as_bytes()).to_string(),
    })
    .collect();
  proto::HttpResponse {
    id: response
      .id()
      .map(|id| id.to_string())
      .unwrap_or_default(),
    status_code: i32::from(response.status_code().as_u16()),
    headers,
    body: response
      .body()
      .map(|b| b.bytes().to_vec())
      .unwrap_or_default(),
  }
}

/// Rebuild a response from a plugin's modified message, keeping the
/// original's version and request back reference.
pub fn response_from_proto(message: proto::HttpResponse, original: &Response) -> Result<Response> {
  let status_code = StatusCode::from_u16(message.status_code as u16)?;
  let mut headers = HeaderMap::new();
  for header in &message.headers {
    let name = HeaderName::from_bytes(header.name.as_bytes())?;
    let value = HeaderValue::from_str(&header.value)?;
    if headers.contains_key(&name) {
      headers.append(name, value);
    } else {
      headers.insert(name, value);
    }
  }
  let body = if message.body.is_empty() {
    None
  } else {
    Some(Body::from(message.body))
  };
  let mut response = Response::from_parts(original.version(), status_code, headers, body);
  if let Some(mut request) = original.request().cloned() {
    if let Ok(id) = Uuid::parse_str(&message.id) {
      request.set_id(id);
    }
    response.set_request(request);
  }
  Ok(response)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn request_round_trip_preserves_id_and_multiplicity() {
    let mut request: Request = http::Request::builder()
      .method("POST")
      .uri("http://example.test/a")
      .header("X-Many", "1")
      .body(bytes::Bytes::from_static(b"data"))
      .unwrap()
      .into();
    request
      .headers_mut()
      .append("x-many", HeaderValue::from_static("2"));
    let id = request.id();

    let message = request_to_proto(&request);
    assert_eq!(message.id, id.to_string());
    assert!(message
      .headers
      .iter()
      .any(|h| h.name.eq_ignore_ascii_case("host") && h.value == "example.test"));
    assert_eq!(
      message
        .headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("x-many"))
        .count(),
      2
    );

    let rebuilt = request_from_proto(message, &request).unwrap();
    assert_eq!(rebuilt.id(), id);
    assert_eq!(rebuilt.method(), &Method::POST);
    assert_eq!(rebuilt.version(), request.version());
    assert_eq!(rebuilt.body().unwrap().bytes().as_ref(), b"data");
  }

  #[test]
  fn response_round_trip_keeps_request_back_reference() {
    let request = Request::default();
    let id = request.id();
    let mut response: Response = http::Response::builder()
      .status(404)
      .header("X-A", "1")
      .body(bytes::Bytes::from_static(b"missing"))
      .unwrap()
      .into();
    response.set_request(request);

    let message = response_to_proto(&response);
    assert_eq!(message.id, id.to_string());
    assert_eq!(message.status_code, 404);

    let rebuilt = response_from_proto(message, &response).unwrap();
    assert_eq!(rebuilt.id(), Some(id));
    assert_eq!(rebuilt.status_code(), StatusCode::NOT_FOUND);
  }

  #[test]
  fn unparsable_id_falls_back_to_original() {
    let request: Request = http::Request::builder()
      .uri("http://example.test/")
      .body(bytes::Bytes::new())
      .unwrap()
      .into();
    let mut message = request_to_proto(&request);
    message.id = "not-a-uuid".to_string();
    let rebuilt = request_from_proto(message, &request).unwrap();
    assert_eq!(rebuilt.id(), request.id());
  }
}
