//! WebSocket upgrade detection.

use crate::request::Request;

/// Whether the request asks for a WebSocket upgrade.
///
/// True when `Upgrade` equals `websocket` and `Connection` contains the
/// `upgrade` token, both compared ASCII case-insensitively. Any other upgrade
/// target is treated as normal HTTP.
pub fn is_websocket_upgrade(request: &Request) -> bool {
  let upgrade = request
    .headers()
    .get(http::header::UPGRADE)
    .and_then(|v| v.to_str().ok())
    .unwrap_or_default();
  let connection = request
    .headers()
    .get(http::header::CONNECTION)
    .and_then(|v| v.to_str().ok())
    .unwrap_or_default();
  upgrade.eq_ignore_ascii_case("websocket") && connection.to_ascii_lowercase().contains("upgrade")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::Request;
  use http::HeaderValue;

  fn request_with(upgrade: Option<&str>, connection: Option<&str>) -> Request {
    let mut request: Request = http::Request::builder()
      .uri("https://h.test/ws")
      .body(bytes::Bytes::new())
      .unwrap()
      .into();
    if let Some(u) = upgrade {
      request
        .headers_mut()
        .insert(http::header::UPGRADE, HeaderValue::from_str(u).unwrap());
    }
    if let Some(c) = connection {
      request
        .headers_mut()
        .insert(http::header::CONNECTION, HeaderValue::from_str(c).unwrap());
    }
    request
  }

  #[test]
  fn detects_standard_upgrade() {
    assert!(is_websocket_upgrade(&request_with(
      Some("websocket"),
      Some("Upgrade")
    )));
  }

  #[test]
  fn detection_is_case_insensitive() {
    assert!(is_websocket_upgrade(&request_with(
      Some("WebSocket"),
      Some("keep-alive, UPGRADE")
    )));
    assert!(is_websocket_upgrade(&request_with(
      Some("WEBSOCKET"),
      Some("upgrade")
    )));
  }

  #[test]
  fn requires_both_headers() {
    assert!(!is_websocket_upgrade(&request_with(Some("websocket"), None)));
    assert!(!is_websocket_upgrade(&request_with(None, Some("upgrade"))));
    assert!(!is_websocket_upgrade(&request_with(None, None)));
  }

  #[test]
  fn other_upgrade_targets_are_plain_http() {
    assert!(!is_websocket_upgrade(&request_with(
      Some("h2c"),
      Some("upgrade")
    )));
  }
}
