//! Built-in pipeline hooks: raw logging, file dumps, SQLite recording and
//! header stripping.

mod db;
mod print;
mod save;

pub use db::SqliteRecorder;
pub use print::RawPrinter;
pub use save::FileSaver;

use async_trait::async_trait;
use http::HeaderName;

use crate::errors::Result;
use crate::pipeline::ModHook;
use crate::request::Request;

/// Mutation hook that removes one header from every request.
///
/// The assembly layer always appends a strip of `Accept-Encoding` so
/// upstreams reply uncompressed and bodies stay inspectable.
pub struct StripHeader {
  name: HeaderName,
}

impl StripHeader {
  /// Strip `name` from requests passing through.
  pub fn new(name: HeaderName) -> Self {
    Self { name }
  }
}

#[async_trait]
impl ModHook<Request> for StripHeader {
  async fn call(&self, mut request: Request) -> Result<Request> {
    request.headers_mut().remove(&self.name);
    Ok(request)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pipeline::ModHook;

  #[tokio::test]
  async fn strips_the_named_header() {
    let mut request: Request = http::Request::builder()
      .uri("http://h.test/")
      .header("Accept-Encoding", "gzip")
      .header("X-Keep", "1")
      .body(bytes::Bytes::new())
      .unwrap()
      .into();
    request.headers_mut().append(
      http::header::ACCEPT_ENCODING,
      http::HeaderValue::from_static("br"),
    );

    let hook = StripHeader::new(http::header::ACCEPT_ENCODING);
    let request = hook.call(request).await.unwrap();
    assert!(request.headers().get(http::header::ACCEPT_ENCODING).is_none());
    assert!(request.headers().get("x-keep").is_some());
  }
}
