//! Raw request/response logging to stdout.

use std::io::Write;

use async_trait::async_trait;

use crate::errors::Result;
use crate::pipeline::ReadOnlyHook;
use crate::request::Request;
use crate::response::Response;

/// Read-only hook that prints each message as framed raw HTTP on stdout.
///
/// stdout is reserved for these frames (and the generated Root CA PEMs);
/// diagnostics go to stderr via `tracing`.
pub struct RawPrinter;

fn print_framed(kind: &str, id: &str, raw: &[u8]) -> Result<()> {
  let header = format!("---------- PROXY-VIBES {kind} START: {id} ----------\r\n");
  let footer = format!("---------- PROXY-VIBES {kind} END: {id} ----------\r\n");
  let mut frame = Vec::with_capacity(header.len() + raw.len() + footer.len());
  frame.extend_from_slice(header.as_bytes());
  frame.extend_from_slice(raw);
  frame.extend_from_slice(footer.as_bytes());
  let mut stdout = std::io::stdout().lock();
  stdout.write_all(&frame)?;
  stdout.flush()?;
  Ok(())
}

#[async_trait]
impl ReadOnlyHook<Request> for RawPrinter {
  async fn call(&self, request: Request) -> Result<()> {
    print_framed("REQUEST", &request.id().to_string(), &request.to_raw())
  }
}

#[async_trait]
impl ReadOnlyHook<Response> for RawPrinter {
  async fn call(&self, response: Response) -> Result<()> {
    let id = response
      .id()
      .map(|id| id.to_string())
      .unwrap_or_else(|| "unknown".to_string());
    print_framed("RESPONSE", &id, &response.to_raw())
  }
}
