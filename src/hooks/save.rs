//! Per-exchange raw dumps to a directory.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::{Error, Result};
use crate::pipeline::ReadOnlyHook;
use crate::request::Request;
use crate::response::Response;

/// Read-only hook that writes each message to
/// `request-<UUID>.txt` / `response-<UUID>.txt` as raw HTTP/1.1 bytes.
pub struct FileSaver {
  dir: PathBuf,
}

impl FileSaver {
  /// Save into `dir`, creating it when missing.
  pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
    let dir = dir.into();
    std::fs::create_dir_all(&dir)
      .map_err(|e| Error::config(format!("cannot create save directory {dir:?}: {e}")))?;
    Ok(Self { dir })
  }
}

#[async_trait]
impl ReadOnlyHook<Request> for FileSaver {
  async fn call(&self, request: Request) -> Result<()> {
    let path = self.dir.join(format!("request-{}.txt", request.id()));
    tokio::fs::write(path, request.to_raw()).await?;
    Ok(())
  }
}

#[async_trait]
impl ReadOnlyHook<Response> for FileSaver {
  async fn call(&self, response: Response) -> Result<()> {
    let id = response
      .id()
      .map(|id| id.to_string())
      .unwrap_or_else(|| "unknown".to_string());
    let path = self.dir.join(format!("response-{id}.txt"));
    tokio::fs::write(path, response.to_raw()).await?;
    Ok(())
  }
}
