//! Shared keep-alive HTTP/1.1 client used to dispatch plaintext requests.
//!
//! Connections are pooled per scheme+authority and reused only when the
//! response framing permits it. Upstream TLS chains are deliberately not
//! validated; the proxy's trust boundary is the operator's Root CA.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::errors::{Error, Result};
use crate::request::Request;
use crate::response::{Response, ResponseReader};
use crate::tls;

/// A plain or TLS upstream stream.
pub(crate) enum MaybeTlsStream {
  Tcp(TcpStream),
  Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

struct PooledConn {
  reader: BufReader<MaybeTlsStream>,
}

/// The shared HTTP/1.1 forward client.
pub struct UpstreamClient {
  pool: Mutex<HashMap<String, Vec<PooledConn>>>,
  tls: Arc<ClientConfig>,
}

impl Default for UpstreamClient {
  fn default() -> Self {
    Self::new()
  }
}

impl UpstreamClient {
  /// Build a client that accepts any upstream certificate.
  pub fn new() -> Self {
    Self {
      pool: Mutex::new(HashMap::new()),
      tls: tls::insecure_client_config(),
    }
  }

  /// Send one request and read the complete response.
  ///
  /// A pooled connection is tried first; if writing or reading on it fails
  /// (the upstream may have closed an idle connection) one fresh attempt is
  /// made on a new dial.
  pub async fn send(&self, request: &Request) -> Result<Response> {
    let key = pool_key(request)?;
    if let Some(conn) = self.checkout(&key).await {
      match self.exchange(conn, request, &key).await {
        Ok(response) => return Ok(response),
        Err(error) => {
          tracing::debug!(%error, authority = %key, "pooled connection failed, redialing");
        }
      }
    }
    let conn = self.dial(request).await?;
    self.exchange(conn, request, &key).await
  }

  async fn exchange(
    &self,
    mut conn: PooledConn,
    request: &Request,
    key: &str,
  ) -> Result<Response> {
    conn.reader.get_mut().write_all(&request.to_raw()).await?;
    conn.reader.get_mut().flush().await?;
    let response = ResponseReader::new(&mut conn.reader, request.method().clone())
      .read()
      .await?;
    if response.keep_alive() && !request.connection_close() {
      self.checkin(key, conn).await;
    }
    Ok(response)
  }

  async fn checkout(&self, key: &str) -> Option<PooledConn> {
    let mut pool = self.pool.lock().await;
    pool.get_mut(key).and_then(|conns| conns.pop())
  }

  async fn checkin(&self, key: &str, conn: PooledConn) {
    let mut pool = self.pool.lock().await;
    pool.entry(key.to_string()).or_default().push(conn);
  }

  async fn dial(&self, request: &Request) -> Result<PooledConn> {
    let (scheme, host, port) = target_of(request)?;
    let stream = TcpStream::connect((host.as_str(), port))
      .await
      .map_err(|e| Error::connection(format!("failed to connect to {host}:{port}: {e}")))?;
    let stream = if scheme == "https" {
      let connector = TlsConnector::from(self.tls.clone());
      let server_name = ServerName::try_from(host.clone())
        .map_err(|_| Error::connection(format!("invalid server name: {host}")))?;
      let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::connection(format!("TLS handshake with {host} failed: {e}")))?;
      MaybeTlsStream::Tls(Box::new(tls_stream))
    } else {
      MaybeTlsStream::Tcp(stream)
    };
    Ok(PooledConn {
      reader: BufReader::new(stream),
    })
  }
}

fn pool_key(request: &Request) -> Result<String> {
  let (scheme, host, port) = target_of(request)?;
  Ok(format!("{scheme}://{host}:{port}"))
}

fn target_of(request: &Request) -> Result<(String, String, u16)> {
  let uri = request.uri();
  let scheme = uri.scheme_str().unwrap_or("http").to_string();
  let host = uri
    .host()
    .map(|h| h.to_string())
    .or_else(|| {
      let authority = request.host();
      if authority.is_empty() {
        None
      } else {
        Some(
          authority
            .rsplit_once(':')
            .map(|(h, _)| h.to_string())
            .unwrap_or_else(|| authority.to_string()),
        )
      }
    })
    .ok_or_else(|| Error::invalid_request("request has no target host"))?;
  let port = uri
    .port_u16()
    .unwrap_or(if scheme == "https" { 443 } else { 80 });
  Ok((scheme, host, port))
}
