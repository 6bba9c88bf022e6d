//! The proxy engine: plaintext forwarding, CONNECT MITM, WebSocket
//! passthrough.
//!
//! Every connection runs in its own task. A CONNECT tunnel moves through
//! dial → established → per-request forwarding, and degrades to a raw byte
//! splice when the client asks for a WebSocket upgrade. Pipeline stages for
//! one exchange always run in order: request_in, request_mod, request_out,
//! upstream, response_in, response_mod, client write, response_out.

use std::sync::{Arc, PoisonError, RwLock};

use http::Method;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::certs::{CertificateStore, RootAuthority};
use crate::errors::{Error, Result};
use crate::pipeline::Pipelines;
use crate::request::{Request, RequestReader};
use crate::response::ResponseReader;
use crate::scope::Scope;
use crate::tls;
use crate::upstream::UpstreamClient;
use crate::websocket::is_websocket_upgrade;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const PIPELINE_FAILED: &[u8] =
  b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// The intercepting proxy server.
pub struct ProxyServer {
  scope: RwLock<Arc<Scope>>,
  pipelines: Pipelines,
  certs: CertificateStore,
  client: UpstreamClient,
}

impl ProxyServer {
  /// Build a proxy around a signing root. Pipelines start empty and the
  /// scope admits everything until [`crate::ProxyConfig::apply`] runs.
  /// Spawns the stage workers, so it must be called inside a Tokio runtime.
  pub fn new(authority: RootAuthority) -> Self {
    Self {
      scope: RwLock::new(Arc::new(Scope::default())),
      pipelines: Pipelines::new(),
      certs: CertificateStore::new(authority),
      client: UpstreamClient::new(),
    }
  }

  /// The six pipeline stages.
  pub fn pipelines(&self) -> &Pipelines {
    &self.pipelines
  }

  /// The leaf certificate store.
  pub fn certificate_store(&self) -> &CertificateStore {
    &self.certs
  }

  /// Install a new scope predicate. In-flight exchanges keep the one they
  /// started with.
  pub fn set_scope(&self, scope: Scope) {
    let mut guard = self.scope.write().unwrap_or_else(PoisonError::into_inner);
    *guard = Arc::new(scope);
  }

  fn scope(&self) -> Arc<Scope> {
    self
      .scope
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Bind `addr` and serve until the process exits.
  pub async fn run(self: Arc<Self>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::proxy(format!("failed to bind {addr}: {e}")))?;
    self.serve(listener).await
  }

  /// Serve connections from an already-bound listener.
  pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          let proxy = self.clone();
          tokio::spawn(async move {
            if let Err(error) = proxy.handle_connection(stream).await {
              tracing::debug!(%peer, %error, "connection ended with error");
            }
          });
        }
        Err(error) => {
          tracing::error!(%error, "failed to accept connection");
        }
      }
    }
  }

  async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
      let request = match RequestReader::new(&mut reader).read().await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(error) => {
          reader.get_mut().write_all(PIPELINE_FAILED).await.ok();
          return Err(error);
        }
      };
      if request.method() == Method::CONNECT {
        let stream = reader.into_inner();
        return self.handle_connect(stream, request).await;
      }
      let close = request.connection_close();
      let reused = self.handle_plain(&mut reader, request).await?;
      if close || !reused {
        return Ok(());
      }
    }
  }

  /// Forward one plaintext exchange. Returns whether the client connection
  /// can carry another request.
  async fn handle_plain<S>(&self, reader: &mut BufReader<S>, request: Request) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let in_scope = self.scope().is_in_scope(&request);
    let final_request = if in_scope {
      match self.run_request_stages(request).await {
        Ok(request) => request,
        Err(_) => {
          reader.get_mut().write_all(PIPELINE_FAILED).await?;
          return Ok(false);
        }
      }
    } else {
      request
    };

    let mut response = match self.client.send(&final_request).await {
      Ok(response) => response,
      Err(error) => {
        tracing::error!(%error, "error forwarding request");
        reader.get_mut().write_all(BAD_GATEWAY).await?;
        return Ok(false);
      }
    };
    response.set_request(final_request);

    if in_scope {
      self.pipelines.response_in.run(&response).await;
      let response = match self.pipelines.response_mod.run(response).await {
        Ok(response) => response,
        Err(_) => {
          reader.get_mut().write_all(PIPELINE_FAILED).await?;
          return Ok(false);
        }
      };
      let reusable = response.keep_alive();
      reader.get_mut().write_all(&response.to_raw()).await?;
      reader.get_mut().flush().await?;
      self.pipelines.response_out.run(&response).await;
      Ok(reusable)
    } else {
      let reusable = response.keep_alive();
      reader.get_mut().write_all(&response.to_raw()).await?;
      reader.get_mut().flush().await?;
      Ok(reusable)
    }
  }

  async fn run_request_stages(&self, request: Request) -> Result<Request> {
    self.pipelines.request_in.run(&request).await;
    let request = self.pipelines.request_mod.run(request).await?;
    self.pipelines.request_out.run(&request).await;
    Ok(request)
  }

  /// Establish a MITM tunnel for a CONNECT request and loop over the
  /// decrypted exchanges inside it.
  async fn handle_connect(self: Arc<Self>, mut stream: TcpStream, connect: Request) -> Result<()> {
    // The outer CONNECT gets its own identifier but never enters the
    // pipelines.
    let tunnel_id = connect.id();
    let authority = connect.host().to_string();
    let (host, port) = split_authority(&authority);

    let upstream_tcp = match TcpStream::connect((host.as_str(), port)).await {
      Ok(stream) => stream,
      Err(error) => {
        tracing::error!(%error, authority = %authority, "CONNECT dial failed");
        stream.write_all(BAD_GATEWAY).await.ok();
        return Ok(());
      }
    };

    stream.write_all(CONNECT_ESTABLISHED).await?;
    stream.flush().await?;

    let identity = self.certs.issue(&host)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(identity)?));
    let client_tls = acceptor
      .accept(stream)
      .await
      .map_err(|e| Error::proxy(format!("client TLS handshake failed: {e}")))?;

    let connector = TlsConnector::from(tls::insecure_client_config());
    let server_name = ServerName::try_from(host.clone())
      .map_err(|_| Error::connection(format!("invalid server name: {host}")))?;
    let upstream_tls = connector
      .connect(server_name, upstream_tcp)
      .await
      .map_err(|e| Error::connection(format!("upstream TLS handshake failed: {e}")))?;

    tracing::debug!(tunnel = %tunnel_id, authority = %authority, "tunnel established");

    let mut client_reader = BufReader::new(client_tls);
    let mut upstream_reader = BufReader::new(upstream_tls);

    loop {
      let request = match RequestReader::with_origin(&mut client_reader, "https", authority.clone())
        .read()
        .await
      {
        Ok(Some(request)) => request,
        Ok(None) => break,
        Err(error) => {
          tracing::debug!(%error, "error reading request from tunnel");
          break;
        }
      };

      if is_websocket_upgrade(&request) {
        tracing::debug!(uri = %request.uri(), "WebSocket upgrade, switching to passthrough");
        upstream_reader.get_mut().write_all(&request.to_raw()).await?;
        upstream_reader.get_mut().flush().await?;
        let _ = tokio::io::copy_bidirectional(&mut client_reader, &mut upstream_reader).await;
        break;
      }

      let in_scope = self.scope().is_in_scope(&request);
      let final_request = if in_scope {
        match self.run_request_stages(request).await {
          Ok(request) => request,
          Err(_) => {
            client_reader.get_mut().write_all(PIPELINE_FAILED).await.ok();
            break;
          }
        }
      } else {
        request
      };

      upstream_reader
        .get_mut()
        .write_all(&final_request.to_raw())
        .await?;
      upstream_reader.get_mut().flush().await?;

      let mut response =
        match ResponseReader::new(&mut upstream_reader, final_request.method().clone())
          .read()
          .await
        {
          Ok(response) => response,
          Err(error) => {
            tracing::debug!(%error, "error reading response from upstream");
            break;
          }
        };
      response.set_request(final_request);

      if in_scope {
        self.pipelines.response_in.run(&response).await;
        let response = match self.pipelines.response_mod.run(response).await {
          Ok(response) => response,
          Err(_) => {
            client_reader.get_mut().write_all(PIPELINE_FAILED).await.ok();
            break;
          }
        };
        client_reader.get_mut().write_all(&response.to_raw()).await?;
        client_reader.get_mut().flush().await?;
        self.pipelines.response_out.run(&response).await;
      } else {
        client_reader.get_mut().write_all(&response.to_raw()).await?;
        client_reader.get_mut().flush().await?;
      }
    }

    // Dropping both sides closes the TLS sessions and the TCP streams.
    Ok(())
  }
}

fn split_authority(authority: &str) -> (String, u16) {
  match authority.rsplit_once(':') {
    Some((host, port)) => match port.parse::<u16>() {
      Ok(port) => (host.to_string(), port),
      Err(_) => (authority.to_string(), 443),
    },
    None => (authority.to_string(), 443),
  }
}
