//! The plugin RPC server.
//!
//! Read-only stages stream events to registered clients through bounded
//! inboxes; a slow client is evicted rather than stalling the pipeline.
//! Mutation stages walk the registered clients in name order, sending the
//! current message and waiting for the rewritten one. Configuration is
//! readable and replaceable at runtime; a replacement is applied atomically
//! or not at all.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request as TonicRequest, Response as TonicResponse, Status, Streaming};

use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::grpc::proto;
use crate::grpc::proto::proxy_service_server::{ProxyService, ProxyServiceServer};
use crate::grpc::{request_from_proto, request_to_proto, response_from_proto, response_to_proto};
use crate::pipeline::{ModHook, PipelineItem, ReadOnlyHook};
use crate::proxy::ProxyServer;
use crate::request::Request;
use crate::response::Response;

const CLIENT_INBOX_CAPACITY: usize = 1024;
const EVICTION_GRACE: Duration = Duration::from_secs(60);

struct ReadOnlyClient<T> {
  name: String,
  inbox: mpsc::Sender<T>,
  ack: AsyncMutex<mpsc::Receiver<bool>>,
}

struct ModChannels<T> {
  inbox: mpsc::Sender<T>,
  outbox: mpsc::Receiver<Option<T>>,
}

struct ModClient<T> {
  name: String,
  channels: AsyncMutex<ModChannels<T>>,
}

/// Per-stage client registry. Names are unique within a stage; a snapshot
/// yields clients in name order so mutation sequences are deterministic.
struct Registry<C> {
  stage: &'static str,
  clients: Mutex<HashMap<String, Arc<C>>>,
}

impl<C: Send + Sync + 'static> Registry<C> {
  fn new(stage: &'static str) -> Arc<Self> {
    Arc::new(Self {
      stage,
      clients: Mutex::new(HashMap::new()),
    })
  }

  fn register(&self, name: &str, client: Arc<C>) -> std::result::Result<(), Status> {
    let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
    if clients.contains_key(name) {
      return Err(Status::already_exists("already registered"));
    }
    tracing::info!(stage = self.stage, client = name, "client registered");
    clients.insert(name.to_string(), client);
    Ok(())
  }

  fn remove(&self, name: &str) -> Option<Arc<C>> {
    let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
    let removed = clients.remove(name);
    if removed.is_some() {
      tracing::info!(stage = self.stage, client = name, "client unregistered");
    }
    removed
  }

  /// Remove the client now; release its channels after a grace period so
  /// the peer sees the stream close instead of an abrupt reset.
  fn evict_after_grace(&self, name: &str) {
    if let Some(client) = self.remove(name) {
      tokio::spawn(async move {
        tokio::time::sleep(EVICTION_GRACE).await;
        drop(client);
      });
    }
  }

  fn snapshot(&self) -> Vec<Arc<C>> {
    let clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
    let mut entries: Vec<_> = clients
      .iter()
      .map(|(name, client)| (name.clone(), client.clone()))
      .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.into_iter().map(|(_, client)| client).collect()
  }
}

struct ReadOnlyStageHook<T> {
  registry: Arc<Registry<ReadOnlyClient<T>>>,
}

#[async_trait]
impl<T: PipelineItem> ReadOnlyHook<T> for ReadOnlyStageHook<T> {
  async fn call(&self, item: T) -> Result<()> {
    for client in self.registry.snapshot() {
      match client.inbox.try_send(item.clone()) {
        Ok(()) => {
          let registry = self.registry.clone();
          tokio::spawn(async move {
            let ack = {
              let mut rx = client.ack.lock().await;
              rx.recv().await
            };
            if !matches!(ack, Some(true)) {
              registry.remove(&client.name);
            }
          });
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
          tracing::warn!(
            stage = self.registry.stage,
            client = %client.name,
            "inbox full, client evicted"
          );
          self.registry.evict_after_grace(&client.name);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
          self.registry.remove(&client.name);
        }
      }
    }
    Ok(())
  }
}

struct ModStageHook<T> {
  registry: Arc<Registry<ModClient<T>>>,
}

#[async_trait]
impl<T: PipelineItem> ModHook<T> for ModStageHook<T> {
  async fn call(&self, mut item: T) -> Result<T> {
    for client in self.registry.snapshot() {
      let mut channels = client.channels.lock().await;
      match channels.inbox.try_send(item.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
          tracing::warn!(
            stage = self.registry.stage,
            client = %client.name,
            "inbox full, client evicted"
          );
          drop(channels);
          self.registry.evict_after_grace(&client.name);
          continue;
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
          drop(channels);
          self.registry.remove(&client.name);
          continue;
        }
      }
      match channels.outbox.recv().await {
        Some(Some(modified)) => item = modified,
        Some(None) | None => {
          tracing::warn!(
            stage = self.registry.stage,
            client = %client.name,
            "empty response, client evicted"
          );
          drop(channels);
          self.registry.evict_after_grace(&client.name);
        }
      }
    }
    Ok(item)
  }
}

/// The plugin RPC server. Cheap to clone; every clone shares the registries
/// and configuration.
#[derive(Clone)]
pub struct PluginServer {
  proxy: Arc<ProxyServer>,
  config: Arc<RwLock<ProxyConfig>>,
  request_in: Arc<Registry<ReadOnlyClient<Request>>>,
  request_mod: Arc<Registry<ModClient<Request>>>,
  request_out: Arc<Registry<ReadOnlyClient<Request>>>,
  response_in: Arc<Registry<ReadOnlyClient<Response>>>,
  response_mod: Arc<Registry<ModClient<Response>>>,
  response_out: Arc<Registry<ReadOnlyClient<Response>>>,
}

impl PluginServer {
  /// Build the server around the proxy it configures.
  pub fn new(proxy: Arc<ProxyServer>, config: ProxyConfig) -> Self {
    Self {
      proxy,
      config: Arc::new(RwLock::new(config)),
      request_in: Registry::new("request_in"),
      request_mod: Registry::new("request_mod"),
      request_out: Registry::new("request_out"),
      response_in: Registry::new("response_in"),
      response_mod: Registry::new("response_mod"),
      response_out: Registry::new("response_out"),
    }
  }

  /// Pipeline hook feeding the `request_in` plugin clients.
  pub fn request_in_hook(&self) -> Arc<dyn ReadOnlyHook<Request>> {
    Arc::new(ReadOnlyStageHook {
      registry: self.request_in.clone(),
    })
  }

  /// Pipeline hook applying `request_mod` plugin rewrites.
  pub fn request_mod_hook(&self) -> Arc<dyn ModHook<Request>> {
    Arc::new(ModStageHook {
      registry: self.request_mod.clone(),
    })
  }

  /// Pipeline hook feeding the `request_out` plugin clients.
  pub fn request_out_hook(&self) -> Arc<dyn ReadOnlyHook<Request>> {
    Arc::new(ReadOnlyStageHook {
      registry: self.request_out.clone(),
    })
  }

  /// Pipeline hook feeding the `response_in` plugin clients.
  pub fn response_in_hook(&self) -> Arc<dyn ReadOnlyHook<Response>> {
    Arc::new(ReadOnlyStageHook {
      registry: self.response_in.clone(),
    })
  }

  /// Pipeline hook applying `response_mod` plugin rewrites.
  pub fn response_mod_hook(&self) -> Arc<dyn ModHook<Response>> {
    Arc::new(ModStageHook {
      registry: self.response_mod.clone(),
    })
  }

  /// Pipeline hook feeding the `response_out` plugin clients.
  pub fn response_out_hook(&self) -> Arc<dyn ReadOnlyHook<Response>> {
    Arc::new(ReadOnlyStageHook {
      registry: self.response_out.clone(),
    })
  }

  /// Bind `addr` and serve until the process exits.
  pub async fn serve(self, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::proxy(format!("failed to bind RPC address {addr}: {e}")))?;
    self.serve_with_listener(listener).await
  }

  /// Serve from an already-bound listener.
  pub async fn serve_with_listener(self, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "starting plugin RPC server");
    let service = ProxyServiceServer::new(self)
      .max_decoding_message_size(crate::grpc::MAX_MESSAGE_SIZE)
      .max_encoding_message_size(crate::grpc::MAX_MESSAGE_SIZE);
    Server::builder()
      .add_service(service)
      .serve_with_incoming(TcpListenerStream::new(listener))
      .await
      .map_err(|e| Error::proxy(format!("RPC server failed: {e}")))
  }
}

type ReadOnlyStream<P> = ReceiverStream<std::result::Result<P, Status>>;

fn serve_read_only<T, P>(
  registry: &Arc<Registry<ReadOnlyClient<T>>>,
  register: proto::Register,
  to_proto: fn(&T) -> P,
) -> std::result::Result<TonicResponse<ReadOnlyStream<P>>, Status>
where
  T: PipelineItem,
  P: Send + 'static,
{
  let name = register.name;
  if name.is_empty() {
    return Err(Status::invalid_argument("client name required"));
  }
  let (inbox_tx, mut inbox_rx) = mpsc::channel::<T>(CLIENT_INBOX_CAPACITY);
  let (ack_tx, ack_rx) = mpsc::channel::<bool>(1);
  let client = Arc::new(ReadOnlyClient {
    name: name.clone(),
    inbox: inbox_tx,
    ack: AsyncMutex::new(ack_rx),
  });
  registry.register(&name, client)?;

  let (out_tx, out_rx) = mpsc::channel::<std::result::Result<P, Status>>(1);
  let registry = registry.clone();
  tokio::spawn(async move {
    while let Some(item) = inbox_rx.recv().await {
      if out_tx.send(Ok(to_proto(&item))).await.is_err() {
        break;
      }
      if ack_tx.send(true).await.is_err() {
        break;
      }
    }
    registry.remove(&name);
  });
  Ok(TonicResponse::new(ReceiverStream::new(out_rx)))
}

#[tonic::async_trait]
impl ProxyService for PluginServer {
  type RequestInStream = ReadOnlyStream<proto::HttpRequest>;
  type RequestModStream = ReadOnlyStream<proto::HttpRequest>;
  type RequestOutStream = ReadOnlyStream<proto::HttpRequest>;
  type ResponseInStream = ReadOnlyStream<proto::HttpResponse>;
  type ResponseModStream = ReadOnlyStream<proto::HttpResponse>;
  type ResponseOutStream = ReadOnlyStream<proto::HttpResponse>;

  async fn request_in(
    &self,
    request: TonicRequest<proto::Register>,
  ) -> std::result::Result<TonicResponse<Self::RequestInStream>, Status> {
    serve_read_only(&self.request_in, request.into_inner(), request_to_proto)
  }

  async fn request_out(
    &self,
    request: TonicRequest<proto::Register>,
  ) -> std::result::Result<TonicResponse<Self::RequestOutStream>, Status> {
    serve_read_only(&self.request_out, request.into_inner(), request_to_proto)
  }

  async fn response_in(
    &self,
    request: TonicRequest<proto::Register>,
  ) -> std::result::Result<TonicResponse<Self::ResponseInStream>, Status> {
    serve_read_only(&self.response_in, request.into_inner(), response_to_proto)
  }

  async fn response_out(
    &self,
    request: TonicRequest<proto::Register>,
  ) -> std::result::Result<TonicResponse<Self::ResponseOutStream>, Status> {
    serve_read_only(&self.response_out, request.into_inner(), response_to_proto)
  }

  async fn request_mod(
    &self,
    request: TonicRequest<Streaming<proto::RequestModClientMessage>>,
  ) -> std::result::Result<TonicResponse<Self::RequestModStream>, Status> {
    use proto::request_mod_client_message::Msg;

    let mut stream = request.into_inner();
    let first = stream
      .message()
      .await?
      .ok_or_else(|| Status::invalid_argument("expected register message"))?;
    let Some(Msg::Register(register)) = first.msg else {
      return Err(Status::invalid_argument("expected register message"));
    };
    let name = register.name;
    if name.is_empty() {
      return Err(Status::invalid_argument("client name required"));
    }

    let (inbox_tx, mut inbox_rx) = mpsc::channel::<Request>(CLIENT_INBOX_CAPACITY);
    let (outbox_tx, outbox_rx) = mpsc::channel::<Option<Request>>(1);
    let client = Arc::new(ModClient {
      name: name.clone(),
      channels: AsyncMutex::new(ModChannels {
        inbox: inbox_tx,
        outbox: outbox_rx,
      }),
    });
    self.request_mod.register(&name, client)?;

    let (out_tx, out_rx) = mpsc::channel(1);
    let registry = self.request_mod.clone();
    tokio::spawn(async move {
      while let Some(original) = inbox_rx.recv().await {
        if out_tx.send(Ok(request_to_proto(&original))).await.is_err() {
          break;
        }
        let reply = match stream.message().await {
          Ok(Some(proto::RequestModClientMessage {
            msg: Some(Msg::ModifiedRequest(message)),
          })) => match request_from_proto(message, &original) {
            Ok(modified) => Some(modified),
            Err(error) => {
              tracing::warn!(%error, "client sent an invalid request");
              None
            }
          },
          Ok(_) => None,
          Err(error) => {
            tracing::warn!(%error, "request mod stream error");
            None
          }
        };
        let ended = reply.is_none();
        if outbox_tx.send(reply).await.is_err() || ended {
          break;
        }
      }
      registry.remove(&name);
    });
    Ok(TonicResponse::new(ReceiverStream::new(out_rx)))
  }

  async fn response_mod(
    &self,
    request: TonicRequest<Streaming<proto::ResponseModClientMessage>>,
  ) -> std::result::Result<TonicResponse<Self::ResponseModStream>, Status> {
    use proto::response_mod_client_message::Msg;

    let mut stream = request.into_inner();
    let first = stream
      .message()
      .await?
      .ok_or_else(|| Status::invalid_argument("expected register message"))?;
    let Some(Msg::Register(register)) = first.msg else {
      return Err(Status::invalid_argument("expected register message"));
    };
    let name = register.name;
    if name.is_empty() {
      return Err(Status::invalid_argument("client name required"));
    }

    let (inbox_tx, mut inbox_rx) = mpsc::channel::<Response>(CLIENT_INBOX_CAPACITY);
    let (outbox_tx, outbox_rx) = mpsc::channel::<Option<Response>>(1);
    let client = Arc::new(ModClient {
      name: name.clone(),
      channels: AsyncMutex::new(ModChannels {
        inbox: inbox_tx,
        outbox: outbox_rx,
      }),
    });
    self.response_mod.register(&name, client)?;

    let (out_tx, out_rx) = mpsc::channel(1);
    let registry = self.response_mod.clone();
    tokio::spawn(async move {
      while let Some(original) = inbox_rx.recv().await {
        if out_tx.send(Ok(response_to_proto(&original))).await.is_err() {
          break;
        }
        let reply = match stream.message().await {
          Ok(Some(proto::ResponseModClientMessage {
            msg: Some(Msg::ModifiedResponse(message)),
          })) => match response_from_proto(message, &original) {
            Ok(modified) => Some(modified),
            Err(error) => {
              tracing::warn!(%error, "client sent an invalid response");
              None
            }
          },
          Ok(_) => None,
          Err(error) => {
            tracing::warn!(%error, "response mod stream error");
            None
          }
        };
        let ended = reply.is_none();
        if outbox_tx.send(reply).await.is_err() || ended {
          break;
        }
      }
      registry.remove(&name);
    });
    Ok(TonicResponse::new(ReceiverStream::new(out_rx)))
  }

  async fn get_config(
    &self,
    _request: TonicRequest<proto::Null>,
  ) -> std::result::Result<TonicResponse<proto::Config>, Status> {
    let config = self.config.read().await;
    Ok(TonicResponse::new(proto::Config {
      db_file: config.db_file.clone(),
      print_logs: config.print_logs,
      save_dir: config.save_dir.clone(),
      scope_domain_regex: config.domain_regex.clone(),
      scope_excluded_extensions: config.excluded_extensions.clone(),
    }))
  }

  async fn set_config(
    &self,
    request: TonicRequest<proto::Config>,
  ) -> std::result::Result<TonicResponse<proto::Null>, Status> {
    let incoming = request.into_inner();
    let mut config = self.config.write().await;
    let mut candidate = config.clone();
    candidate.db_file = incoming.db_file;
    candidate.print_logs = incoming.print_logs;
    candidate.save_dir = incoming.save_dir;
    candidate.domain_regex = incoming.scope_domain_regex;
    candidate.excluded_extensions = incoming.scope_excluded_extensions;
    // The previous configuration stays in effect when apply fails.
    candidate
      .apply(&self.proxy, Some(self))
      .map_err(|e| Status::invalid_argument(e.to_string()))?;
    *config = candidate;
    Ok(TonicResponse::new(proto::Null {}))
  }
}
