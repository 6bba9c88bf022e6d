//! # proxy-vibes
//!
//! An intercepting HTTP/HTTPS proxy for developers and security
//! researchers. Clients configure it as a forward proxy; plaintext HTTP is
//! forwarded directly, HTTPS is man-in-the-middled by minting a leaf
//! certificate for the target host signed by a user-controlled Root CA, and
//! WebSocket upgrades are passed through untouched.
//!
//! Every in-scope exchange traverses six hook stages, three per direction:
//! `request_in`, `request_mod`, `request_out`, `response_in`,
//! `response_mod`, `response_out`. Read-only stages fan out over clones of
//! the message and can never fail the exchange; mutation stages run
//! sequentially and abort it with a 500 on error. External processes attach
//! to any stage over a gRPC interface to observe or rewrite traffic and to
//! change the live configuration.
//!
//! ## Running the proxy
//!
//! ```no_run
//! use std::sync::Arc;
//! use proxy_vibes::{ProxyConfig, ProxyServer, RootAuthority};
//!
//! #[tokio::main]
//! async fn main() -> proxy_vibes::Result<()> {
//!   let (authority, _cert_pem, _key_pem) = RootAuthority::generate()?;
//!   let proxy = Arc::new(ProxyServer::new(authority));
//!   ProxyConfig::default().apply(&proxy, None)?;
//!   proxy.run("127.0.0.1:8669").await
//! }
//! ```

mod body;
mod certs;
mod config;
mod errors;
/// gRPC plugin interface.
pub mod grpc;
/// Built-in collaborator hooks.
pub mod hooks;
mod pipeline;
mod proxy;
mod request;
mod response;
mod scope;
mod tls;
mod upstream;
mod websocket;

pub use body::Body;
pub use certs::{CertificateStore, RootAuthority, TlsIdentity};
pub use config::ProxyConfig;
pub use errors::{Error, Result};
pub use grpc::PluginServer;
pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use pipeline::{
  mod_fn, read_only_fn, ModHook, ModPipeline, PipelineItem, Pipelines, ReadOnlyHook,
  ReadOnlyPipeline,
};
pub use proxy::ProxyServer;
pub use request::{Request, RequestReader};
pub use response::{Response, ResponseReader};
pub use scope::Scope;
pub use upstream::UpstreamClient;
pub use websocket::is_websocket_upgrade;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
