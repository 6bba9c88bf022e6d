//! The plugin RPC surface: external processes observe and rewrite traffic
//! over six streaming endpoints, one per pipeline stage, plus live
//! configuration access.

mod convert;
mod server;

pub use convert::{request_from_proto, request_to_proto, response_from_proto, response_to_proto};
pub use server::PluginServer;

/// Generated protobuf and tonic types for the plugin protocol.
pub mod proto {
  #![allow(missing_docs)]
  tonic::include_proto!("vibes");
}

/// Maximum in-flight RPC message size, both directions (1 GiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;
