//! Assembly of the effective hook configuration.
//!
//! `apply` is the single entry point for wiring hooks into the proxy, both
//! at startup and when a plugin calls `SetConfig`.

use std::sync::Arc;

use crate::errors::Result;
use crate::grpc::PluginServer;
use crate::hooks::{FileSaver, RawPrinter, SqliteRecorder, StripHeader};
use crate::pipeline::{ModHook, ReadOnlyHook};
use crate::proxy::ProxyServer;
use crate::request::Request;
use crate::response::Response;
use crate::scope::Scope;

/// The live configuration: persistence targets, scope, and the explicit
/// hook lists provided by the embedding program.
#[derive(Clone, Default)]
pub struct ProxyConfig {
  /// SQLite database path; empty disables recording.
  pub db_file: String,
  /// Raw-log every exchange to stdout.
  pub print_logs: bool,
  /// Directory for per-exchange dumps; empty disables them.
  pub save_dir: String,
  /// Host regex for the scope; empty matches every host.
  pub domain_regex: String,
  /// Extensions excluded from the scope (no leading dot).
  pub excluded_extensions: Vec<String>,
  /// Explicit `request_in` hooks.
  pub request_in_hooks: Vec<Arc<dyn ReadOnlyHook<Request>>>,
  /// Explicit `request_mod` hooks.
  pub request_mod_hooks: Vec<Arc<dyn ModHook<Request>>>,
  /// Explicit `request_out` hooks.
  pub request_out_hooks: Vec<Arc<dyn ReadOnlyHook<Request>>>,
  /// Explicit `response_in` hooks.
  pub response_in_hooks: Vec<Arc<dyn ReadOnlyHook<Response>>>,
  /// Explicit `response_mod` hooks.
  pub response_mod_hooks: Vec<Arc<dyn ModHook<Response>>>,
  /// Explicit `response_out` hooks.
  pub response_out_hooks: Vec<Arc<dyn ReadOnlyHook<Response>>>,
}

impl ProxyConfig {
  /// Assemble the effective hook vectors and install them, together with
  /// the scope, on the proxy. All six vectors swap atomically; on error
  /// nothing is installed.
  pub fn apply(&self, proxy: &ProxyServer, rpc: Option<&PluginServer>) -> Result<()> {
    // Validate the scope first so a bad pattern leaves everything as it was.
    let scope = Scope::from_config(&self.domain_regex, &self.excluded_extensions)?;

    let mut request_in = self.request_in_hooks.clone();
    let mut request_mod = self.request_mod_hooks.clone();
    let mut request_out = self.request_out_hooks.clone();
    let mut response_in = self.response_in_hooks.clone();
    let mut response_mod = self.response_mod_hooks.clone();
    let mut response_out = self.response_out_hooks.clone();

    if self.print_logs {
      let printer = Arc::new(RawPrinter);
      request_out.push(printer.clone() as Arc<dyn ReadOnlyHook<Request>>);
      response_in.push(printer as Arc<dyn ReadOnlyHook<Response>>);
      tracing::info!("raw request/response logging to stdout enabled");
    }

    request_mod.push(Arc::new(StripHeader::new(http::header::ACCEPT_ENCODING)));

    if !self.db_file.is_empty() {
      let recorder = Arc::new(SqliteRecorder::open(&self.db_file)?);
      request_out.push(recorder.clone() as Arc<dyn ReadOnlyHook<Request>>);
      response_in.push(recorder as Arc<dyn ReadOnlyHook<Response>>);
      tracing::info!(db_file = %self.db_file, "saving requests and responses to database");
    }

    if !self.save_dir.is_empty() {
      let saver = Arc::new(FileSaver::new(self.save_dir.as_str())?);
      request_out.push(saver.clone() as Arc<dyn ReadOnlyHook<Request>>);
      response_in.push(saver as Arc<dyn ReadOnlyHook<Response>>);
      tracing::info!(save_dir = %self.save_dir, "saving requests and responses to directory");
    }

    if let Some(rpc) = rpc {
      request_in.push(rpc.request_in_hook());
      request_mod.push(rpc.request_mod_hook());
      request_out.push(rpc.request_out_hook());
      response_in.push(rpc.response_in_hook());
      response_mod.push(rpc.response_mod_hook());
      response_out.push(rpc.response_out_hook());
    }

    proxy.set_scope(scope);
    let pipelines = proxy.pipelines();
    pipelines.request_in.set_hooks(request_in);
    pipelines.request_mod.set_hooks(request_mod);
    pipelines.request_out.set_hooks(request_out);
    pipelines.response_in.set_hooks(response_in);
    pipelines.response_mod.set_hooks(response_mod);
    pipelines.response_out.set_hooks(response_out);

    Ok(())
  }
}
