use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use proxy_vibes::{Error, PluginServer, ProxyConfig, ProxyServer, RootAuthority};

/// Intercepting HTTP/HTTPS proxy with hook pipelines and gRPC plugins.
#[derive(Parser, Debug)]
#[command(name = "proxy-vibes", version, about)]
struct Args {
  /// Local address where the proxy listens for connections
  #[arg(short = 'l', long, default_value = "127.0.0.1:8669")]
  local_addr: String,

  /// Plugin RPC listen address; empty disables the RPC server
  #[arg(short = 'g', long, default_value = "127.0.0.1:8670")]
  grpc_addr: String,

  /// Path to the Root CA certificate file (PEM)
  #[arg(short = 'c', long, requires = "key")]
  cert: Option<PathBuf>,

  /// Path to the Root CA private key file (PKCS#8 PEM)
  #[arg(short = 'k', long, requires = "cert")]
  key: Option<PathBuf>,

  /// Regex scope over request hosts
  #[arg(short = 's', long, default_value = ".*")]
  scope: String,

  /// File extensions excluded from scope, ','-separated (no dot)
  #[arg(short = 'E', long, default_value = "png|gif|jpeg|jpg|aac|ts")]
  exclude_extensions: String,

  /// Print each request and response in raw HTTP format to stdout
  #[arg(short = 'p', long)]
  print: bool,

  /// Save each request and response to files in this directory
  #[arg(short = 'd', long)]
  save_directory: Option<PathBuf>,

  /// Save requests and responses in the specified SQLite database file
  #[arg(short = 'D', long)]
  db_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> proxy_vibes::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  let authority = match (&args.cert, &args.key) {
    (Some(cert), Some(key)) => {
      let authority = RootAuthority::load(cert, key)?;
      info!("loaded Root CA from {} and {}", cert.display(), key.display());
      authority
    }
    _ => {
      let (authority, cert_pem, key_pem) = RootAuthority::generate()?;
      println!("Generated new Root CA:");
      println!("=== Proxy Root CA Certificate (Save this to a .crt file) ===");
      println!("{cert_pem}");
      println!("=== End of Certificate ===");
      println!("=== Proxy Root CA Private Key (Save this to a .key file) ===");
      println!("{key_pem}");
      println!("=== End of Private Key ===");
      authority
    }
  };

  let proxy = Arc::new(ProxyServer::new(authority));

  let config = ProxyConfig {
    db_file: args
      .db_file
      .map(|p| p.display().to_string())
      .unwrap_or_default(),
    print_logs: args.print,
    save_dir: args
      .save_directory
      .map(|p| p.display().to_string())
      .unwrap_or_default(),
    domain_regex: args.scope,
    excluded_extensions: args
      .exclude_extensions
      .split(',')
      .filter(|e| !e.is_empty())
      .map(|e| e.to_string())
      .collect(),
    ..ProxyConfig::default()
  };

  if args.grpc_addr.is_empty() {
    config.apply(&proxy, None)?;
  } else {
    let addr: SocketAddr = args
      .grpc_addr
      .parse()
      .map_err(|e| Error::config(format!("invalid RPC address {}: {e}", args.grpc_addr)))?;
    let rpc = PluginServer::new(proxy.clone(), config.clone());
    config.apply(&proxy, Some(&rpc))?;
    tokio::spawn(async move {
      if let Err(error) = rpc.serve(addr).await {
        tracing::error!(%error, "plugin RPC server exited");
      }
    });
  }

  info!("starting HTTP proxy server on {}", args.local_addr);
  proxy.run(&args.local_addr).await
}
