//! Shared plumbing for integration tests: throwaway upstreams, proxy
//! bootstrap, raw HTTP helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use proxy_vibes::{PluginServer, ProxyConfig, ProxyServer, RootAuthority};

/// Requests observed by a test upstream, as raw text.
pub type SeenRequests = Arc<Mutex<Vec<String>>>;

/// Spawn a plaintext HTTP/1.1 upstream that records every request and
/// answers each with `200 OK` and the given body.
pub async fn spawn_http_upstream(body: &'static str) -> (SocketAddr, SeenRequests) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let seen: SeenRequests = Arc::new(Mutex::new(Vec::new()));
  let seen_accept = seen.clone();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        break;
      };
      let seen = seen_accept.clone();
      tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        while let Some(raw) = read_raw_request(&mut reader).await {
          seen.lock().unwrap().push(raw);
          let response =
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
          if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
            break;
          }
        }
      });
    }
  });
  (addr, seen)
}

/// Read one raw request (headers plus `Content-Length` body) as text.
pub async fn read_raw_request<S>(reader: &mut BufReader<S>) -> Option<String>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut text = String::new();
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.ok()?;
    if n == 0 {
      return None;
    }
    text.push_str(&line);
    if line == "\r\n" {
      break;
    }
  }
  let content_length = text
    .lines()
    .find_map(|l| {
      l.to_ascii_lowercase()
        .strip_prefix("content-length:")
        .and_then(|v| v.trim().parse::<usize>().ok())
    })
    .unwrap_or(0);
  if content_length > 0 {
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await.ok()?;
    text.push_str(&String::from_utf8_lossy(&body));
  }
  Some(text)
}

/// Read one raw response (headers plus `Content-Length` body) as text.
pub async fn read_raw_response<S>(reader: &mut BufReader<S>) -> Option<String>
where
  S: AsyncRead + Unpin,
{
  let mut text = String::new();
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.ok()?;
    if n == 0 {
      return None;
    }
    text.push_str(&line);
    if line == "\r\n" {
      break;
    }
  }
  let content_length = text
    .lines()
    .find_map(|l| {
      l.to_ascii_lowercase()
        .strip_prefix("content-length:")
        .and_then(|v| v.trim().parse::<usize>().ok())
    })
    .unwrap_or(0);
  if content_length > 0 {
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await.ok()?;
    text.push_str(&String::from_utf8_lossy(&body));
  }
  Some(text)
}

/// Generate a root, start a proxy with the given configuration on an
/// ephemeral port, and return its address.
pub async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Arc<ProxyServer>) {
  let (authority, _, _) = RootAuthority::generate().unwrap();
  let proxy = Arc::new(ProxyServer::new(authority));
  config.apply(&proxy, None).unwrap();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let serving = proxy.clone();
  tokio::spawn(async move {
    serving.serve(listener).await.ok();
  });
  (addr, proxy)
}

/// Like [`start_proxy`], with a plugin RPC server attached.
pub async fn start_proxy_with_rpc(
  config: ProxyConfig,
) -> (SocketAddr, SocketAddr, Arc<ProxyServer>, PluginServer) {
  let (authority, _, _) = RootAuthority::generate().unwrap();
  let proxy = Arc::new(ProxyServer::new(authority));
  let rpc = PluginServer::new(proxy.clone(), config.clone());
  config.apply(&proxy, Some(&rpc)).unwrap();

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let serving = proxy.clone();
  tokio::spawn(async move {
    serving.serve(listener).await.ok();
  });

  let rpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let rpc_addr = rpc_listener.local_addr().unwrap();
  let rpc_serving = rpc.clone();
  tokio::spawn(async move {
    rpc_serving.serve_with_listener(rpc_listener).await.ok();
  });

  (addr, rpc_addr, proxy, rpc)
}

/// Send raw bytes through the proxy and collect everything until the
/// connection closes.
pub async fn send_raw(addr: SocketAddr, raw: &str) -> String {
  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream.write_all(raw.as_bytes()).await.unwrap();
  stream.shutdown().await.unwrap();
  let mut out = Vec::new();
  stream.read_to_end(&mut out).await.unwrap();
  String::from_utf8_lossy(&out).to_string()
}
