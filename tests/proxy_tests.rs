//! End-to-end proxy scenarios over real sockets: plaintext forwarding,
//! pipeline wiring, HTTPS MITM, WebSocket passthrough and scope bypass.

mod helpers;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use uuid::Uuid;

use helpers::{
  read_raw_request, read_raw_response, send_raw, spawn_http_upstream, start_proxy, SeenRequests,
};
use proxy_vibes::{mod_fn, read_only_fn, ProxyConfig, Request, Response};

#[tokio::test]
async fn plaintext_echo_preserves_exchange_identifier() {
  let (upstream, _seen) = spawn_http_upstream("ok").await;

  let request_ids: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));
  let response_ids: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));

  let req_ids = request_ids.clone();
  let resp_ids = response_ids.clone();
  let config = ProxyConfig {
    request_out_hooks: vec![read_only_fn(move |req: Request| {
      let req_ids = req_ids.clone();
      Box::pin(async move {
        req_ids.lock().unwrap().push(req.id());
        Ok(())
      }) as BoxFuture<'static, proxy_vibes::Result<()>>
    })],
    response_in_hooks: vec![read_only_fn(move |resp: Response| {
      let resp_ids = resp_ids.clone();
      Box::pin(async move {
        if let Some(id) = resp.id() {
          resp_ids.lock().unwrap().push(id);
        }
        Ok(())
      }) as BoxFuture<'static, proxy_vibes::Result<()>>
    })],
    ..ProxyConfig::default()
  };
  let (proxy_addr, _proxy) = start_proxy(config).await;

  let reply = send_raw(
    proxy_addr,
    &format!("GET http://{upstream}/ HTTP/1.1\r\nHost: {upstream}\r\n\r\n"),
  )
  .await;
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "got: {reply}");
  assert!(reply.ends_with("ok"));

  let request_ids = request_ids.lock().unwrap().clone();
  let response_ids = response_ids.lock().unwrap().clone();
  assert_eq!(request_ids.len(), 1);
  assert_eq!(request_ids, response_ids);
}

#[tokio::test]
async fn accept_encoding_is_stripped_by_the_builtin_mutator() {
  let (upstream, seen) = spawn_http_upstream("ok").await;
  let (proxy_addr, _proxy) = start_proxy(ProxyConfig::default()).await;

  send_raw(
    proxy_addr,
    &format!(
      "GET http://{upstream}/ HTTP/1.1\r\nHost: {upstream}\r\nAccept-Encoding: gzip\r\n\r\n"
    ),
  )
  .await;

  let seen = seen.lock().unwrap().clone();
  assert_eq!(seen.len(), 1);
  assert!(!seen[0].to_lowercase().contains("accept-encoding"));
}

#[tokio::test]
async fn out_of_scope_traffic_bypasses_every_stage() {
  let (upstream, seen) = spawn_http_upstream("binary").await;

  let marked: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));
  let observed = marked.clone();
  let config = ProxyConfig {
    excluded_extensions: vec!["png".to_string()],
    request_mod_hooks: vec![mod_fn(move |mut req: Request| {
      let observed = observed.clone();
      Box::pin(async move {
        *observed.lock().unwrap() = true;
        req
          .headers_mut()
          .insert("x-marked", http::HeaderValue::from_static("1"));
        Ok(req)
      }) as BoxFuture<'static, proxy_vibes::Result<Request>>
    })],
    ..ProxyConfig::default()
  };
  let (proxy_addr, _proxy) = start_proxy(config).await;

  // excluded extension: forwarded untouched, no hook runs
  send_raw(
    proxy_addr,
    &format!(
      "GET http://{upstream}/img.png HTTP/1.1\r\nHost: {upstream}\r\nAccept-Encoding: gzip\r\n\r\n"
    ),
  )
  .await;
  {
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(!seen[0].contains("x-marked"));
    // even the built-in strip is bypassed out of scope
    assert!(seen[0].to_lowercase().contains("accept-encoding: gzip"));
  }
  assert!(!*marked.lock().unwrap());

  // in-scope request on the same proxy does get mutated
  send_raw(
    proxy_addr,
    &format!("GET http://{upstream}/page HTTP/1.1\r\nHost: {upstream}\r\n\r\n"),
  )
  .await;
  {
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[1].contains("x-marked: 1"));
  }
  assert!(*marked.lock().unwrap());
}

#[tokio::test]
async fn mutation_hook_error_yields_500_and_skips_upstream() {
  let (upstream, seen) = spawn_http_upstream("never").await;
  let config = ProxyConfig {
    request_mod_hooks: vec![mod_fn(|_req: Request| {
      Box::pin(async move { Err(proxy_vibes::Error::hook("rejected")) })
        as BoxFuture<'static, proxy_vibes::Result<Request>>
    })],
    ..ProxyConfig::default()
  };
  let (proxy_addr, _proxy) = start_proxy(config).await;

  let reply = send_raw(
    proxy_addr,
    &format!("GET http://{upstream}/ HTTP/1.1\r\nHost: {upstream}\r\n\r\n"),
  )
  .await;
  assert!(reply.starts_with("HTTP/1.1 500"), "got: {reply}");
  assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn connect_dial_failure_returns_502_without_pipelines() {
  let invoked: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));
  let flag = invoked.clone();
  let config = ProxyConfig {
    request_in_hooks: vec![read_only_fn(move |_req: Request| {
      let flag = flag.clone();
      Box::pin(async move {
        *flag.lock().unwrap() = true;
        Ok(())
      }) as BoxFuture<'static, proxy_vibes::Result<()>>
    })],
    ..ProxyConfig::default()
  };
  let (proxy_addr, _proxy) = start_proxy(config).await;

  // a port nothing listens on
  let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let dead_addr = dead.local_addr().unwrap();
  drop(dead);

  let reply = send_raw(
    proxy_addr,
    &format!("CONNECT {dead_addr} HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n"),
  )
  .await;
  assert!(reply.starts_with("HTTP/1.1 502"), "got: {reply}");
  assert!(!*invoked.lock().unwrap());
}

/// TLS upstream presenting a self-signed certificate (an unrelated CA from
/// the proxy's point of view). Answers WebSocket upgrades with a 101 and a
/// raw `hello-ws` payload, everything else with `200 OK` / `ok`.
async fn spawn_tls_upstream() -> (SocketAddr, SeenRequests) {
  let key_pair = rcgen::KeyPair::generate().unwrap();
  let mut params = rcgen::CertificateParams::default();
  params.subject_alt_names = vec![rcgen::SanType::DnsName("localhost".try_into().unwrap())];
  let cert = params.self_signed(&key_pair).unwrap();
  let cert_der = CertificateDer::from(cert.der().to_vec());
  let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();
  let config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(vec![cert_der], key_der)
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let seen: SeenRequests = Arc::new(Mutex::new(Vec::new()));
  let seen_accept = seen.clone();

  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        break;
      };
      let acceptor = acceptor.clone();
      let seen = seen_accept.clone();
      tokio::spawn(async move {
        let Ok(tls) = acceptor.accept(stream).await else {
          return;
        };
        let mut reader = BufReader::new(tls);
        while let Some(raw) = read_raw_request(&mut reader).await {
          let is_upgrade = raw.to_lowercase().contains("upgrade: websocket");
          seen.lock().unwrap().push(raw);
          if is_upgrade {
            let reply =
              b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nhello-ws";
            if reader.get_mut().write_all(reply).await.is_err() {
              return;
            }
            // stay open for spliced bytes until the peer goes away
            let mut sink = [0u8; 256];
            while matches!(reader.read(&mut sink).await, Ok(n) if n > 0) {}
            return;
          }
          let reply = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
          if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
            return;
          }
        }
      });
    }
  });
  (addr, seen)
}

/// CONNECT through the proxy and complete the inner TLS handshake, trusting
/// only the proxy's root.
async fn open_tunnel(
  proxy_addr: SocketAddr,
  proxy: &proxy_vibes::ProxyServer,
  upstream: SocketAddr,
) -> tokio_rustls::client::TlsStream<TcpStream> {
  let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
  let authority = format!("localhost:{}", upstream.port());
  stream
    .write_all(format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let mut reader = BufReader::new(stream);
  let established = read_raw_response(&mut reader).await.unwrap();
  assert!(established.starts_with("HTTP/1.1 200"), "got: {established}");
  let stream = reader.into_inner();

  let mut roots = RootCertStore::empty();
  roots
    .add(proxy.certificate_store().authority().ca_cert_der().clone())
    .unwrap();
  let config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  connector
    .connect(ServerName::try_from("localhost").unwrap(), stream)
    .await
    .expect("client must trust the minted leaf")
}

#[tokio::test]
async fn https_mitm_round_trip() {
  let (upstream, seen) = spawn_tls_upstream().await;
  let (proxy_addr, proxy) = start_proxy(ProxyConfig::default()).await;

  let tls = open_tunnel(proxy_addr, &proxy, upstream).await;
  let mut reader = BufReader::new(tls);
  reader
    .get_mut()
    .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nAccept-Encoding: gzip\r\n\r\n")
    .await
    .unwrap();
  let reply = read_raw_response(&mut reader).await.unwrap();
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "got: {reply}");
  assert!(reply.ends_with("ok"));

  let seen = seen.lock().unwrap().clone();
  assert_eq!(seen.len(), 1);
  // the request went through the pipelines: built-in strip applied
  assert!(!seen[0].to_lowercase().contains("accept-encoding"));
}

#[tokio::test]
async fn https_keep_alive_tunnel_carries_multiple_exchanges() {
  let (upstream, seen) = spawn_tls_upstream().await;
  let (proxy_addr, proxy) = start_proxy(ProxyConfig::default()).await;

  let tls = open_tunnel(proxy_addr, &proxy, upstream).await;
  let mut reader = BufReader::new(tls);
  for i in 0..3 {
    reader
      .get_mut()
      .write_all(format!("GET /{i} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
      .await
      .unwrap();
    let reply = read_raw_response(&mut reader).await.unwrap();
    assert!(reply.starts_with("HTTP/1.1 200"), "exchange {i} got: {reply}");
  }
  assert_eq!(seen.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn websocket_upgrade_is_passed_through_unmodified() {
  let (upstream, seen) = spawn_tls_upstream().await;

  let mutated: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));
  let flag = mutated.clone();
  let config = ProxyConfig {
    request_mod_hooks: vec![mod_fn(move |mut req: Request| {
      let flag = flag.clone();
      Box::pin(async move {
        *flag.lock().unwrap() = true;
        req
          .headers_mut()
          .insert("x-mutated", http::HeaderValue::from_static("1"));
        Ok(req)
      }) as BoxFuture<'static, proxy_vibes::Result<Request>>
    })],
    ..ProxyConfig::default()
  };
  let (proxy_addr, proxy) = start_proxy(config).await;

  let tls = open_tunnel(proxy_addr, &proxy, upstream).await;
  let mut reader = BufReader::new(tls);
  reader
    .get_mut()
    .write_all(
      b"GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
    )
    .await
    .unwrap();

  let reply = read_raw_response(&mut reader).await.unwrap();
  assert!(reply.starts_with("HTTP/1.1 101"), "got: {reply}");

  let mut payload = [0u8; 8];
  reader.read_exact(&mut payload).await.unwrap();
  assert_eq!(&payload, b"hello-ws");

  // the upgrade bypassed the pipelines entirely
  assert!(!*mutated.lock().unwrap());
  let seen = seen.lock().unwrap().clone();
  assert_eq!(seen.len(), 1);
  assert!(!seen[0].contains("x-mutated"));
}
