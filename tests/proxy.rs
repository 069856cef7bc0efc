//! Integration tests for slinger-capture

use slinger_capture::{CaptureConfig, CaptureKind, CaptureServer, CapturedRequest, CertificateAuthority};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Answer one request with `echo:<path>:<body>`; `/missing*` paths get a 404.
async fn serve_echo<S: AsyncRead + AsyncWrite + Unpin>(stream: S) {
  let mut stream = BufReader::new(stream);
  let mut request_line = String::new();
  if stream.read_line(&mut request_line).await.unwrap_or(0) == 0 {
    return;
  }
  let path = request_line.split(' ').nth(1).unwrap_or("/").to_string();
  let mut length = 0;
  loop {
    let mut line = String::new();
    if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
      return;
    }
    let line = line.trim_end();
    if line.is_empty() {
      break;
    }
    if let Some((name, value)) = line.split_once(':') {
      if name.eq_ignore_ascii_case("content-length") {
        length = value.trim().parse().unwrap_or(0);
      }
    }
  }
  let mut body = vec![0; length];
  if stream.read_exact(&mut body).await.is_err() {
    return;
  }
  let status = if path.starts_with("/missing") {
    "404 Not Found"
  } else {
    "200 OK"
  };
  let reply = format!("echo:{}:{}", path, String::from_utf8_lossy(&body));
  let response = format!(
    "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
    status,
    reply.len(),
    reply
  );
  let _ = stream.write_all(response.as_bytes()).await;
  let _ = stream.shutdown().await;
}

async fn plain_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(serve_echo(stream));
    }
  });
  addr
}

/// HTTPS origin for `localhost` whose certificate comes from `origin_ca`.
async fn tls_origin(origin_ca: &CertificateAuthority) -> SocketAddr {
  let leaf = origin_ca.issue_leaf_cert("localhost").unwrap();
  let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(leaf.cert_chain().to_vec(), leaf.key())
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        if let Ok(stream) = acceptor.accept(stream).await {
          serve_echo(stream).await;
        }
      });
    }
  });
  addr
}

fn tls_client(root: CertificateDer<'static>) -> TlsConnector {
  let mut roots = RootCertStore::empty();
  roots.add(root).unwrap();
  let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

/// Read one response with a Content-Length body.
async fn read_response<S: AsyncRead + Unpin>(reader: &mut BufReader<S>) -> (u16, String) {
  let mut status_line = String::new();
  reader.read_line(&mut status_line).await.unwrap();
  let status = status_line
    .split(' ')
    .nth(1)
    .and_then(|s| s.parse().ok())
    .expect("status line");
  let mut length = 0;
  loop {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let line = line.trim_end();
    if line.is_empty() {
      break;
    }
    if let Some((name, value)) = line.split_once(':') {
      if name.eq_ignore_ascii_case("content-length") {
        length = value.trim().parse().unwrap();
      }
    }
  }
  let mut body = vec![0; length];
  reader.read_exact(&mut body).await.unwrap();
  (status, String::from_utf8(body).unwrap())
}

async fn proxy_post(proxy: SocketAddr, origin: SocketAddr, path: &str, body: &str) -> (u16, String) {
  let stream = TcpStream::connect(proxy).await.unwrap();
  let mut stream = BufReader::new(stream);
  let request = format!(
    "POST http://{}{} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n\r\n{}",
    origin,
    path,
    origin,
    body.len(),
    body
  );
  stream.get_mut().write_all(request.as_bytes()).await.unwrap();
  read_response(&mut stream).await
}

/// Send CONNECT for `localhost:<port>` and consume the 200 reply.
async fn connect_tunnel(proxy: SocketAddr, port: u16) -> TcpStream {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  let request = format!("CONNECT localhost:{} HTTP/1.1\r\nHost: localhost:{}\r\n\r\n", port, port);
  stream.write_all(request.as_bytes()).await.unwrap();
  let expected = b"HTTP/1.1 200 Connection Established\r\n\r\n";
  let mut reply = vec![0; expected.len()];
  stream.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply, expected);
  stream
}

async fn wait_for_captures(server: &CaptureServer, n: usize) -> Vec<Arc<CapturedRequest>> {
  for _ in 0..100 {
    let captures = server.captures();
    if captures.len() >= n {
      return captures;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  server.captures()
}

#[tokio::test]
async fn test_ephemeral_port_is_connectable() {
  let server = CaptureServer::new(CaptureConfig::default()).await.unwrap();
  let addr = server.start().await.unwrap();
  assert_ne!(addr.port(), 0);
  assert_eq!(server.listen_addr(), Some(addr));
  assert!(server.is_running());
  assert!(TcpStream::connect(addr).await.is_ok());
  server.stop().await;
}

#[tokio::test]
async fn test_sequential_plain_requests_are_all_recorded() {
  let origin = plain_origin().await;
  let server = CaptureServer::new(CaptureConfig::default()).await.unwrap();
  let proxy = server.start().await.unwrap();

  for i in 0..5 {
    let path = if i == 2 { "/missing".to_string() } else { format!("/item/{}", i) };
    let (status, body) = proxy_post(proxy, origin, &path, &format!("body-{}", i)).await;
    assert_eq!(body, format!("echo:{}:body-{}", path, i));
    assert_eq!(status, if i == 2 { 404 } else { 200 });
  }

  let captures = wait_for_captures(&server, 5).await;
  assert_eq!(captures.len(), 5);
  for (i, capture) in captures.iter().enumerate() {
    let path = if i == 2 { "/missing".to_string() } else { format!("/item/{}", i) };
    assert_eq!(capture.url, format!("http://{}{}", origin, path));
    assert_eq!(capture.status.map(|s| s.as_u16()), Some(if i == 2 { 404 } else { 200 }));
    assert_eq!(capture.request_body.text(), format!("body-{}", i));
    assert_eq!(capture.response_body.text(), format!("echo:{}:body-{}", path, i));
    assert_eq!(capture.content_type(), Some("text/plain"));
    assert!(!capture.tls);
  }
  let ids: Vec<u64> = captures.iter().map(|c| c.id).collect();
  assert!(ids.windows(2).all(|w| w[0] < w[1]));
  server.stop().await;
}

#[tokio::test]
async fn test_capacity_keeps_most_recent() {
  let origin = plain_origin().await;
  let config = CaptureConfig::default().capacity(3);
  let server = CaptureServer::new(config).await.unwrap();
  let proxy = server.start().await.unwrap();

  for i in 0..8 {
    proxy_post(proxy, origin, &format!("/{}", i), "").await;
  }
  let captures = wait_for_captures(&server, 3).await;
  let paths: Vec<&str> = captures.iter().map(|c| c.path.as_str()).collect();
  assert_eq!(paths, vec!["/5", "/6", "/7"]);
  assert_eq!(server.recorder().capacity(), 3);

  server.clear_captures();
  assert!(server.captures().is_empty());
  server.stop().await;
}

#[tokio::test]
async fn test_connect_is_intercepted_and_decrypted() {
  let origin_ca = CertificateAuthority::new();
  let origin = tls_origin(&origin_ca).await;
  let config = CaptureConfig::default().upstream_root_cert(origin_ca.root_cert_der().unwrap());
  let server = CaptureServer::new(config).await.unwrap();
  let proxy = server.start().await.unwrap();

  let tunnel = connect_tunnel(proxy, origin.port()).await;
  let connector = tls_client(server.ca().root_cert_der().unwrap());
  let tls = connector
    .connect(ServerName::try_from("localhost").unwrap(), tunnel)
    .await
    .unwrap();
  let mut tls = BufReader::new(tls);

  // two requests over the same client connection
  for (path, body) in [("/secret", "payload"), ("/missing", "again")] {
    let request = format!(
      "POST {} HTTP/1.1\r\nHost: localhost:{}\r\nContent-Length: {}\r\n\r\n{}",
      path,
      origin.port(),
      body.len(),
      body
    );
    tls.get_mut().write_all(request.as_bytes()).await.unwrap();
    let (_, reply) = read_response(&mut tls).await;
    assert_eq!(reply, format!("echo:{}:{}", path, body));
  }

  let captures = wait_for_captures(&server, 2).await;
  assert_eq!(captures.len(), 2);
  let first = &captures[0];
  assert!(first.tls);
  assert_eq!(first.kind, CaptureKind::Exchange);
  assert_eq!(first.url, format!("https://localhost:{}/secret", origin.port()));
  assert_eq!(first.status.map(|s| s.as_u16()), Some(200));
  assert_eq!(first.request_body.text(), "payload");
  assert_eq!(first.response_body.text(), "echo:/secret:payload");
  assert_eq!(captures[1].status.map(|s| s.as_u16()), Some(404));
  assert!(server.ca().cached_hosts() >= 1);
  server.stop().await;
}

#[tokio::test]
async fn test_disabled_interception_tunnels_opaquely() {
  let origin_ca = CertificateAuthority::new();
  let origin = tls_origin(&origin_ca).await;
  let config = CaptureConfig::default().https_interception(false);
  let server = CaptureServer::new(config).await.unwrap();
  let proxy = server.start().await.unwrap();

  let tunnel = connect_tunnel(proxy, origin.port()).await;
  // the client talks to the real origin, so it trusts the origin's CA
  let connector = tls_client(origin_ca.root_cert_der().unwrap());
  let tls = connector
    .connect(ServerName::try_from("localhost").unwrap(), tunnel)
    .await
    .unwrap();
  let mut tls = BufReader::new(tls);
  let request = "POST /opaque HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\n\r\ndata";
  tls.get_mut().write_all(request.as_bytes()).await.unwrap();
  let (status, reply) = read_response(&mut tls).await;
  assert_eq!(status, 200);
  assert_eq!(reply, "echo:/opaque:data");
  drop(tls);

  let captures = wait_for_captures(&server, 1).await;
  assert_eq!(captures.len(), 1);
  let marker = &captures[0];
  assert_eq!(marker.kind, CaptureKind::Tunnel);
  assert_eq!(marker.method, http::Method::CONNECT);
  assert_eq!(marker.url, format!("localhost:{}", origin.port()));
  assert!(marker.status.is_none());
  assert!(marker.request_body.is_empty());
  assert!(marker.response_body.is_empty());
  assert!(!marker.tls);
  assert_eq!(server.ca().cached_hosts(), 0);
  server.stop().await;
}

#[tokio::test]
async fn test_every_listener_sees_each_capture_once() {
  let origin = plain_origin().await;
  let server = CaptureServer::new(CaptureConfig::default()).await.unwrap();
  let calls = Arc::new(AtomicUsize::new(0));
  let ids = Arc::new(Mutex::new(Vec::new()));
  for _ in 0..3 {
    let calls = calls.clone();
    let ids = ids.clone();
    server.add_listener(move |capture: &Arc<CapturedRequest>| {
      calls.fetch_add(1, Ordering::SeqCst);
      ids.lock().unwrap().push(capture.id);
    });
  }
  let proxy = server.start().await.unwrap();
  proxy_post(proxy, origin, "/once", "").await;
  wait_for_captures(&server, 1).await;

  assert_eq!(calls.load(Ordering::SeqCst), 3);
  let ids = ids.lock().unwrap().clone();
  assert_eq!(ids.len(), 3);
  assert!(ids.iter().all(|id| *id == ids[0]));
  server.stop().await;
}

#[tokio::test]
async fn test_stop_refuses_new_connections() {
  let server = CaptureServer::new(CaptureConfig::default()).await.unwrap();
  let addr = server.start().await.unwrap();
  assert!(TcpStream::connect(addr).await.is_ok());
  server.stop().await;
  assert!(!server.is_running());
  assert!(server.listen_addr().is_none());
  assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_dead_origin_yields_502_and_error_capture() {
  let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = dead.local_addr().unwrap();
  drop(dead);
  let server = CaptureServer::new(CaptureConfig::default()).await.unwrap();
  let proxy = server.start().await.unwrap();
  let (status, _) = proxy_post(proxy, origin, "/", "").await;
  assert_eq!(status, 502);
  let captures = wait_for_captures(&server, 1).await;
  assert!(captures[0].is_error());
  assert!(captures[0].status.is_none());
  assert!(captures[0].error.as_deref().unwrap_or_default().contains("connect"));
  server.stop().await;
}

#[tokio::test]
async fn test_exported_ca_cert_is_pem() {
  let dir = tempfile::tempdir().unwrap();
  let server = CaptureServer::new(CaptureConfig::default()).await.unwrap();
  let path = server.export_ca_cert(dir.path().join("ca.pem")).await.unwrap();
  let pem = std::fs::read_to_string(path).unwrap();
  assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
  assert_eq!(pem, server.ca().root_cert_pem().unwrap());
}

#[tokio::test]
async fn test_supplied_ca_files_are_used() {
  let dir = tempfile::tempdir().unwrap();
  let existing = CertificateAuthority::new();
  let cert = dir.path().join("ca.pem");
  let key = dir.path().join("ca.key");
  std::fs::write(&cert, existing.root_cert_pem().unwrap()).unwrap();
  std::fs::write(&key, existing.root_key_pem().unwrap()).unwrap();

  let config = CaptureConfig::default().ca_files(&cert, &key);
  let server = CaptureServer::new(config).await.unwrap();
  assert_eq!(
    server.ca().root_cert_der().unwrap(),
    existing.root_cert_der().unwrap()
  );
}

#[tokio::test]
async fn test_request_to_the_proxy_itself_is_refused() {
  let server = CaptureServer::new(CaptureConfig::default()).await.unwrap();
  let proxy = server.start().await.unwrap();

  for target in [proxy.to_string(), format!("localhost:{}", proxy.port())] {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
      .await
      .unwrap()
      .unwrap();
    assert!(response.starts_with("HTTP/1.1 508 Loop Detected\r\n"), "{}", response);
  }

  assert!(server.is_running());
  assert!(server.last_error().is_none());
  assert!(server.captures().is_empty());
  assert!(TcpStream::connect(proxy).await.is_ok());
  server.stop().await;
}

#[tokio::test]
async fn test_client_rejecting_the_leaf_leaves_an_error_capture() {
  let origin_ca = CertificateAuthority::new();
  let origin = tls_origin(&origin_ca).await;
  let server = CaptureServer::new(CaptureConfig::default()).await.unwrap();
  let proxy = server.start().await.unwrap();

  let tunnel = connect_tunnel(proxy, origin.port()).await;
  // trusts some other root, so the proxy's leaf is refused
  let stranger = CertificateAuthority::new();
  let connector = tls_client(stranger.root_cert_der().unwrap());
  let handshake = connector
    .connect(ServerName::try_from("localhost").unwrap(), tunnel)
    .await;
  assert!(handshake.is_err());

  let captures = wait_for_captures(&server, 1).await;
  assert_eq!(captures.len(), 1);
  let capture = &captures[0];
  assert!(capture.tls);
  assert!(capture.status.is_none());
  assert!(capture.error.is_some());
  assert!(capture.is_error());
  assert_eq!(capture.host, format!("localhost:{}", origin.port()));
  server.stop().await;
}

#[tokio::test]
async fn test_unissuable_connect_host_yields_502() {
  let server = CaptureServer::new(CaptureConfig::default()).await.unwrap();
  let proxy = server.start().await.unwrap();
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream
    .write_all(b"CONNECT exa!mple.test:443 HTTP/1.1\r\nHost: exa!mple.test:443\r\n\r\n")
    .await
    .unwrap();
  let mut reader = BufReader::new(stream);
  let (status, _) = read_response(&mut reader).await;
  assert_eq!(status, 502);

  let captures = wait_for_captures(&server, 1).await;
  assert_eq!(captures.len(), 1);
  assert!(captures[0].status.is_none());
  assert!(captures[0].error.as_deref().unwrap_or_default().contains("exa!mple.test"));
  assert_eq!(server.ca().cached_hosts(), 0);
  server.stop().await;
}

#[tokio::test]
async fn test_idle_client_is_disconnected() {
  let config = CaptureConfig::default().idle_timeout(Duration::from_millis(200));
  let server = CaptureServer::new(config).await.unwrap();
  let proxy = server.start().await.unwrap();
  let mut idle = TcpStream::connect(proxy).await.unwrap();
  let mut rest = Vec::new();
  let read = tokio::time::timeout(Duration::from_secs(2), idle.read_to_end(&mut rest)).await;
  assert!(read.is_ok(), "idle client was never disconnected");
  assert!(rest.is_empty());
  assert!(server.is_running());
  assert!(server.captures().is_empty());
  server.stop().await;
}

#[tokio::test]
async fn test_chunked_response_is_relayed_and_decoded() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (stream, _) = listener.accept().await.unwrap();
    let mut stream = BufReader::new(stream);
    loop {
      let mut line = String::new();
      if stream.read_line(&mut line).await.unwrap_or(0) == 0 || line == "\r\n" {
        break;
      }
    }
    let response = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: done\r\n\r\n";
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
  });
  let server = CaptureServer::new(CaptureConfig::default()).await.unwrap();
  let proxy = server.start().await.unwrap();

  let mut stream = TcpStream::connect(proxy).await.unwrap();
  let request = format!("GET http://{}/stream HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin);
  stream.write_all(request.as_bytes()).await.unwrap();
  let mut response = String::new();
  stream.read_to_string(&mut response).await.unwrap();
  let (head, body) = response.split_once("\r\n\r\n").unwrap();
  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(head.to_ascii_lowercase().contains("transfer-encoding: chunked"));
  assert_eq!(body, "5\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: done\r\n\r\n");

  let captures = wait_for_captures(&server, 1).await;
  assert_eq!(captures.len(), 1);
  assert_eq!(captures[0].response_body.text(), "hello world");
  assert_eq!(captures[0].response_body.total_len, 11);
  assert!(!captures[0].response_body.truncated);
  server.stop().await;
}
