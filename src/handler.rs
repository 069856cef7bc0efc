//! Per-connection proxy state machine
//!
//! ```text
//! ReadRequestLine -> PlainHttp -> ForwardAndRecord -> Closed
//! ReadRequestLine -> ConnectReceived -> TlsHandshake -> DecryptedHttpLoop -> Closed
//! ReadRequestLine -> ConnectReceived -> OpaqueTunnel -> Closed
//! ```
//!
//! Every state reads and writes through a [`Socket`] carrying the idle
//! timeout, and the states that wait on the client for a new request also
//! wait on the shutdown token. Tunnels trade the per-socket timeout for one
//! idle timer shared by both directions.
use crate::body::{relay, BodyFraming, RelayError};
use crate::ca::{CertificateAuthority, LeafCert};
use crate::config::CaptureConfig;
use crate::connector::Connector;
use crate::errors::{is_disconnect, new_io_error, Error, Result};
use crate::headers::{is_upgrade, strip_hop_by_hop, wants_close};
use crate::record::{BodyBuffer, CaptureKind, CapturedRequest};
use crate::recorder::CaptureRecorder;
use crate::request::{RequestHead, Target};
use crate::response::{proxy_response, ResponseHead};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls;
use http::header::CONNECTION;
use http::{HeaderValue, Method, StatusCode, Version};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
/// First byte of a TLS handshake record
const TLS_HANDSHAKE: u8 = 0x16;
const TUNNEL_BUFFER: usize = 16 * 1024;

type ClientStream = BufReader<Socket>;

/// Everything a connection needs from the server that accepted it.
pub(crate) struct ConnectionContext {
  pub(crate) config: Arc<CaptureConfig>,
  pub(crate) ca: Arc<CertificateAuthority>,
  pub(crate) recorder: Arc<CaptureRecorder>,
  pub(crate) connector: Arc<Connector>,
  /// `Via` pseudonym this proxy adds to forwarded requests
  pub(crate) via: String,
}

#[derive(Debug)]
enum State {
  ReadRequestLine,
  PlainHttp(RequestHead),
  ForwardAndRecord {
    head: RequestHead,
    target: Target,
    path: String,
  },
  ConnectReceived(RequestHead),
  TlsHandshake(Target, Arc<LeafCert>),
  DecryptedHttpLoop(Target),
  /// `acknowledged` once the client already has its `200 Connection Established`
  OpaqueTunnel {
    target: Target,
    acknowledged: bool,
  },
  Closed,
}

/// How a forwarded exchange left the connection
enum Forwarded {
  KeepAlive,
  Close,
  Upgrade(BufReader<Socket>),
}

/// A failed exchange, and whether the client can still be sent a proxy
/// error response.
struct Failure {
  error: Error,
  respond: bool,
}

impl Failure {
  fn respond(error: Error) -> Self {
    Failure { error, respond: true }
  }

  fn origin(error: std::io::Error) -> Self {
    Failure::respond(Error::OriginIo(error))
  }

  fn silent(error: Error) -> Self {
    Failure { error, respond: false }
  }

  fn client(error: std::io::Error) -> Self {
    Failure::silent(Error::IO(error))
  }
}

pub(crate) struct ConnectionHandler {
  ctx: Arc<ConnectionContext>,
  peer: SocketAddr,
  local: Option<SocketAddr>,
  client: Option<ClientStream>,
  shutdown: CancellationToken,
}

impl ConnectionHandler {
  pub(crate) fn new(
    ctx: Arc<ConnectionContext>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
  ) -> Self {
    let _ = stream.set_nodelay(true);
    let local = stream.local_addr().ok();
    let socket = Socket::new(MaybeTlsStream::Tcp(stream), Some(ctx.config.idle_timeout));
    ConnectionHandler {
      ctx,
      peer,
      local,
      client: Some(BufReader::new(socket)),
      shutdown,
    }
  }

  /// Drive the connection to `Closed`.
  pub(crate) async fn run(mut self) {
    let mut state = State::ReadRequestLine;
    while !matches!(state, State::Closed) {
      tracing::trace!("[CAPTURE] {} state {:?}", self.peer, state);
      state = match self.step(state).await {
        Ok(next) => next,
        Err(err) => {
          self.fail(err).await;
          State::Closed
        }
      };
    }
    if let Some(mut client) = self.client.take() {
      let _ = client.shutdown().await;
    }
  }

  async fn step(&mut self, state: State) -> Result<State> {
    match state {
      State::ReadRequestLine => match self.next_request().await? {
        Some(head) if head.method == Method::CONNECT => Ok(State::ConnectReceived(head)),
        Some(head) => Ok(State::PlainHttp(head)),
        None => Ok(State::Closed),
      },
      State::PlainHttp(head) => {
        let (target, path) = head.plain_origin()?;
        self.check_loop(&head, &target)?;
        Ok(State::ForwardAndRecord { head, target, path })
      }
      State::ForwardAndRecord { head, target, path } => {
        self.exchange(head, target, path, false).await?;
        Ok(State::Closed)
      }
      State::ConnectReceived(head) => self.connect_received(head).await,
      State::TlsHandshake(target, leaf) => self.tls_handshake(target, leaf).await,
      State::DecryptedHttpLoop(target) => match self.next_request().await? {
        Some(head) if head.method == Method::CONNECT => Err(Error::malformed("CONNECT inside an intercepted tunnel")),
        Some(head) => {
          self.check_loop(&head, &target)?;
          let path = head.tunneled_path();
          if self.exchange(head, target.clone(), path, true).await? {
            Ok(State::DecryptedHttpLoop(target))
          } else {
            Ok(State::Closed)
          }
        }
        None => Ok(State::Closed),
      },
      State::OpaqueTunnel { target, acknowledged } => self.opaque_tunnel(target, acknowledged).await,
      State::Closed => Ok(State::Closed),
    }
  }

  fn client(&mut self) -> Result<&mut ClientStream> {
    self
      .client
      .as_mut()
      .ok_or_else(|| Error::IO(new_io_error(ErrorKind::NotConnected, "client stream is gone")))
  }

  /// Refuse requests that already passed through this proxy or that target
  /// the listener itself; forwarding them would loop back here.
  fn check_loop(&self, head: &RequestHead, target: &Target) -> Result<()> {
    let to_self = self.local.is_some_and(|local| target.is_endpoint(local));
    if to_self || head.has_via(&self.ctx.via) {
      return Err(Error::loop_detected(target.addr()));
    }
    Ok(())
  }

  /// Wait for the next request head, or for shutdown.
  async fn next_request(&mut self) -> Result<Option<RequestHead>> {
    let max_head_size = self.ctx.config.max_head_size;
    let shutdown = self.shutdown.clone();
    let client = self.client()?;
    tokio::select! {
      _ = shutdown.cancelled() => Ok(None),
      head = RequestHead::read(client, max_head_size) => head,
    }
  }

  async fn fail(&mut self, err: Error) {
    match err {
      Error::MalformedRequest(_) | Error::Http(_) | Error::LoopDetected(_) => {
        if let Some(client) = self.client.as_mut() {
          let _ = client
            .write_all(&proxy_response(err.proxy_status(), &err.to_string()))
            .await;
          let _ = client.flush().await;
        }
      }
      Error::IO(ref e) if is_disconnect(e) || e.kind() == ErrorKind::TimedOut => {
        tracing::debug!("[CAPTURE] {} closed: {}", self.peer, e);
      }
      _ if self.shutdown.is_cancelled() => {
        tracing::debug!("[CAPTURE] {} closed during shutdown: {}", self.peer, err);
      }
      _ => tracing::warn!("[CAPTURE] {} connection error: {}", self.peer, err),
    }
  }

  async fn connect_received(&mut self, head: RequestHead) -> Result<State> {
    let target = head.connect_target()?;
    self.check_loop(&head, &target)?;
    if !self.ctx.config.https_interception {
      return Ok(State::OpaqueTunnel {
        target,
        acknowledged: false,
      });
    }
    let leaf = match self.ctx.ca.issue_leaf_cert(&target.host) {
      Ok(leaf) => leaf,
      Err(err) => {
        let capture = tunnel_failure(&target, Instant::now(), &err);
        let client = self.client()?;
        client
          .write_all(&proxy_response(err.proxy_status(), &err.to_string()))
          .await?;
        client.flush().await?;
        self.ctx.recorder.record(capture);
        return Ok(State::Closed);
      }
    };
    let client = self.client()?;
    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;
    Ok(State::TlsHandshake(target, leaf))
  }

  async fn tls_handshake(&mut self, target: Target, leaf: Arc<LeafCert>) -> Result<State> {
    let started = Instant::now();
    let first = self.client()?.fill_buf().await?.first().copied();
    match first {
      None => return Ok(State::Closed),
      Some(TLS_HANDSHAKE) => {}
      Some(_) => {
        tracing::debug!("[CAPTURE] {} is not TLS, tunneling opaquely", target.addr());
        return Ok(State::OpaqueTunnel {
          target,
          acknowledged: true,
        });
      }
    }
    let config = match tls::server_config(&leaf) {
      Ok(config) => config,
      Err(err) => {
        self.ctx.recorder.record(tunnel_failure(&target, started, &err));
        return Ok(State::Closed);
      }
    };
    let Some(client) = self.client.take() else {
      return Ok(State::Closed);
    };
    match TlsAcceptor::from(config).accept(client).await {
      Ok(stream) => {
        tracing::debug!("[CAPTURE] {} intercepting {}", self.peer, target.addr());
        let socket = Socket::new(
          MaybeTlsStream::Intercepted(Box::new(stream)),
          Some(self.ctx.config.idle_timeout),
        );
        self.client = Some(BufReader::new(socket));
        Ok(State::DecryptedHttpLoop(target))
      }
      Err(e) => {
        let err = Error::handshake(format!("client handshake for {} failed: {}", target.addr(), e));
        self.ctx.recorder.record(tunnel_failure(&target, started, &err));
        Ok(State::Closed)
      }
    }
  }

  async fn opaque_tunnel(&mut self, target: Target, acknowledged: bool) -> Result<State> {
    let ctx = self.ctx.clone();
    let shutdown = self.shutdown.clone();
    let started = Instant::now();
    let mut capture = CapturedRequest::new(Method::CONNECT, target.addr());
    capture.kind = CaptureKind::Tunnel;
    capture.host = target.display_host(443);
    let client = self.client()?;
    let mut origin = match ctx.connector.connect(&target).await {
      Ok(origin) => origin,
      Err(err) => {
        if !acknowledged {
          let _ = client
            .write_all(&proxy_response(err.proxy_status(), &err.to_string()))
            .await;
          let _ = client.flush().await;
        }
        capture.error = Some(err.to_string());
        capture.duration = started.elapsed();
        ctx.recorder.record(capture);
        return Ok(State::Closed);
      }
    };
    if !acknowledged {
      client.write_all(CONNECTION_ESTABLISHED).await?;
      client.flush().await?;
    }
    client.get_mut().set_idle_timeout(None);
    origin.set_idle_timeout(None);
    match splice(client, &mut origin, ctx.config.idle_timeout, &shutdown).await {
      Ok((sent, received)) => {
        tracing::debug!(
          "[CAPTURE] tunnel {} closed: {} bytes sent, {} bytes received",
          target.addr(),
          sent,
          received
        );
      }
      Err(e) if is_disconnect(&e) || e.kind() == ErrorKind::TimedOut => {}
      Err(e) => capture.error = Some(e.to_string()),
    }
    let _ = origin.shutdown().await;
    capture.duration = started.elapsed();
    ctx.recorder.record(capture);
    Ok(State::Closed)
  }

  /// Forward one request to `target` and record it. Returns whether the
  /// client connection can carry another request.
  async fn exchange(&mut self, head: RequestHead, target: Target, path: String, tls: bool) -> Result<bool> {
    let framing = BodyFraming::for_request(&head.headers)?;
    let ctx = self.ctx.clone();
    let shutdown = self.shutdown.clone();
    let (scheme, default_port) = if tls { ("https", 443) } else { ("http", 80) };
    let host = target.display_host(default_port);
    let mut capture = CapturedRequest::new(head.method.clone(), format!("{}://{}{}", scheme, host, path));
    capture.path = path.clone();
    capture.host = host;
    capture.request_headers = head.headers.clone();
    capture.tls = tls;
    let started = Instant::now();

    let client = self.client()?;
    let forwarded = forward(&ctx, client, &head, &target, &path, framing, tls, &mut capture).await;
    capture.duration = started.elapsed();
    match forwarded {
      Ok(Forwarded::Upgrade(mut origin)) => {
        let capture = ctx.recorder.record(capture);
        tracing::debug!("[CAPTURE] #{} switched protocols", capture.id);
        client.get_mut().set_idle_timeout(None);
        origin.get_mut().set_idle_timeout(None);
        if let Err(e) = splice(client, &mut origin, ctx.config.idle_timeout, &shutdown).await {
          tracing::debug!("[CAPTURE] #{} upgraded connection closed: {}", capture.id, e);
        }
        Ok(false)
      }
      Ok(next) => {
        ctx.recorder.record(capture);
        Ok(matches!(next, Forwarded::KeepAlive))
      }
      Err(failure) => {
        if failure.respond {
          let status = failure.error.proxy_status();
          let _ = client
            .write_all(&proxy_response(status, &failure.error.to_string()))
            .await;
          let _ = client.flush().await;
        }
        if !failure.error.is_disconnect() {
          tracing::warn!("[CAPTURE] {} {} failed: {}", capture.method, capture.url, failure.error);
        }
        capture.error = Some(failure.error.to_string());
        ctx.recorder.record(capture);
        Ok(false)
      }
    }
  }
}

/// Dial the origin, relay the request, then relay the response back while
/// filling in `capture`.
#[allow(clippy::too_many_arguments)]
async fn forward(
  ctx: &ConnectionContext,
  client: &mut ClientStream,
  head: &RequestHead,
  target: &Target,
  path: &str,
  framing: BodyFraming,
  tls: bool,
  capture: &mut CapturedRequest,
) -> std::result::Result<Forwarded, Failure> {
  let default_port = if tls { 443 } else { 80 };
  let upgrade = is_upgrade(&head.headers);
  let mut origin = ctx.connector.connect(target).await.map_err(Failure::respond)?;
  if tls {
    origin = ctx
      .connector
      .upgrade_to_tls(origin, &target.host)
      .await
      .map_err(Failure::respond)?;
  }
  let mut origin = BufReader::new(origin);

  let answered_continue = head.expects_continue() && framing != BodyFraming::Empty;
  if answered_continue {
    client.write_all(CONTINUE).await.map_err(Failure::client)?;
    client.flush().await.map_err(Failure::client)?;
  }
  origin
    .write_all(&head.to_raw(path, target, default_port, upgrade, &ctx.via))
    .await
    .map_err(Failure::origin)?;
  let mut request_body = BodyBuffer::new(ctx.config.max_body_size);
  let relayed = relay(client, &mut origin, framing, &mut request_body).await;
  capture.request_body = request_body.finish();
  match relayed {
    Ok(()) => {}
    Err(RelayError::Source(e)) => return Err(Failure::client(e)),
    Err(RelayError::Sink(e)) => return Err(Failure::origin(e)),
  }

  let response = loop {
    let response = ResponseHead::read(&mut origin, ctx.config.max_head_size)
      .await
      .map_err(Failure::origin)?;
    if !response.is_interim() {
      break response;
    }
    if answered_continue && response.status == StatusCode::CONTINUE {
      continue;
    }
    client
      .write_all(&response.to_raw(&response.headers))
      .await
      .map_err(Failure::client)?;
  };
  capture.status = Some(response.status);
  capture.status_text = response
    .reason
    .clone()
    .or_else(|| response.status.canonical_reason().map(str::to_string));
  capture.response_headers = response.headers.clone();

  let switching = upgrade && response.status == StatusCode::SWITCHING_PROTOCOLS;
  let framing = if switching {
    BodyFraming::Empty
  } else {
    BodyFraming::for_response(&head.method, response.status, &response.headers).map_err(Failure::origin)?
  };
  let close = !switching
    && (!tls
      || framing.is_until_close()
      || wants_close(head.version, &head.headers)
      || wants_close(response.version, &response.headers));
  let mut headers = response.headers.clone();
  strip_hop_by_hop(&mut headers, switching);
  if close {
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
  } else if !switching && head.version == Version::HTTP_10 {
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
  }
  client
    .write_all(&response.to_raw(&headers))
    .await
    .map_err(Failure::client)?;
  if switching {
    client.flush().await.map_err(Failure::client)?;
    return Ok(Forwarded::Upgrade(origin));
  }

  let mut response_body = BodyBuffer::new(ctx.config.max_body_size);
  let relayed = relay(&mut origin, client, framing, &mut response_body).await;
  capture.response_body = response_body.finish();
  match relayed {
    Ok(()) if close => Ok(Forwarded::Close),
    Ok(()) => Ok(Forwarded::KeepAlive),
    Err(RelayError::Source(e)) => Err(Failure::silent(Error::OriginIo(e))),
    Err(RelayError::Sink(e)) => Err(Failure::client(e)),
  }
}

/// Copy bytes both ways until each side has closed, shutdown is requested,
/// or neither side has made progress for `idle`. Returns the bytes copied
/// from `a` to `b` and from `b` to `a`.
async fn splice<A, B>(
  a: &mut A,
  b: &mut B,
  idle: Duration,
  shutdown: &CancellationToken,
) -> std::io::Result<(u64, u64)>
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  let mut a_buf = vec![0u8; TUNNEL_BUFFER];
  let mut b_buf = vec![0u8; TUNNEL_BUFFER];
  let (mut a_open, mut b_open) = (true, true);
  let (mut a_to_b, mut b_to_a) = (0u64, 0u64);
  while a_open || b_open {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = tokio::time::sleep(idle) => {
        tracing::debug!("[CAPTURE] tunnel idle for {:?}, closing", idle);
        break;
      }
      read = a.read(&mut a_buf), if a_open => match read? {
        0 => {
          a_open = false;
          let _ = b.shutdown().await;
        }
        n => {
          write_within(b, &a_buf[..n], idle).await?;
          a_to_b += n as u64;
        }
      },
      read = b.read(&mut b_buf), if b_open => match read? {
        0 => {
          b_open = false;
          let _ = a.shutdown().await;
        }
        n => {
          write_within(a, &b_buf[..n], idle).await?;
          b_to_a += n as u64;
        }
      },
    }
  }
  Ok((a_to_b, b_to_a))
}

async fn write_within<W>(writer: &mut W, buf: &[u8], idle: Duration) -> std::io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  tokio::time::timeout(idle, async {
    writer.write_all(buf).await?;
    writer.flush().await
  })
  .await
  .map_err(|_| new_io_error(ErrorKind::TimedOut, "tunnel write stalled"))?
}

/// Error capture for a CONNECT that never reached the decrypted loop.
fn tunnel_failure(target: &Target, started: Instant, err: &Error) -> CapturedRequest {
  let host = target.display_host(443);
  let mut capture = CapturedRequest::new(Method::CONNECT, format!("https://{}/", host));
  capture.host = host;
  capture.path = "/".to_string();
  capture.tls = true;
  capture.duration = started.elapsed();
  capture.error = Some(err.to_string());
  capture
}
