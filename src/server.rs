//! Capture server: listener, accept loop and lifecycle

use crate::ca::CertificateAuthority;
use crate::config::CaptureConfig;
use crate::connector::ConnectorBuilder;
use crate::errors::{Error, Result};
use crate::handler::{ConnectionContext, ConnectionHandler};
use crate::record::CapturedRequest;
use crate::recorder::{CaptureListener, CaptureRecorder};
use parking_lot::RwLock;
use rand::Rng;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Pause before accepting again once descriptors run out
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
// ENFILE, EMFILE
#[cfg(unix)]
const DESCRIPTOR_EXHAUSTION: &[i32] = &[23, 24];
// WSAEMFILE
#[cfg(windows)]
const DESCRIPTOR_EXHAUSTION: &[i32] = &[10024];
#[cfg(not(any(unix, windows)))]
const DESCRIPTOR_EXHAUSTION: &[i32] = &[];

/// Live state shared with the accept loop
#[derive(Debug, Default)]
struct Status {
  running: bool,
  addr: Option<SocketAddr>,
  last_error: Option<String>,
}

struct Running {
  token: CancellationToken,
  accept_task: JoinHandle<()>,
}

/// Builder for [`CaptureServer`]
#[derive(Default)]
pub struct CaptureServerBuilder {
  config: CaptureConfig,
  ca: Option<Arc<CertificateAuthority>>,
  recorder: Option<Arc<CaptureRecorder>>,
}

impl CaptureServerBuilder {
  /// Create a builder with the default configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// Set the configuration
  pub fn config(mut self, config: CaptureConfig) -> Self {
    self.config = config;
    self
  }

  /// Share an existing certificate authority instead of creating one from
  /// the configuration.
  pub fn ca(mut self, ca: Arc<CertificateAuthority>) -> Self {
    self.ca = Some(ca);
    self
  }

  /// Record into an existing recorder; its capacity wins over the configured one.
  pub fn recorder(mut self, recorder: Arc<CaptureRecorder>) -> Self {
    self.recorder = Some(recorder);
    self
  }

  /// Build the server. Nothing is bound until [`CaptureServer::start`].
  pub async fn build(self) -> Result<CaptureServer> {
    let config = self.config;
    let ca = match self.ca {
      Some(ca) => ca,
      None => match (&config.ca_cert_path, &config.ca_key_path) {
        (Some(cert), Some(key)) => Arc::new(CertificateAuthority::from_pem_files(cert, key).await?),
        _ => Arc::new(CertificateAuthority::new()),
      },
    };
    if config.https_interception {
      if let Err(err) = ca.ensure_root_ca() {
        tracing::warn!("[CAPTURE] HTTPS interception unavailable: {}", err);
      }
    }
    let recorder = self
      .recorder
      .unwrap_or_else(|| Arc::new(CaptureRecorder::new(config.capacity)));
    let connector = ConnectorBuilder::from_config(&config).build()?;
    Ok(CaptureServer {
      ctx: Arc::new(ConnectionContext {
        config: Arc::new(config),
        ca,
        recorder,
        connector: Arc::new(connector),
        via: format!("slinger-capture-{:08x}", rand::thread_rng().gen::<u32>()),
      }),
      lifecycle: Mutex::new(None),
      status: Arc::new(RwLock::new(Status::default())),
    })
  }
}

/// An intercepting forward proxy that records every exchange.
///
/// ```no_run
/// # async fn run() -> slinger_capture::Result<()> {
/// use slinger_capture::{CaptureConfig, CaptureServer};
///
/// let server = CaptureServer::new(CaptureConfig::default()).await?;
/// let addr = server.start().await?;
/// println!("proxy listening on {}", addr);
/// server.add_listener(|capture: &std::sync::Arc<slinger_capture::CapturedRequest>| {
///   println!("#{} {} {}", capture.id, capture.method, capture.url);
/// });
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct CaptureServer {
  ctx: Arc<ConnectionContext>,
  lifecycle: Mutex<Option<Running>>,
  status: Arc<RwLock<Status>>,
}

impl CaptureServer {
  /// Create a server from `config`, loading the CA from the configured files
  /// or generating a fresh one.
  pub async fn new(config: CaptureConfig) -> Result<Self> {
    CaptureServerBuilder::new().config(config).build().await
  }

  /// Constructs a new `CaptureServerBuilder`.
  pub fn builder() -> CaptureServerBuilder {
    CaptureServerBuilder::new()
  }

  /// Bind the listener and run the accept loop in the background.
  ///
  /// Returns the bound address, which carries the OS-assigned port when the
  /// configured port is `0`.
  pub async fn start(&self) -> Result<SocketAddr> {
    self.start_with_token(CancellationToken::new()).await
  }

  /// Like [`CaptureServer::start`], but also stops when `parent` is cancelled.
  pub async fn start_with_token(&self, parent: CancellationToken) -> Result<SocketAddr> {
    let mut lifecycle = self.lifecycle.lock().await;
    if let Some(running) = lifecycle.as_ref() {
      if !running.accept_task.is_finished() {
        return Err(Error::AlreadyRunning);
      }
    }
    if let Some(previous) = lifecycle.take() {
      let _ = previous.accept_task.await;
    }

    let listen_addr = self.ctx.config.listen_addr.clone();
    let listener = TcpListener::bind(&listen_addr)
      .await
      .map_err(|e| Error::bind(&listen_addr, e))?;
    let addr = listener.local_addr().map_err(|e| Error::bind(&listen_addr, e))?;
    {
      let mut status = self.status.write();
      status.running = true;
      status.addr = Some(addr);
      status.last_error = None;
    }
    let token = parent.child_token();
    let accept_task = tokio::spawn(accept_loop(
      listener,
      self.ctx.clone(),
      token.clone(),
      self.status.clone(),
    ));
    tracing::info!("[CAPTURE] listening on {}", addr);
    *lifecycle = Some(Running { token, accept_task });
    Ok(addr)
  }

  /// Close the listener and wait for in-flight connections to drain, closing
  /// whatever is left after the shutdown grace period.
  pub async fn stop(&self) {
    let running = self.lifecycle.lock().await.take();
    if let Some(running) = running {
      running.token.cancel();
      if let Err(e) = running.accept_task.await {
        tracing::warn!("[CAPTURE] accept loop ended abnormally: {}", e);
      }
    }
    self.status.write().running = false;
  }

  /// Whether the listener is accepting connections
  pub fn is_running(&self) -> bool {
    self.status.read().running
  }

  /// Bound address while running
  pub fn listen_addr(&self) -> Option<SocketAddr> {
    let status = self.status.read();
    if status.running {
      status.addr
    } else {
      None
    }
  }

  /// The unexpected accept error that ended the last run, if any
  pub fn last_error(&self) -> Option<String> {
    self.status.read().last_error.clone()
  }

  /// Configuration the server was built with
  pub fn config(&self) -> &CaptureConfig {
    &self.ctx.config
  }

  /// The recorder holding this server's captures
  pub fn recorder(&self) -> Arc<CaptureRecorder> {
    self.ctx.recorder.clone()
  }

  /// Current captures, oldest first
  pub fn captures(&self) -> Vec<Arc<CapturedRequest>> {
    self.ctx.recorder.snapshot()
  }

  /// Drop every capture
  pub fn clear_captures(&self) {
    self.ctx.recorder.clear()
  }

  /// Register a listener for live capture events
  pub fn add_listener<L>(&self, listener: L)
  where
    L: CaptureListener + 'static,
  {
    self.ctx.recorder.add_listener(listener)
  }

  /// The certificate authority used for interception
  pub fn ca(&self) -> &Arc<CertificateAuthority> {
    &self.ctx.ca
  }

  /// Write the root certificate as PEM to `path` for manual trust.
  pub async fn export_ca_cert(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
    self.ctx.ca.export_root_cert(path).await
  }
}

impl Drop for CaptureServer {
  fn drop(&mut self) {
    if let Some(running) = self.lifecycle.get_mut().as_ref() {
      running.token.cancel();
    }
  }
}

/// What a failed `accept` means for the accept loop
#[derive(Debug, PartialEq, Eq)]
enum AcceptFailure {
  /// Concerns a single connection; accept again
  Transient,
  /// Out of file descriptors; accept again after a pause
  Exhausted,
  /// The listener itself is broken
  Fatal,
}

fn classify(error: &std::io::Error) -> AcceptFailure {
  if error
    .raw_os_error()
    .is_some_and(|code| DESCRIPTOR_EXHAUSTION.contains(&code))
  {
    return AcceptFailure::Exhausted;
  }
  match error.kind() {
    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
      AcceptFailure::Transient
    }
    _ => AcceptFailure::Fatal,
  }
}

async fn accept_loop(
  listener: TcpListener,
  ctx: Arc<ConnectionContext>,
  token: CancellationToken,
  status: Arc<RwLock<Status>>,
) {
  let mut connections = JoinSet::new();
  loop {
    tokio::select! {
      _ = token.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          tracing::debug!("[CAPTURE] accepted connection from {}", peer);
          let handler = ConnectionHandler::new(ctx.clone(), stream, peer, token.clone());
          connections.spawn(handler.run());
        }
        Err(e) => match classify(&e) {
          AcceptFailure::Transient => {
            tracing::debug!("[CAPTURE] transient accept error: {}", e);
          }
          AcceptFailure::Exhausted => {
            tracing::warn!("[CAPTURE] accept paused for {:?}: {}", ACCEPT_BACKOFF, e);
            let stopped = tokio::select! {
              _ = token.cancelled() => true,
              _ = tokio::time::sleep(ACCEPT_BACKOFF) => false,
            };
            if stopped {
              break;
            }
          }
          AcceptFailure::Fatal => {
            tracing::error!("[CAPTURE] failed to accept connection: {}", e);
            status.write().last_error = Some(e.to_string());
            break;
          }
        },
      },
      Some(joined) = connections.join_next(), if !connections.is_empty() => {
        if let Err(e) = joined {
          if e.is_panic() {
            tracing::warn!("[CAPTURE] connection task panicked: {}", e);
          }
        }
      }
    }
  }
  drop(listener);
  status.write().running = false;
  token.cancel();

  let grace = ctx.config.shutdown_grace;
  let drained = tokio::time::timeout(grace, async {
    while connections.join_next().await.is_some() {}
  })
  .await;
  if drained.is_err() {
    tracing::warn!(
      "[CAPTURE] closing {} connections after {:?} grace period",
      connections.len(),
      grace
    );
    connections.shutdown().await;
  }
  tracing::info!("[CAPTURE] stopped");
}
