//! capture proxy errors
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `slinger_capture::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while running the capture proxy.
#[derive(ThisError, Debug)]
pub enum Error {
  /// The listener could not be bound; fatal to `CaptureServer::start`.
  #[error("failed to bind {addr}: {source}")]
  Bind {
    /// requested listen address
    addr: String,
    /// underlying socket error
    #[source]
    source: std::io::Error,
  },
  /// Root or leaf certificate could not be created or loaded.
  #[error("certificate generation failed: {0}")]
  CertGeneration(String),
  /// TLS handshake with the client or with the origin failed.
  #[error("TLS handshake failed: {0}")]
  Handshake(String),
  /// The origin could not be reached.
  #[error("failed to connect to {addr}: {reason}")]
  OriginDial {
    /// origin `host:port`
    addr: String,
    /// why the dial failed
    reason: String,
    /// the dial ran into the connect timeout
    timed_out: bool,
  },
  /// Reading from or writing to the origin failed mid-exchange.
  #[error("origin I/O error: {0}")]
  OriginIo(std::io::Error),
  /// The client sent something that is not an HTTP/1.x proxy request.
  #[error("malformed request: {0}")]
  MalformedRequest(String),
  /// The request would be forwarded back into this proxy.
  #[error("request loop detected for {0}")]
  LoopDetected(String),
  /// `start` was called on a server that is already listening.
  #[error("capture server is already running")]
  AlreadyRunning,
  /// client side I/O error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
}

impl Error {
  /// Create a bind error and log it
  pub fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
    let error = Error::Bind {
      addr: addr.into(),
      source,
    };
    tracing::error!("[CAPTURE] {}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn cert_generation(msg: impl Into<String>) -> Self {
    let error = Error::CertGeneration(msg.into());
    tracing::error!("[CAPTURE] {}", error);
    error
  }

  /// Create a handshake error and log it
  pub fn handshake(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::warn!("[CAPTURE] {}", error);
    error
  }

  /// Create an origin dial error and log it
  pub fn origin_dial(addr: impl Into<String>, source: &std::io::Error) -> Self {
    let error = Error::OriginDial {
      addr: addr.into(),
      reason: source.to_string(),
      timed_out: source.kind() == ErrorKind::TimedOut,
    };
    tracing::warn!("[CAPTURE] {}", error);
    error
  }

  /// Create a malformed request error and log it
  pub fn malformed(msg: impl Into<String>) -> Self {
    let error = Error::MalformedRequest(msg.into());
    tracing::debug!("[CAPTURE] {}", error);
    error
  }

  /// Create a loop error and log it
  pub fn loop_detected(target: impl Into<String>) -> Self {
    let error = Error::LoopDetected(target.into());
    tracing::warn!("[CAPTURE] {}", error);
    error
  }

  /// The status code a proxy answers with when this error ends an exchange.
  pub fn proxy_status(&self) -> http::StatusCode {
    match self {
      Error::MalformedRequest(_) | Error::Http(_) => http::StatusCode::BAD_REQUEST,
      Error::LoopDetected(_) => http::StatusCode::LOOP_DETECTED,
      Error::OriginDial {
        timed_out: true, ..
      } => http::StatusCode::GATEWAY_TIMEOUT,
      Error::OriginIo(e) if e.kind() == ErrorKind::TimedOut => http::StatusCode::GATEWAY_TIMEOUT,
      _ => http::StatusCode::BAD_GATEWAY,
    }
  }

  /// Whether this error is a peer going away rather than a protocol failure.
  pub fn is_disconnect(&self) -> bool {
    match self {
      Error::IO(e) => is_disconnect(e),
      _ => false,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::cert_generation(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> std::io::Error {
  std::io::Error::new(error_kind, msg.to_string())
}

pub(crate) fn is_disconnect(error: &std::io::Error) -> bool {
  matches!(
    error.kind(),
    ErrorKind::UnexpectedEof
      | ErrorKind::ConnectionReset
      | ErrorKind::ConnectionAborted
      | ErrorKind::BrokenPipe
      | ErrorKind::NotConnected
  )
}
