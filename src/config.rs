//! Capture proxy configuration
use std::path::PathBuf;
use std::time::Duration;
use tokio_rustls::rustls::pki_types::CertificateDer;

/// Default number of captures kept in memory.
pub const DEFAULT_CAPACITY: usize = 1000;
/// Default cap on buffered request/response bodies (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Configuration for the capture proxy
#[derive(Clone, Debug)]
pub struct CaptureConfig {
  /// Address to listen on; port `0` asks the OS for an ephemeral port
  pub listen_addr: String,
  /// Decrypt CONNECT tunnels with a leaf certificate from the CA
  pub https_interception: bool,
  /// Number of captures kept before the oldest is evicted
  pub capacity: usize,
  /// Bytes of each body buffered into a capture
  pub max_body_size: usize,
  /// Upper bound for a request or response head
  pub max_head_size: usize,
  /// Externally supplied CA certificate (PEM)
  pub ca_cert_path: Option<PathBuf>,
  /// Externally supplied CA private key (PEM)
  pub ca_key_path: Option<PathBuf>,
  /// Timeout for dialing an origin
  pub connect_timeout: Duration,
  /// Timeout for any single idle read or write on a connection
  pub idle_timeout: Duration,
  /// How long `stop` waits for in-flight connections before closing them
  pub shutdown_grace: Duration,
  /// Extra trust anchors for origin certificates
  pub upstream_root_certs: Vec<CertificateDer<'static>>,
  /// Skip origin certificate verification
  pub danger_accept_invalid_upstream_certs: bool,
}

impl Default for CaptureConfig {
  fn default() -> Self {
    Self {
      listen_addr: "127.0.0.1:0".to_string(),
      https_interception: true,
      capacity: DEFAULT_CAPACITY,
      max_body_size: DEFAULT_MAX_BODY_SIZE,
      max_head_size: 64 * 1024,
      ca_cert_path: None,
      ca_key_path: None,
      connect_timeout: Duration::from_secs(10),
      idle_timeout: Duration::from_secs(60),
      shutdown_grace: Duration::from_secs(5),
      upstream_root_certs: vec![],
      danger_accept_invalid_upstream_certs: false,
    }
  }
}

impl CaptureConfig {
  /// Set the listen address.
  ///
  /// Default is `127.0.0.1:0`.
  pub fn listen_addr(mut self, addr: impl Into<String>) -> CaptureConfig {
    self.listen_addr = addr.into();
    self
  }
  /// Enable or disable HTTPS interception.
  ///
  /// When disabled, CONNECT requests become opaque byte tunnels.
  /// Default is `true`.
  pub fn https_interception(mut self, value: bool) -> CaptureConfig {
    self.https_interception = value;
    self
  }
  /// Set the capture buffer capacity.
  ///
  /// Default is 1000.
  pub fn capacity(mut self, value: usize) -> CaptureConfig {
    self.capacity = value;
    self
  }
  /// Set how many bytes of each body are kept in a capture.
  ///
  /// Default is 1 MiB.
  pub fn max_body_size(mut self, value: usize) -> CaptureConfig {
    self.max_body_size = value;
    self
  }
  /// Use an existing CA instead of generating one.
  pub fn ca_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> CaptureConfig {
    self.ca_cert_path = Some(cert.into());
    self.ca_key_path = Some(key.into());
    self
  }
  /// Set a timeout for dialing origins.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Duration) -> CaptureConfig {
    self.connect_timeout = timeout;
    self
  }
  /// Set the per-connection idle timeout.
  ///
  /// The timeout applies to each read or write and resets after progress.
  /// Default is 60 seconds.
  pub fn idle_timeout(mut self, timeout: Duration) -> CaptureConfig {
    self.idle_timeout = timeout;
    self
  }
  /// Set the shutdown grace period.
  ///
  /// Default is 5 seconds.
  pub fn shutdown_grace(mut self, timeout: Duration) -> CaptureConfig {
    self.shutdown_grace = timeout;
    self
  }
  /// Trust an additional root when connecting to HTTPS origins.
  pub fn upstream_root_cert(mut self, cert: CertificateDer<'static>) -> CaptureConfig {
    self.upstream_root_certs.push(cert);
    self
  }
  /// Controls the verification of origin certificates.
  ///
  /// # Warning
  ///
  /// Any certificate presented by any origin will be trusted. Only use this
  /// against test servers.
  pub fn danger_accept_invalid_upstream_certs(mut self, value: bool) -> CaptureConfig {
    self.danger_accept_invalid_upstream_certs = value;
    self
  }
}
