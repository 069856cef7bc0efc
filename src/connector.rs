use crate::config::CaptureConfig;
use crate::errors::{new_io_error, Error, Result};
use crate::request::Target;
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone)]
pub(crate) struct ConnectorBuilder {
  certs_verification: bool,
  connect_timeout: Option<Duration>,
  idle_timeout: Option<Duration>,
  nodelay: bool,
  certificate: Vec<CertificateDer<'static>>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      certs_verification: true,
      connect_timeout: Some(Duration::from_secs(10)),
      idle_timeout: Some(Duration::from_secs(60)),
      nodelay: true,
      certificate: vec![],
    }
  }
}

impl ConnectorBuilder {
  /// Builder seeded from the proxy configuration.
  pub(crate) fn from_config(config: &CaptureConfig) -> Self {
    ConnectorBuilder::default()
      .connect_timeout(Some(config.connect_timeout))
      .idle_timeout(Some(config.idle_timeout))
      .certificate(config.upstream_root_certs.clone())
      .certs_verification(!config.danger_accept_invalid_upstream_certs)
  }
  /// Controls the use of certificate validation.
  ///
  /// Defaults to `true`.
  pub(crate) fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.certs_verification = value;
    self
  }
  /// Adds certificates to the set of roots that the connector will trust.
  pub(crate) fn certificate(mut self, value: Vec<CertificateDer<'static>>) -> ConnectorBuilder {
    self.certificate = value;
    self
  }
  /// Set a timeout for resolving and connecting to an origin.
  ///
  /// Default is 10 seconds.
  pub(crate) fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Set the idle timeout applied to every read and write on origin sockets.
  ///
  /// Default is 60 seconds.
  pub(crate) fn idle_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.idle_timeout = timeout;
    self
  }

  /// Combine the configuration of this builder with a connector to create a `Connector`.
  pub(crate) fn build(&self) -> Result<Connector> {
    let tls = tls::client_config(&self.certificate, self.certs_verification)?;
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      idle_timeout: self.idle_timeout,
      nodelay: self.nodelay,
      tls: TlsConnector::from(tls),
    })
  }
}

/// Dials origins on behalf of proxied clients.
pub(crate) struct Connector {
  connect_timeout: Option<Duration>,
  idle_timeout: Option<Duration>,
  nodelay: bool,
  tls: TlsConnector,
}

impl Connector {
  /// Connect to a remote endpoint with addr
  async fn connect_with_addr(&self, addr: SocketAddr) -> std::io::Result<Socket> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    let s = socket.connect(addr).await?;
    Ok(Socket::new(MaybeTlsStream::Tcp(s), self.idle_timeout))
  }

  async fn dial(&self, target: &Target) -> std::io::Result<Socket> {
    let mut last_error = None;
    for addr in tokio::net::lookup_host((target.host.as_str(), target.port)).await? {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(err) => {
          tracing::debug!("[CAPTURE] connect {} failed: {}", addr, err);
          last_error = Some(err);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| new_io_error(ErrorKind::NotFound, "host resolved to no addresses")))
  }

  /// Resolve and connect to `target` within the connect timeout.
  pub(crate) async fn connect(&self, target: &Target) -> Result<Socket> {
    let result = match self.connect_timeout {
      None => self.dial(target).await,
      Some(timeout) => match tokio::time::timeout(timeout, self.dial(target)).await {
        Ok(result) => result,
        Err(x) => Err(new_io_error(ErrorKind::TimedOut, &x.to_string())),
      },
    };
    result.map_err(|e| Error::origin_dial(target.addr(), &e))
  }

  /// Run a client TLS handshake over `stream`, presenting `domain` as SNI.
  pub(crate) async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::handshake(format!("invalid server name {}: {}", domain, e)))?;
    let this = self.tls.clone();
    stream
      .tls(move |t| async move { this.connect(domain, t).await })
      .await
      .map_err(|e| Error::handshake(format!("origin handshake failed: {}", e)))
  }
}
