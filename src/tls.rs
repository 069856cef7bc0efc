//! TLS configuration for both sides of an intercepted tunnel
//!
use crate::ca::LeafCert;
use crate::errors::{Error, Result};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  SignatureScheme,
};

/// Only HTTP/1.1 is spoken inside intercepted tunnels.
const ALPN_HTTP11: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(ring::default_provider()))
}

/// Server config presenting `leaf` to the client.
pub(crate) fn server_config(leaf: &LeafCert) -> Result<Arc<rustls::ServerConfig>> {
  let mut config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(leaf.cert_chain().to_vec(), leaf.key())
    .map_err(|e| Error::cert_generation(format!("Failed to build TLS server config: {}", e)))?;
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(Arc::new(config))
}

/// Client config for origin connections.
pub(crate) fn client_config(
  extra_roots: &[CertificateDer<'static>],
  certs_verification: bool,
) -> Result<Arc<rustls::ClientConfig>> {
  let builder = rustls::ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
  let mut config = if certs_verification {
    let mut root_cert_store = RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in extra_roots {
      root_cert_store.add(cert.clone())?;
    }
    builder
      .with_root_certificates(root_cert_store)
      .with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(Arc::new(config))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::CertificateAuthority;

  #[test]
  fn server_config_offers_http11_only() {
    let ca = CertificateAuthority::new();
    let leaf = ca.issue_leaf_cert("localhost").unwrap();
    let config = server_config(&leaf).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }

  #[test]
  fn client_config_accepts_extra_roots() {
    let ca = CertificateAuthority::new();
    let root = ca.root_cert_der().unwrap();
    let config = client_config(&[root], true).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    assert!(client_config(&[], false).is_ok());
  }
}
