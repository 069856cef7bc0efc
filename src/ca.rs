//! Certificate Authority (CA) for HTTPS interception
//!
//! Owns a root key and certificate, either generated on first use or loaded
//! from PEM files, and issues per-host leaf certificates signed by it. Leaf
//! certificates are cached for the lifetime of the authority.
//!

use crate::errors::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, DnsName, PrivateKeyDer};

/// Leaf certificate validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Root certificate validity in days (10 years)
const ROOT_TTL_DAYS: i64 = 3650;

/// Root CA material
struct RootCa {
  issuer: Issuer<'static, KeyPair>,
  cert_der: CertificateDer<'static>,
  cert_pem: String,
}

/// A host certificate signed by the root, ready for a TLS server config.
pub struct LeafCert {
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  names: Vec<String>,
}

impl LeafCert {
  /// Certificate chain: `[leaf, root]`
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.cert_chain
  }

  /// A copy of the leaf private key
  pub fn key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }

  /// Subject alternative names the leaf was issued for
  pub fn names(&self) -> &[String] {
    &self.names
  }
}

impl std::fmt::Debug for LeafCert {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafCert")
      .field("names", &self.names)
      .field("chain_len", &self.cert_chain.len())
      .finish()
  }
}

/// Certificate Authority for generating interception certificates
pub struct CertificateAuthority {
  root: Mutex<Option<Arc<RootCa>>>,
  leaf_cache: Mutex<HashMap<String, Arc<LeafCert>>>,
}

impl Default for CertificateAuthority {
  fn default() -> Self {
    Self::new()
  }
}

impl CertificateAuthority {
  /// Create an authority whose root is generated on first use.
  pub fn new() -> Self {
    Self {
      root: Mutex::new(None),
      leaf_cache: Mutex::new(HashMap::new()),
    }
  }

  /// Create an authority from an existing PEM certificate and private key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let root = Self::load_root(cert_pem, key_pem)?;
    Ok(Self {
      root: Mutex::new(Some(Arc::new(root))),
      leaf_cache: Mutex::new(HashMap::new()),
    })
  }

  /// Load an existing CA certificate and key from PEM files.
  pub async fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    let cert_pem = fs::read_to_string(cert_path).await.map_err(|e| {
      Error::cert_generation(format!("Failed to read CA cert {}: {}", cert_path.display(), e))
    })?;
    let key_pem = fs::read_to_string(key_path).await.map_err(|e| {
      Error::cert_generation(format!("Failed to read CA key {}: {}", key_path.display(), e))
    })?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  fn load_root(cert_pem: &str, key_pem: &str) -> Result<RootCa> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::cert_generation(format!("Failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
      Error::cert_generation(format!("Failed to create issuer from CA cert: {}", e))
    })?;

    // Parse PEM to DER for rustls
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::cert_generation("No certificate found in PEM"))?
      .map_err(|e| Error::cert_generation(format!("Failed to parse PEM: {}", e)))?;

    Ok(RootCa {
      issuer,
      cert_der,
      cert_pem: cert_pem.to_string(),
    })
  }

  fn generate_root() -> Result<RootCa> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Slinger Capture Proxy CA");
    dn.push(DnType::OrganizationName, "Emo-Crab");
    dn.push(DnType::CountryName, "CN");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::cert_generation(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::cert_generation(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::cert_generation(format!("Failed to create issuer: {}", e)))?;

    tracing::info!("[CAPTURE] generated root CA certificate");
    Ok(RootCa {
      issuer,
      cert_der,
      cert_pem,
    })
  }

  /// Make sure a root key and certificate exist, generating them if needed.
  ///
  /// Calling this again returns the same root.
  pub fn ensure_root_ca(&self) -> Result<()> {
    self.root().map(|_| ())
  }

  fn root(&self) -> Result<Arc<RootCa>> {
    let mut root = self.root.lock();
    if let Some(root) = root.as_ref() {
      return Ok(root.clone());
    }
    let generated = Arc::new(Self::generate_root()?);
    *root = Some(generated.clone());
    Ok(generated)
  }

  /// Get or generate a leaf certificate for `host`.
  ///
  /// The cache lock is never held while keys are generated; when two
  /// connections race for the same host, the first insertion wins and both
  /// receive it.
  pub fn issue_leaf_cert(&self, host: &str) -> Result<Arc<LeafCert>> {
    let host = normalize_host(host);
    if host.is_empty() {
      return Err(Error::cert_generation("Cannot issue a certificate for an empty host"));
    }
    if host.parse::<IpAddr>().is_err() && DnsName::try_from(host.as_str()).is_err() {
      return Err(Error::cert_generation(format!("Invalid domain name: {}", host)));
    }
    if let Some(cached) = self.leaf_cache.lock().get(&host) {
      return Ok(cached.clone());
    }

    let root = self.root()?;
    let leaf = Arc::new(Self::sign_leaf(&root, &host)?);

    let mut cache = self.leaf_cache.lock();
    Ok(cache.entry(host).or_insert(leaf).clone())
  }

  fn sign_leaf(root: &RootCa, host: &str) -> Result<LeafCert> {
    let mut params = CertificateParams::default();

    // Generate random serial number for uniqueness
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    let mut names = Vec::new();
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      names.push(ip.to_string());
      vec![SanType::IpAddress(ip)]
    } else {
      let wildcard = format!("*.{}", host);
      let sans = vec![
        SanType::DnsName(host.try_into().map_err(|_| {
          Error::cert_generation(format!("Invalid domain name: {}", host))
        })?),
        SanType::DnsName(wildcard.as_str().try_into().map_err(|_| {
          Error::cert_generation(format!("Invalid domain name: {}", wildcard))
        })?),
      ];
      names.push(host.to_string());
      names.push(wildcard);
      sans
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    // Set validity period with clock skew handling
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::cert_generation(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &root.issuer)
      .map_err(|e| Error::cert_generation(format!("Failed to sign leaf cert: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::cert_generation("Failed to serialize leaf key"))?;

    tracing::debug!("[CAPTURE] issued leaf certificate for {}", host);
    Ok(LeafCert {
      cert_chain: vec![cert_der, root.cert_der.clone()],
      key,
      names,
    })
  }

  /// Root certificate in PEM format for client installation
  pub fn root_cert_pem(&self) -> Result<String> {
    Ok(self.root()?.cert_pem.clone())
  }

  /// Root certificate in DER format
  pub fn root_cert_der(&self) -> Result<CertificateDer<'static>> {
    Ok(self.root()?.cert_der.clone())
  }

  /// Private key of the root in PEM format, for persisting a generated CA
  pub fn root_key_pem(&self) -> Result<String> {
    Ok(self.root()?.issuer.key().serialize_pem())
  }

  /// Write the root certificate as PEM to `path` so it can be imported into
  /// a trust store.
  pub async fn export_root_cert(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref().to_path_buf();
    let pem = self.root_cert_pem()?;
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() && !parent.exists() {
        fs::create_dir_all(parent).await?;
      }
    }
    fs::write(&path, pem.as_bytes()).await?;
    tracing::info!("[CAPTURE] exported root certificate to {}", path.display());
    Ok(path)
  }

  /// Number of hosts with a cached leaf certificate
  pub fn cached_hosts(&self) -> usize {
    self.leaf_cache.lock().len()
  }
}

/// Lowercase and strip IPv6 brackets so `[::1]` and `::1` share a leaf.
fn normalize_host(host: &str) -> String {
  host
    .trim()
    .trim_start_matches('[')
    .trim_end_matches(']')
    .trim_end_matches('.')
    .to_ascii_lowercase()
}
