#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # slinger-capture
//!
//! An intercepting forward proxy that records every HTTP exchange passing
//! through it.
//!
//! - Plain HTTP requests are forwarded to their origin and recorded.
//! - `CONNECT` tunnels are intercepted: the proxy terminates TLS with a leaf
//!   certificate issued by its own [`CertificateAuthority`], then forwards
//!   each decrypted request over a fresh TLS connection to the origin.
//! - With interception disabled, `CONNECT` becomes an opaque byte tunnel and
//!   only a marker capture is recorded.
//!
//! Captures land in a fixed-capacity [`CaptureRecorder`] that evicts the
//! oldest entry first and notifies registered listeners.
//!
//! ## Starting a proxy
//!
//! ```rust,no_run
//! # async fn run() -> slinger_capture::Result<()> {
//! use slinger_capture::{CaptureConfig, CaptureServer};
//!
//! let config = CaptureConfig::default().listen_addr("127.0.0.1:8080");
//! let server = CaptureServer::new(config).await?;
//! server.export_ca_cert("capture-ca.pem").await?;
//! let addr = server.start().await?;
//! println!("set HTTP(S)_PROXY=http://{}", addr);
//! # Ok(())
//! # }
//! ```
//!
//! Clients must trust the exported root certificate for intercepted HTTPS
//! traffic; installing it is left to the user.
//!
//! ## Replaying a capture
//!
//! ```rust
//! use slinger_capture::CapturedRequest;
//!
//! let capture = CapturedRequest::new(http::Method::GET, "http://example.com/");
//! assert!(capture.curl_command().starts_with("curl -X GET"));
//! ```
//!
//! ## Optional Features
//!
//! - **serde**: Provides serialization and deserialization support for captures.
//!
mod body;
mod ca;
mod config;
mod connector;
mod errors;
mod handler;
mod headers;
/// record info
pub mod record;
mod recorder;
mod request;
mod response;
mod server;
mod socket;
mod tls;

pub use ca::{CertificateAuthority, LeafCert};
pub use config::{CaptureConfig, DEFAULT_CAPACITY, DEFAULT_MAX_BODY_SIZE};
pub use errors::{Error, Result};
pub use http::header;
pub use http::{Method, StatusCode};
pub use record::{CaptureKind, CapturedBody, CapturedRequest};
pub use recorder::{CaptureListener, CaptureRecorder};
pub use server::{CaptureServer, CaptureServerBuilder};
pub use tokio_util::sync::CancellationToken;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
