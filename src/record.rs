use bytes::{Bytes, BytesMut};
use std::time::Duration;
use time::OffsetDateTime;

/// What kind of traffic a capture describes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CaptureKind {
  /// A complete (or failed) HTTP request/response exchange
  Exchange,
  /// An opaque CONNECT tunnel; no content was inspected
  Tunnel,
}

/// A body as seen on the wire, buffered up to a size cap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CapturedBody {
  /// buffered bytes, at most the configured cap
  pub data: Bytes,
  /// true when `total_len` exceeded the cap and `data` is a prefix
  pub truncated: bool,
  /// bytes that actually crossed the proxy
  pub total_len: u64,
}

impl CapturedBody {
  /// An empty body
  pub fn empty() -> Self {
    Self::default()
  }

  /// Whether no bytes were transferred
  pub fn is_empty(&self) -> bool {
    self.total_len == 0
  }

  /// Body as text, lossily decoded
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.data).into_owned()
  }
}

/// Accumulates body bytes up to a cap, counting everything seen.
#[derive(Debug)]
pub(crate) struct BodyBuffer {
  data: BytesMut,
  cap: usize,
  total_len: u64,
}

impl BodyBuffer {
  pub(crate) fn new(cap: usize) -> Self {
    Self {
      data: BytesMut::new(),
      cap,
      total_len: 0,
    }
  }

  pub(crate) fn push(&mut self, chunk: &[u8]) {
    self.total_len += chunk.len() as u64;
    let room = self.cap.saturating_sub(self.data.len());
    let take = room.min(chunk.len());
    if take > 0 {
      self.data.extend_from_slice(&chunk[..take]);
    }
  }

  pub(crate) fn finish(self) -> CapturedBody {
    CapturedBody {
      truncated: self.total_len > self.data.len() as u64,
      data: self.data.freeze(),
      total_len: self.total_len,
    }
  }
}

/// One recorded exchange
///
/// `status` is `None` when the exchange failed before a response arrived;
/// `error` then says why.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CapturedRequest {
  /// unique, increasing for the life of the recorder
  pub id: u64,
  /// exchange or opaque tunnel marker
  pub kind: CaptureKind,
  /// request method
  #[cfg_attr(feature = "serde", serde(with = "http_serde::method"))]
  pub method: http::Method,
  /// absolute URL, or `host:port` for tunnels
  pub url: String,
  /// path and query
  pub path: String,
  /// host, with the port when it is not the scheme default
  pub host: String,
  /// request headers as sent by the client
  #[cfg_attr(feature = "serde", serde(with = "http_serde::header_map"))]
  pub request_headers: http::HeaderMap,
  /// request body
  pub request_body: CapturedBody,
  /// response headers; empty when no response arrived
  #[cfg_attr(feature = "serde", serde(with = "http_serde::header_map"))]
  pub response_headers: http::HeaderMap,
  /// response body
  pub response_body: CapturedBody,
  /// response status
  #[cfg_attr(feature = "serde", serde(with = "http_serde::option::status_code"))]
  pub status: Option<http::StatusCode>,
  /// reason phrase from the status line
  pub status_text: Option<String>,
  /// time from request head to the end of the response
  pub duration: Duration,
  /// when the request head was read
  pub timestamp: OffsetDateTime,
  /// intercepted over HTTPS
  pub tls: bool,
  /// failure detail for exchanges that did not complete
  pub error: Option<String>,
}

impl CapturedRequest {
  /// A capture for `method url`, with everything else empty.
  pub fn new(method: http::Method, url: impl Into<String>) -> Self {
    Self {
      id: 0,
      kind: CaptureKind::Exchange,
      method,
      url: url.into(),
      path: String::new(),
      host: String::new(),
      request_headers: http::HeaderMap::new(),
      request_body: CapturedBody::empty(),
      response_headers: http::HeaderMap::new(),
      response_body: CapturedBody::empty(),
      status: None,
      status_text: None,
      duration: Duration::ZERO,
      timestamp: OffsetDateTime::now_utc(),
      tls: false,
      error: None,
    }
  }

  /// Whether the exchange failed before or during the response.
  pub fn is_error(&self) -> bool {
    self.error.is_some() || (self.kind == CaptureKind::Exchange && self.status.is_none())
  }

  /// Content type of the response
  pub fn content_type(&self) -> Option<&str> {
    self
      .response_headers
      .get(http::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
  }

  /// Render the request as a curl command line for replay.
  pub fn curl_command(&self) -> String {
    let https = self.url.starts_with("https://");
    let mut curl_cmd = vec!["curl"];
    curl_cmd.push("-X");
    curl_cmd.push(self.method.as_str());
    if https {
      curl_cmd.push("-k");
    }
    let mut command = curl_cmd.join(" ");
    command.push_str(" \\\n");
    for (k, v) in self.request_headers.iter() {
      if is_transport_header(k) {
        continue;
      }
      command.push_str(" -H ");
      let header = format!("{}: {}", k.as_str(), v.to_str().unwrap_or_default());
      command.push_str(&bash_escape(&header));
      command.push_str(" \\\n");
    }
    if !self.request_body.is_empty() {
      command.push_str(" --data-binary ");
      command.push_str(&format!("$'{}'", self.request_body.data.escape_ascii()));
      command.push_str(" \\\n");
    }
    command.push(' ');
    command.push_str(&bash_escape(&self.url));
    command
  }
}

fn is_transport_header(name: &http::HeaderName) -> bool {
  matches!(
    name.as_str(),
    "content-length" | "transfer-encoding" | "connection" | "proxy-connection" | "keep-alive"
  )
}

fn bash_escape(s: &str) -> String {
  format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn body_buffer_truncates_past_cap() {
    let mut buffer = BodyBuffer::new(4);
    buffer.push(b"ab");
    buffer.push(b"cdef");
    buffer.push(b"gh");
    let body = buffer.finish();
    assert_eq!(&body.data[..], b"abcd");
    assert!(body.truncated);
    assert_eq!(body.total_len, 8);
  }

  #[test]
  fn body_buffer_at_cap_is_not_truncated() {
    let mut buffer = BodyBuffer::new(4);
    buffer.push(b"abcd");
    let body = buffer.finish();
    assert!(!body.truncated);
    assert_eq!(body.text(), "abcd");
  }

  #[test]
  fn failed_exchange_has_no_status() {
    let mut capture = CapturedRequest::new(http::Method::GET, "http://example.com/");
    capture.error = Some("connection refused".to_string());
    assert!(capture.is_error());
    assert!(capture.status.is_none());
  }

  #[test]
  fn curl_command_replays_request() {
    let mut capture = CapturedRequest::new(http::Method::POST, "https://example.com/api?q=1");
    capture
      .request_headers
      .insert("x-token", http::HeaderValue::from_static("it's"));
    capture
      .request_headers
      .insert("content-length", http::HeaderValue::from_static("2"));
    capture.request_body = CapturedBody {
      data: Bytes::from_static(b"{}"),
      truncated: false,
      total_len: 2,
    };
    let command = capture.curl_command();
    assert!(command.starts_with("curl -X POST -k"));
    assert!(command.contains("-H 'x-token: it'\\''s'"));
    assert!(!command.contains("content-length"));
    assert!(command.contains("--data-binary $'{}'"));
    assert!(command.ends_with("'https://example.com/api?q=1'"));
  }
}
