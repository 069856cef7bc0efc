use crate::errors::{Error, Result};
use crate::headers::{parse_headers, parse_version, read_head, strip_hop_by_hop, version_str, write_headers};
use crate::{CR_LF, SPACE};
use http::header::{EXPECT, HOST, VIA};
use http::uri::{Authority, Scheme};
use http::{HeaderMap, HeaderValue, Method, Uri, Version};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tokio::io::AsyncBufRead;

/// An origin endpoint: host without brackets, and port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Target {
  pub(crate) host: String,
  pub(crate) port: u16,
}

impl Target {
  /// Parse `host[:port]`, falling back to `default_port`.
  pub(crate) fn parse(authority: &str, default_port: u16) -> Result<Self> {
    let authority = Authority::from_str(authority.trim())
      .map_err(|_| Error::malformed(format!("invalid authority: {}", authority)))?;
    Self::from_authority(&authority, default_port)
  }

  fn from_authority(authority: &Authority, default_port: u16) -> Result<Self> {
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
      return Err(Error::malformed("empty host"));
    }
    Ok(Target {
      host: host.to_ascii_lowercase(),
      port: authority.port_u16().unwrap_or(default_port),
    })
  }

  fn bracketed_host(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]", self.host)
    } else {
      self.host.clone()
    }
  }

  /// `host:port`, IPv6 literals bracketed
  pub(crate) fn addr(&self) -> String {
    format!("{}:{}", self.bracketed_host(), self.port)
  }

  /// Whether this target names `local`, the address a client reached the
  /// proxy on.
  pub(crate) fn is_endpoint(&self, local: SocketAddr) -> bool {
    if self.port != local.port() {
      return false;
    }
    let local_ip = local.ip().to_canonical();
    if self.host == "localhost" {
      return local_ip.is_loopback();
    }
    match self.host.parse::<IpAddr>().map(|ip| ip.to_canonical()) {
      Ok(ip) => ip == local_ip || ip.is_unspecified() || (ip.is_loopback() && local_ip.is_loopback()),
      Err(_) => false,
    }
  }

  /// Host as shown in URLs: the port is omitted when it is the scheme default.
  pub(crate) fn display_host(&self, default_port: u16) -> String {
    if self.port == default_port {
      self.bracketed_host()
    } else {
      self.addr()
    }
  }
}

/// Request line and headers as received from the client.
#[derive(Clone, Debug)]
pub(crate) struct RequestHead {
  pub(crate) method: Method,
  pub(crate) target: String,
  pub(crate) version: Version,
  pub(crate) headers: HeaderMap,
}

impl RequestHead {
  /// Read the next request head. `Ok(None)` means the client closed the
  /// connection between requests.
  pub(crate) async fn read<R>(reader: &mut R, max_head_size: usize) -> Result<Option<Self>>
  where
    R: AsyncBufRead + Unpin,
  {
    match read_head(reader, max_head_size).await {
      Ok(Some(lines)) => Self::parse(&lines).map(Some),
      Ok(None) => Ok(None),
      Err(err) if err.kind() == ErrorKind::InvalidData => Err(Error::malformed(err.to_string())),
      Err(err) => Err(Error::IO(err)),
    }
  }

  pub(crate) fn parse(lines: &[Vec<u8>]) -> Result<Self> {
    let (request_line, header_lines) = lines
      .split_first()
      .ok_or_else(|| Error::malformed("missing request line"))?;
    let mut parts = request_line.splitn(3, |b| b == &b' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
      return Err(Error::malformed("invalid request line"));
    };
    let method = Method::from_bytes(method).map_err(|_| Error::malformed("invalid method"))?;
    let version = parse_version(version).ok_or_else(|| Error::malformed("unsupported HTTP version"))?;
    let target = std::str::from_utf8(target)
      .map_err(|_| Error::malformed("request target is not UTF-8"))?
      .to_string();
    if target.is_empty() {
      return Err(Error::malformed("empty request target"));
    }
    let headers = parse_headers(header_lines).map_err(|e| Error::malformed(e.to_string()))?;
    Ok(RequestHead {
      method,
      target,
      version,
      headers,
    })
  }

  /// CONNECT target in authority form; the port defaults to 443.
  pub(crate) fn connect_target(&self) -> Result<Target> {
    Target::parse(&self.target, 443)
  }

  /// Where a plain proxy request goes, plus its origin-form path.
  ///
  /// Absolute-form targets must use `http`; origin-form targets fall back
  /// to the `Host` header.
  pub(crate) fn plain_origin(&self) -> Result<(Target, String)> {
    if self.target.starts_with('/') {
      let host = self
        .headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| Error::malformed("origin-form request without Host header"))?;
      return Ok((Target::parse(host, 80)?, self.target.clone()));
    }
    let uri = Uri::from_str(&self.target)
      .map_err(|_| Error::malformed(format!("invalid request target: {}", self.target)))?;
    if uri.scheme() != Some(&Scheme::HTTP) {
      return Err(Error::malformed(format!("unsupported scheme in {}", self.target)));
    }
    let authority = uri
      .authority()
      .ok_or_else(|| Error::malformed("absolute-form target without authority"))?;
    let target = Target::from_authority(authority, 80)?;
    Ok((target, path_of(&uri)))
  }

  /// Origin-form path of a request read inside an intercepted tunnel.
  pub(crate) fn tunneled_path(&self) -> String {
    if self.target.starts_with('/') || self.target == "*" {
      return self.target.clone();
    }
    Uri::from_str(&self.target)
      .map(|uri| path_of(&uri))
      .unwrap_or_else(|_| self.target.clone())
  }

  pub(crate) fn expects_continue(&self) -> bool {
    self
      .headers
      .get(EXPECT)
      .and_then(|v| v.to_str().ok())
      .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
  }

  /// Whether a `Via` hop names `pseudonym`
  pub(crate) fn has_via(&self, pseudonym: &str) -> bool {
    self
      .headers
      .get_all(VIA)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .any(|hop| hop.split_whitespace().nth(1) == Some(pseudonym))
  }

  /// Serialize the head for the origin: origin-form `path`, hop-by-hop
  /// headers stripped, a `Via` hop for `pseudonym` appended and
  /// `Connection: close` set unless the request is a protocol upgrade.
  ///
  /// `Host` follows the request target for absolute-form requests and is
  /// only filled in when missing otherwise.
  pub(crate) fn to_raw(
    &self,
    path: &str,
    target: &Target,
    default_port: u16,
    upgrade: bool,
    pseudonym: &str,
  ) -> Vec<u8> {
    let mut headers = self.headers.clone();
    strip_hop_by_hop(&mut headers, upgrade);
    headers.remove(EXPECT);
    if self.target.contains("://") || !headers.contains_key(HOST) {
      if let Ok(host) = HeaderValue::from_str(&target.display_host(default_port)) {
        headers.insert(HOST, host);
      }
    }
    let protocol = match self.version {
      Version::HTTP_10 => "1.0",
      _ => "1.1",
    };
    if let Ok(via) = HeaderValue::from_str(&format!("{} {}", protocol, pseudonym)) {
      headers.append(VIA, via);
    }
    if !upgrade {
      headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
    }
    let mut raw = Vec::new();
    raw.extend_from_slice(self.method.as_str().as_bytes());
    raw.extend_from_slice(SPACE);
    raw.extend_from_slice(path.as_bytes());
    raw.extend_from_slice(SPACE);
    raw.extend_from_slice(version_str(self.version).as_bytes());
    raw.extend_from_slice(CR_LF);
    write_headers(&mut raw, &headers);
    raw.extend_from_slice(CR_LF);
    raw
  }
}

fn path_of(uri: &Uri) -> String {
  uri
    .path_and_query()
    .map(|pq| pq.as_str().to_string())
    .filter(|pq| !pq.is_empty())
    .unwrap_or_else(|| "/".to_string())
}
