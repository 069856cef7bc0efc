//! HTTP/1.x head reading and header handling shared by requests and responses
use crate::errors::new_io_error;
use crate::{COLON_SPACE, CR_LF};
use http::header::{CONNECTION, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Version};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Headers that describe a single hop and never cross the proxy.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "proxy-connection",
  "keep-alive",
  "proxy-authorization",
  "te",
  "trailer",
  "upgrade",
];

/// Read one CRLF (or bare LF) terminated line, spending at most `budget`
/// bytes. Returns the number of bytes read; zero means EOF.
pub(crate) async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, budget: &mut usize) -> std::io::Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  if *budget == 0 {
    return Err(new_io_error(ErrorKind::InvalidData, "message head too large"));
  }
  let limit = *budget as u64;
  let n = (&mut *reader).take(limit).read_until(b'\n', line).await?;
  if n > 0 && !line.ends_with(b"\n") {
    if n as u64 >= limit {
      return Err(new_io_error(ErrorKind::InvalidData, "message head too large"));
    }
    return Err(new_io_error(ErrorKind::UnexpectedEof, "connection closed inside message head"));
  }
  *budget -= n;
  Ok(n)
}

/// Read a message head: the start line and every header line up to the
/// blank line. Leading blank lines are skipped. `Ok(None)` means the peer
/// closed the connection before sending anything.
pub(crate) async fn read_head<R>(reader: &mut R, max_head_size: usize) -> std::io::Result<Option<Vec<Vec<u8>>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut budget = max_head_size;
  let mut lines = Vec::new();
  loop {
    let mut line = Vec::new();
    let n = read_line(reader, &mut line, &mut budget).await?;
    if n == 0 {
      if lines.is_empty() {
        return Ok(None);
      }
      return Err(new_io_error(ErrorKind::UnexpectedEof, "connection closed inside message head"));
    }
    let line = trim_eol(&line);
    if line.is_empty() {
      if lines.is_empty() {
        continue;
      }
      return Ok(Some(lines));
    }
    lines.push(line.to_vec());
  }
}

pub(crate) fn trim_eol(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

/// Parse header lines into a map, keeping repeated names in order.
pub(crate) fn parse_headers(lines: &[Vec<u8>]) -> Result<HeaderMap, http::Error> {
  let mut headers = HeaderMap::new();
  for line in lines {
    let (k, v) = parser_headers(line)?;
    headers.append(k, v);
  }
  Ok(headers)
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(HeaderName, HeaderValue), http::Error> {
  let buffer = trim_eol(buffer);
  let (name, value) = match buffer.iter().position(|b| b == &b':') {
    Some(idx) => (&buffer[..idx], &buffer[idx + 1..]),
    None => (buffer, &b""[..]),
  };
  let k = HeaderName::from_bytes(name)?;
  let v = HeaderValue::from_bytes(value.trim_ascii())?;
  Ok((k, v))
}

pub(crate) fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
  for (name, value) in headers {
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(COLON_SPACE);
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(CR_LF);
  }
}

pub(crate) fn version_str(version: Version) -> &'static str {
  match version {
    Version::HTTP_10 => "HTTP/1.0",
    _ => "HTTP/1.1",
  }
}

pub(crate) fn parse_version(raw: &[u8]) -> Option<Version> {
  match raw {
    b"HTTP/1.0" => Some(Version::HTTP_10),
    b"HTTP/1.1" => Some(Version::HTTP_11),
    _ => None,
  }
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = String> + '_ {
  headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase())
    .filter(|t| !t.is_empty())
}

/// Whether `Connection` lists `token`
pub(crate) fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
  connection_tokens(headers).any(|t| t == token)
}

/// Whether the sender wants the connection closed after this message.
pub(crate) fn wants_close(version: Version, headers: &HeaderMap) -> bool {
  if has_connection_token(headers, "close") {
    return true;
  }
  version == Version::HTTP_10 && !has_connection_token(headers, "keep-alive")
}

/// A request asking to switch protocols (e.g. WebSocket).
pub(crate) fn is_upgrade(headers: &HeaderMap) -> bool {
  headers.contains_key(UPGRADE) && has_connection_token(headers, "upgrade")
}

/// Remove hop-by-hop headers, including those named by `Connection`.
/// With `keep_upgrade`, `Upgrade` survives and `Connection: upgrade` is
/// restored so the origin can switch protocols.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
  let upgrade: Vec<HeaderValue> = headers.get_all(UPGRADE).iter().cloned().collect();
  let listed: Vec<HeaderName> = connection_tokens(headers)
    .filter_map(|t| HeaderName::from_bytes(t.as_bytes()).ok())
    .collect();
  for name in listed {
    headers.remove(name);
  }
  for name in HOP_BY_HOP {
    headers.remove(*name);
  }
  if keep_upgrade && !upgrade.is_empty() {
    for value in upgrade {
      headers.append(UPGRADE, value);
    }
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
  }
}
