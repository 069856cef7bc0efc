use crate::errors::new_io_error;
use crate::headers::{parse_headers, parse_version, read_head, version_str, write_headers};
use crate::{CR_LF, SPACE};
use http::{HeaderMap, StatusCode, Version};
use std::io::ErrorKind;
use tokio::io::AsyncBufRead;

/// Status line and headers as received from the origin.
#[derive(Clone, Debug)]
pub(crate) struct ResponseHead {
  pub(crate) version: Version,
  pub(crate) status: StatusCode,
  pub(crate) reason: Option<String>,
  pub(crate) headers: HeaderMap,
}

impl ResponseHead {
  /// Read a response head. A connection closed before the status line is
  /// an `UnexpectedEof`; anything unparsable is `InvalidData`.
  pub(crate) async fn read<R>(reader: &mut R, max_head_size: usize) -> std::io::Result<Self>
  where
    R: AsyncBufRead + Unpin,
  {
    match read_head(reader, max_head_size).await? {
      Some(lines) => Self::parse(&lines),
      None => Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "origin closed the connection before responding",
      )),
    }
  }

  pub(crate) fn parse(lines: &[Vec<u8>]) -> std::io::Result<Self> {
    let (status_line, header_lines) = lines
      .split_first()
      .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "missing status line"))?;
    let mut version = None;
    let mut status = None;
    let mut reason = None;
    for (index, vc) in status_line.splitn(3, |b| b == &b' ').enumerate() {
      match index {
        0 => version = parse_version(vc),
        1 => status = StatusCode::from_bytes(vc).ok(),
        _ => {
          if !vc.is_empty() {
            reason = Some(String::from_utf8_lossy(vc).into_owned());
          }
        }
      }
    }
    let (Some(version), Some(status)) = (version, status) else {
      return Err(new_io_error(
        ErrorKind::InvalidData,
        "invalid http version and status_code data",
      ));
    };
    let headers = parse_headers(header_lines).map_err(|e| new_io_error(ErrorKind::InvalidData, &e.to_string()))?;
    Ok(ResponseHead {
      version,
      status,
      reason,
      headers,
    })
  }

  /// Interim 1xx response other than `101 Switching Protocols`
  pub(crate) fn is_interim(&self) -> bool {
    self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
  }

  /// Serialize for the client with the given headers.
  pub(crate) fn to_raw(&self, headers: &HeaderMap) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(version_str(self.version).as_bytes());
    raw.extend_from_slice(SPACE);
    raw.extend_from_slice(self.status.as_str().as_bytes());
    raw.extend_from_slice(SPACE);
    let reason = self
      .reason
      .as_deref()
      .or_else(|| self.status.canonical_reason())
      .unwrap_or_default();
    raw.extend_from_slice(reason.as_bytes());
    raw.extend_from_slice(CR_LF);
    write_headers(&mut raw, headers);
    raw.extend_from_slice(CR_LF);
    raw
  }
}

/// A response generated by the proxy itself, always closing the connection.
pub(crate) fn proxy_response(status: StatusCode, body: &str) -> Vec<u8> {
  format!(
    "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    status.as_str(),
    status.canonical_reason().unwrap_or_default(),
    body.len(),
    body
  )
  .into_bytes()
}
