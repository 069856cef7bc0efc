//! Message body framing and streaming relay
//!
//! Bodies are forwarded as they arrive. Chunked bodies keep their chunk
//! framing on the wire, while the capture sees the decoded bytes.
use crate::errors::{new_io_error, Error, Result};
use crate::headers::read_line;
use crate::record::BodyBuffer;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const RELAY_BUFFER: usize = 16 * 1024;
const CHUNK_LINE_LIMIT: usize = 4 * 1024;
const TRAILER_LIMIT: usize = 64 * 1024;

/// How the end of a message body is found
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyFraming {
  Empty,
  Length(u64),
  Chunked,
  UntilClose,
}

/// Which side of a relay failed
#[derive(Debug)]
pub(crate) enum RelayError {
  Source(std::io::Error),
  Sink(std::io::Error),
}

impl BodyFraming {
  /// Request bodies are either chunked or length delimited.
  pub(crate) fn for_request(headers: &HeaderMap) -> Result<Self> {
    if headers.contains_key(TRANSFER_ENCODING) {
      if is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
      }
      return Err(Error::malformed("unsupported transfer-encoding"));
    }
    match content_length(headers) {
      Ok(Some(0)) | Ok(None) => Ok(BodyFraming::Empty),
      Ok(Some(n)) => Ok(BodyFraming::Length(n)),
      Err(()) => Err(Error::malformed("invalid content-length")),
    }
  }

  pub(crate) fn for_response(method: &Method, status: StatusCode, headers: &HeaderMap) -> std::io::Result<Self> {
    if method == Method::HEAD
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      return Ok(BodyFraming::Empty);
    }
    if headers.contains_key(TRANSFER_ENCODING) {
      if is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
      }
      return Ok(BodyFraming::UntilClose);
    }
    match content_length(headers) {
      Ok(Some(0)) => Ok(BodyFraming::Empty),
      Ok(Some(n)) => Ok(BodyFraming::Length(n)),
      Ok(None) => Ok(BodyFraming::UntilClose),
      Err(()) => Err(new_io_error(ErrorKind::InvalidData, "invalid content-length")),
    }
  }

  pub(crate) fn is_until_close(&self) -> bool {
    matches!(self, BodyFraming::UntilClose)
  }
}

/// The final transfer coding is `chunked`.
fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .last()
    .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
}

/// Every `Content-Length` value must agree.
fn content_length(headers: &HeaderMap) -> std::result::Result<Option<u64>, ()> {
  let mut length = None;
  for value in headers.get_all(CONTENT_LENGTH) {
    let value = value.to_str().map_err(|_| ())?;
    for part in value.split(',') {
      let n: u64 = part.trim().parse().map_err(|_| ())?;
      if length.is_some_and(|l| l != n) {
        return Err(());
      }
      length = Some(n);
    }
  }
  Ok(length)
}

/// Forward one body from `reader` to `writer`, capturing the decoded bytes.
pub(crate) async fn relay<R, W>(
  reader: &mut R,
  writer: &mut W,
  framing: BodyFraming,
  capture: &mut BodyBuffer,
) -> std::result::Result<(), RelayError>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  match framing {
    BodyFraming::Empty => {}
    BodyFraming::Length(n) => copy_exact(reader, writer, n, capture).await?,
    BodyFraming::UntilClose => copy_until_close(reader, writer, capture).await?,
    BodyFraming::Chunked => copy_chunked(reader, writer, capture).await?,
  }
  writer.flush().await.map_err(RelayError::Sink)
}

async fn copy_exact<R, W>(
  reader: &mut R,
  writer: &mut W,
  mut remaining: u64,
  capture: &mut BodyBuffer,
) -> std::result::Result<(), RelayError>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = vec![0; RELAY_BUFFER];
  while remaining > 0 {
    let want = remaining.min(buffer.len() as u64) as usize;
    let n = reader.read(&mut buffer[..want]).await.map_err(RelayError::Source)?;
    if n == 0 {
      return Err(RelayError::Source(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed inside message body",
      )));
    }
    capture.push(&buffer[..n]);
    writer.write_all(&buffer[..n]).await.map_err(RelayError::Sink)?;
    remaining -= n as u64;
  }
  Ok(())
}

async fn copy_until_close<R, W>(
  reader: &mut R,
  writer: &mut W,
  capture: &mut BodyBuffer,
) -> std::result::Result<(), RelayError>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = vec![0; RELAY_BUFFER];
  loop {
    let n = reader.read(&mut buffer).await.map_err(RelayError::Source)?;
    if n == 0 {
      return Ok(());
    }
    capture.push(&buffer[..n]);
    writer.write_all(&buffer[..n]).await.map_err(RelayError::Sink)?;
  }
}

async fn copy_chunked<R, W>(
  reader: &mut R,
  writer: &mut W,
  capture: &mut BodyBuffer,
) -> std::result::Result<(), RelayError>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  loop {
    let mut line = Vec::new();
    let mut budget = CHUNK_LINE_LIMIT;
    let n = read_line(reader, &mut line, &mut budget)
      .await
      .map_err(RelayError::Source)?;
    if n == 0 {
      return Err(RelayError::Source(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed inside chunked body",
      )));
    }
    let size = chunk_size(&line).map_err(RelayError::Source)?;
    writer.write_all(&line).await.map_err(RelayError::Sink)?;
    if size == 0 {
      return copy_trailers(reader, writer).await;
    }
    copy_exact(reader, writer, size, &mut *capture).await?;
    let mut crlf = Vec::new();
    let mut budget = CHUNK_LINE_LIMIT;
    read_line(reader, &mut crlf, &mut budget)
      .await
      .map_err(RelayError::Source)?;
    if crate::headers::trim_eol(&crlf).is_empty() && !crlf.is_empty() {
      writer.write_all(&crlf).await.map_err(RelayError::Sink)?;
    } else {
      return Err(RelayError::Source(new_io_error(
        ErrorKind::InvalidData,
        "missing CRLF after chunk data",
      )));
    }
  }
}

async fn copy_trailers<R, W>(reader: &mut R, writer: &mut W) -> std::result::Result<(), RelayError>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut budget = TRAILER_LIMIT;
  loop {
    let mut line = Vec::new();
    let n = read_line(reader, &mut line, &mut budget)
      .await
      .map_err(RelayError::Source)?;
    if n == 0 {
      // tolerate a peer that closes right after the last chunk
      return writer.write_all(crate::CR_LF).await.map_err(RelayError::Sink);
    }
    writer.write_all(&line).await.map_err(RelayError::Sink)?;
    if crate::headers::trim_eol(&line).is_empty() {
      return Ok(());
    }
  }
}

fn chunk_size(line: &[u8]) -> std::io::Result<u64> {
  let line = crate::headers::trim_eol(line);
  let size = line.split(|b| b == &b';').next().unwrap_or_default().trim_ascii();
  std::str::from_utf8(size)
    .ok()
    .and_then(|s| u64::from_str_radix(s, 16).ok())
    .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "invalid chunk size"))
}
