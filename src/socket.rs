use std::future::Future;
use std::io::{Error, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tokio_rustls::{client, server};

/// A proxied connection, either side of the proxy.
///
/// Every read and write is bounded by the idle timeout: an operation that
/// makes no progress for that long fails with `ErrorKind::TimedOut`.
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  idle_timeout: Option<Duration>,
  read_deadline: Option<Pin<Box<Sleep>>>,
  write_deadline: Option<Pin<Box<Sleep>>>,
}

/// Transport under a [`Socket`]
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS towards an origin
  Tls(Box<client::TlsStream<TcpStream>>),
  /// TLS terminated by the proxy on a client connection
  Intercepted(Box<server::TlsStream<BufReader<Socket>>>),
}

impl Socket {
  pub(crate) fn new(inner: MaybeTlsStream, idle_timeout: Option<Duration>) -> Self {
    Self {
      inner,
      idle_timeout,
      read_deadline: None,
      write_deadline: None,
    }
  }

  /// Change the idle timeout; `None` lets the connection idle forever.
  pub(crate) fn set_idle_timeout(&mut self, idle_timeout: Option<Duration>) {
    self.idle_timeout = idle_timeout;
    self.read_deadline = None;
    self.write_deadline = None;
  }

  pub(crate) async fn tls<F, Fut>(self, func: F) -> Result<Self, Error>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: Future<Output = Result<client::TlsStream<TcpStream>, Error>>,
  {
    match self.inner {
      MaybeTlsStream::Tcp(t) => Ok(Self::new(
        MaybeTlsStream::Tls(Box::new(func(t).await?)),
        self.idle_timeout,
      )),
      inner => Ok(Self::new(inner, self.idle_timeout)),
    }
  }
}

/// Poll `deadline`, arming it first; `true` once the idle timeout elapsed.
fn idle_elapsed(
  deadline: &mut Option<Pin<Box<Sleep>>>,
  idle_timeout: Option<Duration>,
  cx: &mut Context<'_>,
) -> bool {
  let Some(timeout) = idle_timeout else {
    return false;
  };
  let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
  if sleep.as_mut().poll(cx).is_ready() {
    *deadline = None;
    return true;
  }
  false
}

fn timed_out(what: &str) -> Error {
  Error::new(ErrorKind::TimedOut, format!("idle {} timeout", what))
}

// 实现socket的读写
impl AsyncRead for Socket {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(result) => {
        this.read_deadline = None;
        Poll::Ready(result)
      }
      Poll::Pending => {
        if idle_elapsed(&mut this.read_deadline, this.idle_timeout, cx) {
          return Poll::Ready(Err(timed_out("read")));
        }
        Poll::Pending
      }
    }
  }
}
impl AsyncWrite for Socket {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_write(cx, buf) {
      Poll::Ready(result) => {
        this.write_deadline = None;
        Poll::Ready(result)
      }
      Poll::Pending => {
        if idle_elapsed(&mut this.write_deadline, this.idle_timeout, cx) {
          return Poll::Ready(Err(timed_out("write")));
        }
        Poll::Pending
      }
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_flush(cx) {
      Poll::Ready(result) => {
        this.write_deadline = None;
        Poll::Ready(result)
      }
      Poll::Pending => {
        if idle_elapsed(&mut this.write_deadline, this.idle_timeout, cx) {
          return Poll::Ready(Err(timed_out("write")));
        }
        Poll::Pending
      }
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}
impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
      MaybeTlsStream::Intercepted(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}
impl AsyncWrite for MaybeTlsStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
      MaybeTlsStream::Intercepted(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
      MaybeTlsStream::Intercepted(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }
  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
      MaybeTlsStream::Intercepted(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}
