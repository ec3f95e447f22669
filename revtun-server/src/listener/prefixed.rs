//! A byte pipe with bytes already peeked off its front re-attached ahead of
//! the live connection, so a sniffer can consume a prefix and then hand the
//! *whole* connection — prefix included — on to whatever it routed to.
//!
//! Generalizes the one `TcpStream::peek` call the source relies on: since
//! [`crate::listener::BoxedConn`] erases the underlying transport, there is
//! no uniform non-consuming peek available once a connection has been
//! normalised, so the mux and the vhost-routed proxies all read a prefix
//! destructively and rewrap it with this type.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct Prefixed<S> {
  prefix: Vec<u8>,
  prefix_pos: usize,
  inner: S,
}

impl<S> Prefixed<S> {
  pub fn new(prefix: Vec<u8>, inner: S) -> Self {
    Self { prefix, prefix_pos: 0, inner }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
  fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
    if self.prefix_pos < self.prefix.len() {
      let remaining = &self.prefix[self.prefix_pos..];
      let n = remaining.len().min(buf.remaining());
      buf.put_slice(&remaining[..n]);
      self.prefix_pos += n;
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
  fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

/// Reads up to `max_len` bytes from `conn`, stopping early once `is_enough`
/// says the buffered prefix already contains what the caller needs (a full
/// TLS record header, a full HTTP header block, ...). Never blocks forever:
/// a single empty read (EOF) also ends the loop.
pub async fn peek_prefix<S: AsyncRead + Unpin>(conn: &mut S, max_len: usize, mut is_enough: impl FnMut(&[u8]) -> bool) -> std::io::Result<Vec<u8>> {
  use tokio::io::AsyncReadExt;

  let mut buf = Vec::with_capacity(512.min(max_len));
  let mut chunk = [0u8; 512];
  loop {
    if is_enough(&buf) || buf.len() >= max_len {
      break;
    }
    let n = conn.read(&mut chunk).await?;
    if n == 0 {
      break;
    }
    buf.extend_from_slice(&chunk[..n]);
  }
  Ok(buf)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn prefix_is_replayed_before_the_live_stream() {
    let (mut client, server) = tokio::io::duplex(64);
    client.write_all(b"live-bytes").await.unwrap();
    drop(client);
    let mut prefixed = Prefixed::new(b"prefix-".to_vec(), server);
    let mut out = Vec::new();
    prefixed.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"prefix-live-bytes");
  }

  #[tokio::test]
  async fn peek_prefix_stops_once_satisfied() {
    let (mut client, mut server) = tokio::io::duplex(64);
    tokio::spawn(async move {
      client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
      let _ = client.write_all(b"more after the line").await;
    });
    let prefix = peek_prefix(&mut server, 4096, |buf| buf.windows(2).any(|w| w == b"\r\n")).await.unwrap();
    assert!(prefix.starts_with(b"GET / HTTP/1.1\r\n"));
  }
}
