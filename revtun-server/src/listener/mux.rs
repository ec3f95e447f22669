//! The shared bind-port session multiplexer (§4.3): peeks the first bytes
//! of every plain-TCP connection on `BindPort` and routes it to the
//! WebSocket handshake, the TLS sub-listener, or the plain control
//! sub-listener, before the connection is ever handed a frame codec.
//!
//! `Transport.TCPMux` (smux-style stream multiplexing over one accepted
//! transport connection) has no counterpart crate in this workspace's
//! dependency stack, so it is implemented as an identity multiplexer: one
//! transport connection still yields exactly one logical connection. See
//! DESIGN.md.

use std::net::SocketAddr;

use revtun_common::error::RevtunError;
use revtun_common::logging::{LogMessage, Logger};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use super::prefixed::{peek_prefix, Prefixed};
use super::websocket::{self, WEBSOCKET_PATH};
use super::{tls as tls_listener, BoxedConn};

/// The byte a client that speaks the framework's own "opt into TLS without
/// a real TLS record" convention sends as the very first byte of the
/// connection, consumed (not replayed) before the TLS handshake begins.
pub const TLS_OPT_IN_HEAD_BYTE: u8 = 0x17;
const TLS_RECORD_HEAD_BYTE: u8 = 0x16;
const PEEK_MAX: usize = 4096;

pub struct MuxConfig {
  pub tls_acceptor: Option<TlsAcceptor>,
  pub tls_force: bool,
}

/// Classifies and normalises one freshly accepted TCP connection. Returns
/// `None` when the connection should simply be dropped (TLS required but
/// not offered, or an I/O error during the peek/handshake).
pub async fn demux(mut stream: TcpStream, peer_addr: SocketAddr, config: &MuxConfig, logger: &Logger) -> Option<BoxedConn> {
  let prefix = match peek_prefix(&mut stream, PEEK_MAX, |buf| {
    !buf.is_empty() && (buf[0] != b'G' || buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.windows(2).any(|w| w == b"\r\n"))
  })
  .await
  {
    Ok(buf) => buf,
    Err(err) => {
      logger.send(LogMessage::error(format!("mux: peek failed for {peer_addr}: {err}"))).await.ok();
      return None;
    }
  };

  if prefix.is_empty() {
    return None;
  }

  let first = prefix[0];

  if first == TLS_RECORD_HEAD_BYTE || first == TLS_OPT_IN_HEAD_BYTE {
    let Some(acceptor) = &config.tls_acceptor else {
      logger.send(LogMessage::error(format!("mux: TLS connection from {peer_addr} but no control-plane cert configured"))).await.ok();
      return None;
    };
    // The opt-in marker byte is consumed, not replayed: real TLS record
    // bytes always start the handshake, so only strip the first byte when
    // it was our synthetic marker rather than a genuine record header.
    let replay = if first == TLS_OPT_IN_HEAD_BYTE { prefix[1..].to_vec() } else { prefix };
    let wrapped = Prefixed::new(replay, stream);
    return match tls_listener::accept_tls(acceptor, wrapped).await {
      Ok(tls_stream) => Some(Box::new(tls_stream)),
      Err(err) => {
        logger.send(LogMessage::error(format!("mux: TLS handshake with {peer_addr} failed: {err}"))).await.ok();
        None
      }
    };
  }

  if config.tls_force {
    logger
      .send(LogMessage::error(format!("mux: rejecting non-TLS connection from {peer_addr}: Transport.TLS.Force is set")))
      .await
      .ok();
    return None;
  }

  if prefix.starts_with(b"GET ") && is_websocket_upgrade_line(&prefix) {
    let wrapped = Prefixed::new(prefix, stream);
    return match websocket::upgrade(wrapped).await {
      Ok(conn) => Some(conn),
      Err(err) => {
        logger.send(LogMessage::error(format!("mux: websocket handshake with {peer_addr} failed: {err}"))).await.ok();
        None
      }
    };
  }

  Some(Box::new(Prefixed::new(prefix, stream)))
}

fn is_websocket_upgrade_line(prefix: &[u8]) -> bool {
  let line_end = prefix.windows(2).position(|w| w == b"\r\n").unwrap_or(prefix.len());
  let line = &prefix[..line_end];
  let expected = format!("GET {WEBSOCKET_PATH} ");
  line.starts_with(expected.as_bytes())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn plain_control_byte_passes_through_untouched() {
    let (mut client, server) = tokio::io::duplex(64);
    use tokio::io::AsyncWriteExt;
    client.write_all(&[1u8, 0, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();
    drop(client);

    let prefix = peek_prefix(&mut { server }, PEEK_MAX, |buf| !buf.is_empty() && buf[0] != b'G').await;
    let prefix = prefix.unwrap();
    assert_eq!(prefix[0], 1u8);
  }

  #[test]
  fn recognizes_the_websocket_upgrade_request_line() {
    let line = format!("GET {WEBSOCKET_PATH} HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(is_websocket_upgrade_line(line.as_bytes()));
    assert!(!is_websocket_upgrade_line(b"GET /other HTTP/1.1\r\n"));
  }
}
