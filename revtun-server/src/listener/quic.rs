//! QUIC transport listener (§4.3): "QUIC yields `Connection` values whose
//! accepted streams are each dispatched as independent connections." Every
//! bidirectional stream a `quinn::Connection` accepts is bridged onto a
//! `tokio::io::duplex` pair so it can be boxed as an ordinary [`BoxedConn`]
//! without hand-rolling `AsyncRead`/`AsyncWrite` over split send/recv halves.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::{Endpoint, RecvStream, SendStream, ServerConfig as QuicServerConfig};
use revtun_common::error::RevtunError;
use revtun_common::logging::{LogMessage, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::listener::Accepted;

const BRIDGE_BUF: usize = 64 * 1024;

pub fn build_server_config(cert_chain: Vec<rustls_pki_types::CertificateDer<'static>>, key: rustls_pki_types::PrivateKeyDer<'static>) -> Result<QuicServerConfig, RevtunError> {
  QuicServerConfig::with_single_cert(cert_chain, key).map_err(|e| RevtunError::Fatal(format!("invalid QUIC certificate: {e}")))
}

pub async fn run(bind_addr: SocketAddr, server_config: QuicServerConfig, tx: mpsc::Sender<Accepted>, shutdown: CancellationToken, logger: Logger) -> Result<(), RevtunError> {
  let endpoint = Endpoint::server(server_config, bind_addr).map_err(|e| RevtunError::Fatal(format!("cannot bind quic endpoint on {bind_addr}: {e}")))?;

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => {
        endpoint.close(0u32.into(), b"shutdown");
        return Ok(());
      }
      incoming = endpoint.accept() => {
        let Some(incoming) = incoming else { return Ok(()) };
        let tx = tx.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
          match incoming.await {
            Ok(connection) => drain_streams(connection, tx, logger).await,
            Err(err) => {
              logger.send(LogMessage::error(format!("quic handshake failed: {err}"))).await.ok();
            }
          }
        });
      }
    }
  }
}

async fn drain_streams(connection: quinn::Connection, tx: mpsc::Sender<Accepted>, logger: Logger) {
  let peer_addr = connection.remote_address();
  loop {
    match connection.accept_bi().await {
      Ok((send, recv)) => {
        let accepted = Accepted { conn: Box::new(bridge(send, recv)), peer_addr };
        if tx.send(accepted).await.is_err() {
          return;
        }
      }
      Err(_) => return,
    }
  }
}

/// Spawns a pair of pump tasks copying bytes between a QUIC stream pair and
/// one half of an in-process duplex pipe, returning the other half as a
/// plain `AsyncRead + AsyncWrite` value.
fn bridge(mut send: SendStream, mut recv: RecvStream) -> tokio::io::DuplexStream {
  let (local, remote) = tokio::io::duplex(BRIDGE_BUF);
  let (mut remote_read, mut remote_write) = tokio::io::split(remote);

  tokio::spawn(async move {
    let mut buf = vec![0u8; BRIDGE_BUF];
    loop {
      match recv.read(&mut buf).await {
        Ok(Some(n)) if n > 0 => {
          if remote_write.write_all(&buf[..n]).await.is_err() {
            break;
          }
        }
        _ => break,
      }
    }
  });
  tokio::spawn(async move {
    let mut buf = vec![0u8; BRIDGE_BUF];
    loop {
      match remote_read.read(&mut buf).await {
        Ok(0) => break,
        Ok(n) => {
          if send.write_all(&buf[..n]).await.is_err() {
            break;
          }
        }
        Err(_) => break,
      }
    }
    send.finish().ok();
  });

  local
}
