//! KCP (reliable-over-UDP) transport listener, a peer of the bind-port TCP
//! listener (§4.3). `tokio_kcp::KcpListener` already yields a stream that
//! implements `AsyncRead`/`AsyncWrite`, so each accepted session is boxed
//! directly with no adapter needed.

use std::net::SocketAddr;

use revtun_common::error::RevtunError;
use revtun_common::logging::{LogMessage, Logger};
use tokio::sync::mpsc;
use tokio_kcp::{KcpConfig, KcpListener};
use tokio_util::sync::CancellationToken;

use crate::listener::Accepted;

/// Runs the KCP accept loop until `shutdown` fires, forwarding every
/// accepted session to `tx`. A bind failure is fatal to this listener only
/// — other transports keep running (§7 Fatal class).
pub async fn run(bind_addr: SocketAddr, tx: mpsc::Sender<Accepted>, shutdown: CancellationToken, logger: Logger) -> Result<(), RevtunError> {
  let mut listener = KcpListener::bind(KcpConfig::default(), bind_addr)
    .await
    .map_err(|e| RevtunError::Fatal(format!("cannot bind kcp listener on {bind_addr}: {e}")))?;

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => return Ok(()),
      accepted = listener.accept() => {
        match accepted {
          Ok((stream, peer_addr)) => {
            let accepted = Accepted { conn: Box::new(stream), peer_addr };
            if tx.send(accepted).await.is_err() {
              return Ok(());
            }
          }
          Err(err) => {
            logger.send(LogMessage::error(format!("kcp accept failed: {err}"))).await.ok();
          }
        }
      }
    }
  }
}
