//! Plain-TCP bind-port listener: accepts raw connections and feeds each one
//! through [`super::mux::demux`] before handing the normalised result to
//! the dispatcher (§4.3, §4.4).

use std::net::SocketAddr;

use revtun_common::error::RevtunError;
use revtun_common::logging::{LogMessage, Logger};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::mux::{demux, MuxConfig};
use super::Accepted;

pub async fn run(bind_addr: SocketAddr, mux_config: MuxConfig, tx: mpsc::Sender<Accepted>, shutdown: CancellationToken, logger: Logger) -> Result<(), RevtunError> {
  let listener = TcpListener::bind(bind_addr).await.map_err(|e| RevtunError::Fatal(format!("cannot bind tcp listener on {bind_addr}: {e}")))?;
  let mux_config = std::sync::Arc::new(mux_config);

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => return Ok(()),
      accepted = listener.accept() => {
        let (stream, peer_addr) = match accepted {
          Ok(pair) => pair,
          Err(err) => {
            logger.send(LogMessage::error(format!("tcp bind-port accept failed: {err}"))).await.ok();
            continue;
          }
        };
        stream.set_nodelay(true).ok();
        let tx = tx.clone();
        let logger = logger.clone();
        let mux_config = mux_config.clone();
        tokio::spawn(async move {
          if let Some(conn) = demux(stream, peer_addr, &mux_config, &logger).await {
            tx.send(Accepted { conn, peer_addr }).await.ok();
          }
        });
      }
    }
  }
}
