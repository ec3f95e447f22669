//! `https` proxies: a single shared listener on `VhostHTTPSPort` peeks the
//! TLS ClientHello of every incoming connection, routes by SNI through
//! [`crate::vhost::VhostRouter`], and forwards the raw TLS bytes —
//! ClientHello included — to a work connection untouched. The server never
//! terminates TLS for these; that happens client-side, in
//! `revtun_client::https_plugin` (§4.6, §4.9).

use std::net::SocketAddr;
use std::sync::Arc;

use revtun_common::error::RevtunError;
use revtun_common::inspect::parse_sni;
use revtun_common::logging::{LogMessage, Logger};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::control::ControlManager;
use crate::listener::prefixed::peek_prefix;
use crate::proxy::tcp_udp::claim_work_conn;
use crate::proxy::ProxyManager;
use crate::vhost::VhostRouter;

const PEEK_MAX: usize = 16 * 1024;

pub async fn run(bind_addr: SocketAddr, vhost: Arc<RwLock<VhostRouter>>, proxies: Arc<ProxyManager>, control: Arc<ControlManager>, shutdown: tokio_util::sync::CancellationToken, logger: Logger) -> Result<(), RevtunError> {
  let listener = TcpListener::bind(bind_addr).await.map_err(|e| RevtunError::Fatal(format!("cannot bind https vhost listener on {bind_addr}: {e}")))?;

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => return Ok(()),
      accepted = listener.accept() => {
        let (stream, peer) = match accepted {
          Ok(pair) => pair,
          Err(err) => {
            logger.send(LogMessage::error(format!("https vhost listener: accept failed: {err}"))).await.ok();
            continue;
          }
        };
        let vhost = vhost.clone();
        let proxies = proxies.clone();
        let control = control.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
          if let Err(err) = handle_connection(stream, vhost, proxies, control).await {
            logger.send(LogMessage::info(format!("https vhost connection from {peer} ended: {err}"))).await.ok();
          }
        });
      }
    }
  }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, vhost: Arc<RwLock<VhostRouter>>, proxies: Arc<ProxyManager>, control: Arc<ControlManager>) -> Result<(), RevtunError> {
  let prefix = peek_prefix(&mut stream, PEEK_MAX, |buf| buf.len() >= 5 && buf.len() as u64 >= 5 + u16::from_be_bytes([buf[3], buf[4]]) as u64).await?;

  // An empty or missing SNI is a valid boundary case (§8): it simply fails
  // to route anywhere and the connection is closed, same as any other
  // unrecognised SNI.
  let sni = parse_sni(&prefix).unwrap_or_default();
  if sni.is_empty() {
    return Err(RevtunError::Protocol("https vhost connection carried no SNI".into()));
  }

  let proxy_name = {
    let router = vhost.read().await;
    router.route(&sni).map(str::to_string)
  };
  let Some(proxy_name) = proxy_name else {
    return Err(RevtunError::ResourceConflict(format!("no https proxy registered for SNI {sni}")));
  };
  let Some(registered) = proxies.get(&proxy_name).await else {
    return Err(RevtunError::ResourceConflict(format!("proxy {proxy_name} vanished between routing and dispatch")));
  };

  let Some(mut work_conn) = claim_work_conn(&control, &registered).await else {
    return Err(RevtunError::Transient(format!("proxy {proxy_name}: no work connection available")));
  };

  use tokio::io::AsyncWriteExt;
  work_conn.write_all(&prefix).await?;

  let mut stream = stream;
  registered.conn_opened();
  let copied = tokio::io::copy_bidirectional(&mut stream, &mut work_conn).await;
  registered.conn_closed();
  let (bytes_in, bytes_out) = copied?;
  registered.record_traffic(bytes_in + prefix.len() as u64, bytes_out);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_sni_is_treated_as_unroutable_not_a_parse_error() {
    assert_eq!(parse_sni(b"not tls").unwrap_or_default(), "");
  }
}
