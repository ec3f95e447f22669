//! `http` proxies: a single shared listener on `VhostHTTPPort` serves every
//! registered `http` proxy, routing by the `Host` header (and longest
//! matching `locations` path prefix) through [`crate::vhost::VhostRouter`]
//! (§4.6).
//!
//! Connections are spliced raw rather than parsed request-by-request: this
//! crate's server half never needs to understand HTTP bodies, only the
//! `Host` header of the first request on a connection, enough to route it
//! and optionally rewrite that header before handing the rest of the bytes
//! — request and response alike — to `copy_bidirectional` against a work
//! connection. Keep-alive requests past the first are not re-rewritten;
//! see DESIGN.md.

use std::net::SocketAddr;
use std::sync::Arc;

use revtun_common::error::RevtunError;
use revtun_common::logging::{LogMessage, Logger};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::control::ControlManager;
use crate::proxy::tcp_udp::claim_work_conn;
use crate::proxy::ProxyManager;
use crate::vhost::VhostRouter;

use crate::proxy::httpreq::{find_header, peek_request_head, rewrite_host_header};

const PEEK_MAX: usize = 16 * 1024;

pub async fn run(bind_addr: SocketAddr, vhost: Arc<RwLock<VhostRouter>>, proxies: Arc<ProxyManager>, control: Arc<ControlManager>, shutdown: tokio_util::sync::CancellationToken, logger: Logger) -> Result<(), RevtunError> {
  let listener = TcpListener::bind(bind_addr).await.map_err(|e| RevtunError::Fatal(format!("cannot bind http vhost listener on {bind_addr}: {e}")))?;

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => return Ok(()),
      accepted = listener.accept() => {
        let (stream, peer) = match accepted {
          Ok(pair) => pair,
          Err(err) => {
            logger.send(LogMessage::error(format!("http vhost listener: accept failed: {err}"))).await.ok();
            continue;
          }
        };
        let vhost = vhost.clone();
        let proxies = proxies.clone();
        let control = control.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
          if let Err(err) = handle_connection(stream, vhost, proxies, control, &logger).await {
            logger.send(LogMessage::info(format!("http vhost connection from {peer} ended: {err}"))).await.ok();
          }
        });
      }
    }
  }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, vhost: Arc<RwLock<VhostRouter>>, proxies: Arc<ProxyManager>, control: Arc<ControlManager>, logger: &Logger) -> Result<(), RevtunError> {
  let head = peek_request_head(&mut stream, PEEK_MAX).await?;
  let Some(host) = find_header(&head, "host") else {
    return Err(RevtunError::Protocol("http request carried no Host header".into()));
  };
  let host = host.split(':').next().unwrap_or(&host).to_ascii_lowercase();

  let proxy_name = {
    let router = vhost.read().await;
    router.route(&host).map(str::to_string)
  };
  let Some(proxy_name) = proxy_name else {
    return Err(RevtunError::ResourceConflict(format!("no http proxy registered for host {host}")));
  };

  let Some(registered) = proxies.get(&proxy_name).await else {
    return Err(RevtunError::ResourceConflict(format!("proxy {proxy_name} vanished between routing and dispatch")));
  };

  let rewritten_host = match &registered.config {
    revtun_common::proxy::ProxyConfig::Http(cfg) => cfg.host_header_rewrite.clone(),
    _ => None,
  };
  let head = match rewritten_host {
    Some(new_host) => rewrite_host_header(&head, &new_host),
    None => head,
  };

  let Some(mut work_conn) = claim_work_conn(&control, &registered).await else {
    return Err(RevtunError::Transient(format!("proxy {proxy_name}: no work connection available")));
  };

  use tokio::io::AsyncWriteExt;
  work_conn.write_all(&head).await?;

  let mut stream = stream;
  registered.conn_opened();
  let copied = tokio::io::copy_bidirectional(&mut stream, &mut work_conn).await;
  registered.conn_closed();
  let (bytes_in, bytes_out) = copied?;
  registered.record_traffic(bytes_in + head.len() as u64, bytes_out);
  logger.send(LogMessage::info(format!("http proxy {proxy_name}: connection closed"))).await.ok();
  Ok(())
}
