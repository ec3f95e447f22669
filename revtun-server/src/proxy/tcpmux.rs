//! `tcpmux` proxies (HTTP CONNECT): one shared public port reads a
//! `CONNECT host:port HTTP/1.1` request line, routes by `host` through the
//! same [`crate::vhost::VhostRouter`] the `http`/`https` proxies use, and
//! then — after replying `200 Connection Established` — splices the
//! remainder of the connection raw to a work connection (§4.6).

use std::net::SocketAddr;
use std::sync::Arc;

use revtun_common::error::RevtunError;
use revtun_common::logging::{LogMessage, Logger};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::control::ControlManager;
use crate::proxy::httpreq::{parse_connect_target, peek_request_head};
use crate::proxy::tcp_udp::claim_work_conn;
use crate::proxy::ProxyManager;
use crate::vhost::VhostRouter;

const PEEK_MAX: usize = 8 * 1024;
const CONNECT_OK: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

pub async fn run(bind_addr: SocketAddr, vhost: Arc<RwLock<VhostRouter>>, proxies: Arc<ProxyManager>, control: Arc<ControlManager>, shutdown: tokio_util::sync::CancellationToken, logger: Logger) -> Result<(), RevtunError> {
  let listener = TcpListener::bind(bind_addr).await.map_err(|e| RevtunError::Fatal(format!("cannot bind tcpmux connect listener on {bind_addr}: {e}")))?;

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => return Ok(()),
      accepted = listener.accept() => {
        let (stream, peer) = match accepted {
          Ok(pair) => pair,
          Err(err) => {
            logger.send(LogMessage::error(format!("tcpmux connect listener: accept failed: {err}"))).await.ok();
            continue;
          }
        };
        let vhost = vhost.clone();
        let proxies = proxies.clone();
        let control = control.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
          if let Err(err) = handle_connection(stream, vhost, proxies, control).await {
            logger.send(LogMessage::info(format!("tcpmux connect connection from {peer} ended: {err}"))).await.ok();
          }
        });
      }
    }
  }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, vhost: Arc<RwLock<VhostRouter>>, proxies: Arc<ProxyManager>, control: Arc<ControlManager>) -> Result<(), RevtunError> {
  let head = peek_request_head(&mut stream, PEEK_MAX).await?;
  let Some((host, _port)) = parse_connect_target(&head) else {
    return Err(RevtunError::Protocol("expected a CONNECT request line".into()));
  };
  let host = host.to_ascii_lowercase();

  let proxy_name = {
    let router = vhost.read().await;
    router.route(&host).map(str::to_string)
  };
  let Some(proxy_name) = proxy_name else {
    return Err(RevtunError::ResourceConflict(format!("no tcpmux proxy registered for host {host}")));
  };
  let Some(registered) = proxies.get(&proxy_name).await else {
    return Err(RevtunError::ResourceConflict(format!("proxy {proxy_name} vanished between routing and dispatch")));
  };

  let Some(mut work_conn) = claim_work_conn(&control, &registered).await else {
    stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await.ok();
    return Err(RevtunError::Transient(format!("proxy {proxy_name}: no work connection available")));
  };

  stream.write_all(CONNECT_OK).await?;
  registered.conn_opened();
  let copied = tokio::io::copy_bidirectional(&mut stream, &mut work_conn).await;
  registered.conn_closed();
  let (bytes_in, bytes_out) = copied?;
  registered.record_traffic(bytes_in, bytes_out);
  Ok(())
}
