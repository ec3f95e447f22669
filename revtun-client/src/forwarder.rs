//! Local delivery for a `Running` [`crate::wrapper::ProxyWrapper`] (§4.8,
//! §5 "one wrapper-loop task per proxy"): keeps the work-connection pool
//! topped up to `pool_count` and, for each one claimed by the server,
//! bridges it to the configured local backend. `tcp`/`http`/`https`
//! (without a plugin)/`tcpmux` all reduce to the same byte-for-byte splice;
//! `udp` instead relays framed datagrams, mirroring the server's own
//! `proxy::tcp_udp::serve_udp`; an `https` proxy with a plugin configured
//! hands the connection to the plugin instead of dialing a local backend
//! directly (§4.9).

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use revtun_common::logging::{LogMessage, Logger};
use revtun_common::msg::{Message, UdpPacket};
use revtun_common::proxy::ProxyConfig;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyWrapperConfig;
use crate::control::ControlClient;
use crate::transport::BoxedConn;

const REDIAL_BACKOFF: Duration = Duration::from_secs(2);
const UDP_MAX_PACKET: usize = 64 * 1024;

/// Runs for as long as the wrapper stays `Running`: maintains up to
/// `pool_count` concurrent work connections, each independently dialed,
/// bridged, and redialed on completion.
pub async fn run(proxy: Arc<ProxyWrapperConfig>, control: Arc<ControlClient>, pool_count: u32, shutdown: CancellationToken, logger: Logger, plugin_tx: Option<mpsc::UnboundedSender<BoxedConn>>) {
  if matches!(proxy.config, ProxyConfig::Udp(_)) {
    run_udp(proxy, control, shutdown, logger).await;
    return;
  }

  let mut tasks = Vec::new();
  for _ in 0..pool_count.max(1) {
    let proxy = proxy.clone();
    let control = control.clone();
    let shutdown = shutdown.clone();
    let logger = logger.clone();
    let plugin_tx = plugin_tx.clone();
    tasks.push(tokio::spawn(async move { tcp_slot_loop(proxy, control, shutdown, logger, plugin_tx).await }));
  }
  for task in tasks {
    task.await.ok();
  }
}

async fn tcp_slot_loop(proxy: Arc<ProxyWrapperConfig>, control: Arc<ControlClient>, shutdown: CancellationToken, logger: Logger, plugin_tx: Option<mpsc::UnboundedSender<BoxedConn>>) {
  loop {
    if shutdown.is_cancelled() {
      return;
    }
    let work_conn = match control.dial_work_conn(&proxy.name).await {
      Ok(conn) => conn,
      Err(err) => {
        logger.send(LogMessage::error(format!("proxy {}: failed to dial work connection: {err}", proxy.name))).await.ok();
        tokio::select! {
          _ = shutdown.cancelled() => return,
          _ = tokio::time::sleep(REDIAL_BACKOFF) => continue,
        }
      }
    };

    if let Some(plugin_tx) = &plugin_tx {
      if plugin_tx.send(work_conn).is_err() {
        return;
      }
      continue;
    }

    let (local_ip, local_port) = proxy.config.local_addr();
    let addr = format!("{local_ip}:{local_port}");
    let proxy_name = proxy.name.clone();
    let logger = logger.clone();
    tokio::spawn(async move { bridge_to_local(work_conn, &addr, &proxy_name, logger).await });
  }
}

async fn bridge_to_local(mut work_conn: BoxedConn, local_addr: &str, proxy_name: &str, logger: Logger) {
  let mut local_conn = match TcpStream::connect(local_addr).await {
    Ok(conn) => conn,
    Err(err) => {
      logger.send(LogMessage::error(format!("proxy {proxy_name}: local dial to {local_addr} failed: {err}"))).await.ok();
      return;
    }
  };
  if let Err(err) = tokio::io::copy_bidirectional(&mut work_conn, &mut local_conn).await {
    logger.send(LogMessage::info(format!("proxy {proxy_name}: connection ended: {err}"))).await.ok();
  }
}

async fn run_udp(proxy: Arc<ProxyWrapperConfig>, control: Arc<ControlClient>, shutdown: CancellationToken, logger: Logger) {
  let (local_ip, local_port) = proxy.config.local_addr();
  let local_addr = format!("{local_ip}:{local_port}");

  loop {
    if shutdown.is_cancelled() {
      return;
    }
    let mut work_conn = match control.dial_work_conn(&proxy.name).await {
      Ok(conn) => conn,
      Err(err) => {
        logger.send(LogMessage::error(format!("udp proxy {}: failed to dial work connection: {err}", proxy.name))).await.ok();
        tokio::select! {
          _ = shutdown.cancelled() => return,
          _ = tokio::time::sleep(REDIAL_BACKOFF) => continue,
        }
      }
    };

    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
      Ok(socket) => socket,
      Err(err) => {
        logger.send(LogMessage::error(format!("udp proxy {}: failed to bind local relay socket: {err}", proxy.name))).await.ok();
        continue;
      }
    };

    // The server tags each datagram with the public client's address so a
    // reply can be routed back to the right sender. The local backend only
    // ever sees this one relay socket, so we remember whichever remote_addr
    // most recently sent something and stamp the backend's next reply with
    // it — good enough for request/response backends, lossy under truly
    // concurrent public senders.
    let mut last_remote = String::new();
    let mut buf = vec![0u8; UDP_MAX_PACKET];
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => return,
        from_server = revtun_common::frame::read_msg(&mut work_conn) => {
          match from_server {
            Ok(Message::UdpPacket(packet)) => {
              if let Ok(data) = base64::engine::general_purpose::STANDARD.decode(&packet.content) {
                last_remote = packet.remote_addr;
                socket.send_to(&data, &local_addr).await.ok();
              }
            }
            Ok(Message::Ping) | Ok(Message::Pong) => {}
            Ok(_) => {}
            Err(_) => break,
          }
        }
        received = socket.recv_from(&mut buf) => {
          let Ok((len, _from)) = received else { break };
          if last_remote.is_empty() {
            continue;
          }
          let packet = UdpPacket {
            remote_addr: last_remote.clone(),
            content: base64::engine::general_purpose::STANDARD.encode(&buf[..len]),
          };
          if revtun_common::frame::write_msg(&mut work_conn, &Message::UdpPacket(packet)).await.is_err() {
            break;
          }
        }
      }
    }
  }
}
