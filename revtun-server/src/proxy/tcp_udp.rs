//! `tcp`/`udp` proxies: each gets its own bound public listener (§4.5).
//!
//! `tcp` pairs every accepted connection with a fresh work connection
//! pulled from the client's pool and splices the two together. `udp` has
//! no per-datagram "connection" to pair, so it claims a single work
//! connection for the proxy's lifetime and relays datagrams over it as
//! [`revtun_common::msg::UdpPacket`] frames, mirroring the client-side
//! forwarder's own framing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use revtun_common::error::RevtunError;
use revtun_common::frame::{read_msg, write_msg};
use revtun_common::logging::{LogMessage, Logger};
use revtun_common::msg::{Message, UdpPacket};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::sleep;

use crate::control::ControlManager;
use crate::listener::BoxedConn;
use crate::proxy::RegisteredProxy;

const UDP_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const UDP_MAX_PACKET: usize = 64 * 1024;

fn bind_tcp_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
  let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
  let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
  socket.set_reuse_address(true).ok();
  socket.bind(&addr.into())?;
  socket.listen(1024)?;
  Ok(socket.into())
}

pub(crate) async fn claim_work_conn(control: &ControlManager, registered: &RegisteredProxy) -> Option<BoxedConn> {
  for _ in 0..crate::proxy::WORK_CONN_POLL_ATTEMPTS {
    if let Some(controller) = control.get(&registered.owner).await {
      if let Some(conn) = controller.take_work_conn(&registered.name).await {
        return Some(conn);
      }
    }
    sleep(crate::proxy::WORK_CONN_POLL_INTERVAL).await;
  }
  None
}

pub async fn serve_tcp(registered: Arc<RegisteredProxy>, bind_addr: SocketAddr, control: Arc<ControlManager>, logger: Logger) -> Result<(), RevtunError> {
  let std_listener = bind_tcp_listener(bind_addr).map_err(|e| RevtunError::Fatal(format!("cannot bind tcp proxy {}: {e}", registered.name)))?;
  std_listener.set_nonblocking(true).ok();
  let listener = TcpListener::from_std(std_listener).map_err(|e| RevtunError::Fatal(e.to_string()))?;

  loop {
    tokio::select! {
      _ = registered.shutdown.cancelled() => return Ok(()),
      accepted = listener.accept() => {
        let (public_conn, peer) = match accepted {
          Ok(pair) => pair,
          Err(err) => {
            logger.send(LogMessage::error(format!("tcp proxy {}: accept failed: {err}", registered.name))).await.ok();
            continue;
          }
        };
        let registered = registered.clone();
        let control = control.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
          match claim_work_conn(&control, &registered).await {
            Some(work_conn) => {
              let mut public_conn = public_conn;
              let mut work_conn = work_conn;
              registered.conn_opened();
              match tokio::io::copy_bidirectional(&mut public_conn, &mut work_conn).await {
                Ok((bytes_in, bytes_out)) => registered.record_traffic(bytes_in, bytes_out),
                Err(err) => {
                  logger.send(LogMessage::info(format!("tcp proxy {} connection from {peer} ended: {err}", registered.name))).await.ok();
                }
              }
              registered.conn_closed();
            }
            None => {
              logger.send(LogMessage::error(format!("tcp proxy {}: no work connection available for {peer}", registered.name))).await.ok();
            }
          }
        });
      }
    }
  }
}

pub async fn serve_udp(registered: Arc<RegisteredProxy>, bind_addr: SocketAddr, control: Arc<ControlManager>, logger: Logger) -> Result<(), RevtunError> {
  let socket = Arc::new(
    UdpSocket::bind(bind_addr)
      .await
      .map_err(|e| RevtunError::Fatal(format!("cannot bind udp proxy {}: {e}", registered.name)))?,
  );

  let mut work_conn = match claim_work_conn(&control, &registered).await {
    Some(conn) => conn,
    None => return Err(RevtunError::Transient(format!("udp proxy {}: no client work connection available", registered.name))),
  };
  registered.conn_opened();

  let mut buf = vec![0u8; UDP_MAX_PACKET];
  let result = loop {
    tokio::select! {
      _ = registered.shutdown.cancelled() => break Ok(()),
      _ = sleep(UDP_HEARTBEAT_INTERVAL) => {
        if write_msg(&mut work_conn, &Message::Ping).await.is_err() {
          logger.send(LogMessage::error(format!("udp proxy {}: work connection heartbeat failed", registered.name))).await.ok();
          break Ok(());
        }
      }
      received = socket.recv_from(&mut buf) => {
        let (len, from) = match received {
          Ok(pair) => pair,
          Err(err) => {
            logger.send(LogMessage::error(format!("udp proxy {}: recv failed: {err}", registered.name))).await.ok();
            continue;
          }
        };
        registered.record_traffic(len as u64, 0);
        let packet = UdpPacket {
          remote_addr: from.to_string(),
          content: base64::engine::general_purpose::STANDARD.encode(&buf[..len]),
        };
        if write_msg(&mut work_conn, &Message::UdpPacket(packet)).await.is_err() {
          logger.send(LogMessage::error(format!("udp proxy {}: forwarding to client failed", registered.name))).await.ok();
          break Ok(());
        }
      }
      reply = read_msg(&mut work_conn) => {
        match reply {
          Ok(Message::UdpPacket(packet)) => {
            if let (Ok(addr), Ok(data)) = (packet.remote_addr.parse::<SocketAddr>(), base64::engine::general_purpose::STANDARD.decode(&packet.content)) {
              let sent = data.len() as u64;
              if socket.send_to(&data, addr).await.is_ok() {
                registered.record_traffic(0, sent);
              }
            }
          }
          Ok(Message::Pong) | Ok(Message::Ping) => {}
          Ok(_) => {
            logger.send(LogMessage::error(format!("udp proxy {}: unexpected message on work connection", registered.name))).await.ok();
          }
          Err(err) => {
            logger.send(LogMessage::error(format!("udp proxy {}: work connection closed: {err}", registered.name))).await.ok();
            break Ok(());
          }
        }
      }
    }
  };
  registered.conn_closed();
  result
}
