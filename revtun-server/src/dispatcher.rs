//! Dispatches every freshly accepted logical connection by the type of
//! the one framed message it opens with (§4.4), then — for `Login` —
//! keeps running as that control connection's per-client read loop
//! (§4.5).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use revtun_common::error::RevtunError;
use revtun_common::frame::{read_msg, write_msg};
use revtun_common::logging::LogMessage;
use revtun_common::msg::{Login, LoginResp, Message, NewProxy, NewProxyResp};
use revtun_common::runid::RunId;
use tokio::sync::mpsc;

use crate::control::{Controller, LoginBanner};
use crate::error_i18n::translate;
use crate::listener::BoxedConn;
use crate::proxy::tcp_udp::{serve_tcp, serve_udp};
use crate::state::ServerState;
use crate::visitor;

/// The window within which a freshly accepted connection must present its
/// first framed message (§4.4).
const FIRST_MESSAGE_DEADLINE: Duration = Duration::from_secs(10);
const HEARTBEAT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub async fn dispatch(conn: BoxedConn, peer_addr: SocketAddr, state: Arc<ServerState>) {
  if state.ip_blacklist.lock().await.is_banned(peer_addr.ip()) {
    return;
  }

  let mut conn = conn;
  let message = match tokio::time::timeout(FIRST_MESSAGE_DEADLINE, read_msg(&mut conn)).await {
    Ok(Ok(message)) => message,
    Ok(Err(err)) => {
      state.logger.send(LogMessage::info(format!("dispatcher: {peer_addr}: {err}"))).await.ok();
      return;
    }
    Err(_elapsed) => {
      state.logger.send(LogMessage::info(format!("dispatcher: {peer_addr}: no message within the first-message deadline"))).await.ok();
      return;
    }
  };

  match message {
    Message::Login(login) => handle_login(conn, peer_addr, login, state).await,
    Message::NewWorkConn(req) => handle_new_work_conn(conn, peer_addr, req, state).await,
    Message::NewVisitorConn(req) => handle_new_visitor_conn(conn, peer_addr, req, state).await,
    _ => {
      state.logger.send(LogMessage::info(format!("dispatcher: {peer_addr}: unexpected first message, closing"))).await.ok();
    }
  }
}

async fn handle_new_work_conn(conn: BoxedConn, peer_addr: SocketAddr, req: revtun_common::msg::NewWorkConn, state: Arc<ServerState>) {
  let Some(controller) = state.control.get(&req.run_id).await else {
    state.logger.send(LogMessage::info(format!("dispatcher: {peer_addr}: NewWorkConn for unknown run_id"))).await.ok();
    return;
  };
  if !controller.always_auth_pass() && controller.privilege_key() != req.privilege_key {
    state.logger.send(LogMessage::info(format!("dispatcher: {peer_addr}: NewWorkConn bad privilege key"))).await.ok();
    return;
  }
  controller.offer_work_conn(&req.proxy_name, conn).await;
}

async fn handle_new_visitor_conn(mut conn: BoxedConn, peer_addr: SocketAddr, req: revtun_common::msg::NewVisitorConn, state: Arc<ServerState>) {
  match visitor::resolve(&state.control, &state.proxies, &req).await {
    Ok(mut work_conn) => {
      if let Err(err) = tokio::io::copy_bidirectional(&mut conn, &mut work_conn).await {
        state.logger.send(LogMessage::info(format!("dispatcher: visitor connection from {peer_addr} ended: {err}"))).await.ok();
      }
    }
    Err(err) => {
      state.logger.send(LogMessage::info(format!("dispatcher: {peer_addr}: visitor connection rejected: {err}"))).await.ok();
    }
  }
}

async fn handle_login(mut conn: BoxedConn, peer_addr: SocketAddr, login: Login, state: Arc<ServerState>) {
  if let Some(requested) = &login.run_id {
    if state.kick_blacklist.lock().await.is_banned(requested) {
      reject_login(&mut conn, &state, RevtunError::Auth("run_id is blacklisted".into())).await;
      return;
    }
  }

  if !login.privilege_key.is_empty() && login.privilege_key != state.config.privilege_key {
    state.ip_blacklist.lock().await.record_failure(peer_addr.ip());
    reject_login(&mut conn, &state, RevtunError::Auth("bad privilege key".into())).await;
    return;
  }
  state.ip_blacklist.lock().await.record_success(peer_addr.ip());

  let run_id = login.run_id.clone().unwrap_or_else(RunId::generate);
  let banner = LoginBanner {
    version: login.version.clone(),
    hostname: login.hostname.clone(),
    os: login.os.clone(),
    arch: login.arch.clone(),
    user: login.user.clone(),
    metas: login.metas.clone(),
  };
  let max_pool = (login.pool_count as usize).min(state.config.max_pool_count_per_client as usize).max(1);

  let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
  let controller = Arc::new(Controller::new(
    run_id.clone(),
    state.config.privilege_key.clone(),
    peer_addr,
    banner,
    state.config.heartbeat_timeout,
    max_pool,
    false,
    outbox_tx,
  ));

  if let Some(previous) = state.control.insert(controller.clone()).await {
    previous.mark_closed();
  }

  let (mut read_half, mut write_half) = tokio::io::split(conn);

  let resp = LoginResp {
    version: login.version.clone(),
    run_id: run_id.clone(),
    server_udp_port: state.config.bind_port,
    error: String::new(),
  };
  if write_msg(&mut write_half, &Message::LoginResp(resp)).await.is_err() {
    state.control.remove_if_current(&run_id, &controller).await;
    return;
  }

  let writer_logger = state.logger.clone();
  tokio::spawn(async move {
    while let Some(msg) = outbox_rx.recv().await {
      if write_msg(&mut write_half, &msg).await.is_err() {
        break;
      }
    }
    writer_logger.send(LogMessage::info("control writer task ended".to_string())).await.ok();
  });

  state.logger.send(LogMessage::info(format!("control session established: run_id={run_id} peer={peer_addr}"))).await.ok();
  control_read_loop(&mut read_half, &controller, &state).await;

  state.control.remove_if_current(&run_id, &controller).await;
  let mut ports = state.ports.write().await;
  let mut vhosts = state.vhost.write().await;
  state.proxies.unregister_all_for(&run_id, &mut ports, &mut vhosts).await;
  drop(ports);
  drop(vhosts);
  controller.mark_closed();
  state.logger.send(LogMessage::info(format!("control session closed: run_id={run_id}"))).await.ok();
}

async fn reject_login(conn: &mut BoxedConn, state: &ServerState, err: RevtunError) {
  let resp = LoginResp {
    version: String::new(),
    run_id: RunId::generate(),
    server_udp_port: 0,
    error: translate(&err, state.config.detailed_errors_to_client),
  };
  write_msg(conn, &Message::LoginResp(resp)).await.ok();
}

async fn control_read_loop<R: tokio::io::AsyncRead + Unpin>(read_half: &mut R, controller: &Arc<Controller>, state: &Arc<ServerState>) {
  let mut heartbeat_check = tokio::time::interval(HEARTBEAT_POLL_INTERVAL);
  loop {
    tokio::select! {
      _ = state.shutdown.cancelled() => return,
      _ = heartbeat_check.tick() => {
        if controller.is_closed() {
          return;
        }
        if controller.is_expired() {
          state.logger.send(LogMessage::info(format!("control session {}: heartbeat timeout", controller.run_id()))).await.ok();
          return;
        }
      }
      message = read_msg(read_half) => {
        match message {
          Ok(Message::Ping) => {
            controller.touch_heartbeat();
            controller.send(Message::Pong);
          }
          Ok(Message::NewProxy(request)) => handle_new_proxy(request, controller, state).await,
          Ok(Message::CloseProxy(request)) => handle_close_proxy(&request.proxy_name, controller, state).await,
          Ok(_) => {
            state.logger.send(LogMessage::info(format!("control session {}: unexpected message, closing", controller.run_id()))).await.ok();
            return;
          }
          Err(err) => {
            state.logger.send(LogMessage::info(format!("control session {}: read ended: {err}", controller.run_id()))).await.ok();
            return;
          }
        }
      }
    }
    if controller.is_closed() {
      return;
    }
  }
}

async fn handle_new_proxy(request: NewProxy, controller: &Arc<Controller>, state: &Arc<ServerState>) {
  let proxy_name = request.proxy_name.clone();
  let bind_host = state.config.bind_addr.to_string();

  let result = {
    let mut ports = state.ports.write().await;
    let mut vhosts = state.vhost.write().await;
    state.proxies.register(proxy_name.clone(), request.config, controller.run_id().clone(), &bind_host, &mut ports, &mut vhosts).await
  };

  match result {
    Ok(registered) => {
      controller.add_owned_proxy(proxy_name.clone());
      spawn_dedicated_listener(registered.clone(), state.clone());
      controller.send(Message::NewProxyResp(NewProxyResp {
        proxy_name,
        remote_addr: registered.remote_addr.clone(),
        error: String::new(),
      }));
    }
    Err(err) => {
      controller.send(Message::NewProxyResp(NewProxyResp {
        proxy_name,
        remote_addr: String::new(),
        error: translate(&err, state.config.detailed_errors_to_client),
      }));
    }
  }
}

/// `tcp`/`udp` proxies own a dedicated listener per proxy; `http`/`https`/
/// `tcpmux` are routed through the single shared vhost listener already
/// running, and `stcp`/`sudp`/`xtcp` have no listener at all (§4.6).
fn spawn_dedicated_listener(registered: Arc<crate::proxy::RegisteredProxy>, state: Arc<ServerState>) {
  use revtun_common::proxy::ProxyConfig;
  let bind_ip = state.config.bind_addr;
  match &registered.config {
    ProxyConfig::Tcp(_) => {
      let Ok(port) = registered.remote_addr.rsplit(':').next().unwrap_or_default().parse::<u16>() else { return };
      let bind_addr = SocketAddr::new(bind_ip, port);
      let logger = state.logger.clone();
      let control = state.control.clone();
      tokio::spawn(async move {
        if let Err(err) = serve_tcp(registered.clone(), bind_addr, control, logger.clone()).await {
          logger.send(LogMessage::error(format!("tcp proxy {}: {err}", registered.name))).await.ok();
        }
      });
    }
    ProxyConfig::Udp(_) => {
      let Ok(port) = registered.remote_addr.rsplit(':').next().unwrap_or_default().parse::<u16>() else { return };
      let bind_addr = SocketAddr::new(bind_ip, port);
      let logger = state.logger.clone();
      let control = state.control.clone();
      tokio::spawn(async move {
        if let Err(err) = serve_udp(registered.clone(), bind_addr, control, logger.clone()).await {
          logger.send(LogMessage::error(format!("udp proxy {}: {err}", registered.name))).await.ok();
        }
      });
    }
    _ => {}
  }
}

async fn handle_close_proxy(proxy_name: &str, controller: &Arc<Controller>, state: &Arc<ServerState>) {
  let mut ports = state.ports.write().await;
  let mut vhosts = state.vhost.write().await;
  state.proxies.unregister(proxy_name, &mut ports, &mut vhosts).await;
  drop(ports);
  drop(vhosts);
  controller.remove_owned_proxy(proxy_name);
}

#[cfg(test)]
mod tests {
  use super::*;
  use revtun_common::logging::spawn_stdio_logger;

  fn config() -> crate::config::ServerConfig {
    crate::config::ServerConfig {
      bind_addr: "127.0.0.1".parse().unwrap(),
      bind_port: 7000,
      kcp_bind_port: None,
      quic_bind_port: None,
      vhost_http_port: 18080,
      vhost_https_port: 18443,
      dashboard_port: None,
      dashboard_user: None,
      dashboard_pwd: None,
      privilege_key: "secret".into(),
      allow_ports: vec![crate::config::PortRange { start: 16000, end: 16010 }],
      max_pool_count_per_client: 5,
      heartbeat_timeout: Duration::from_secs(90),
      blacklist_ttl: Duration::from_secs(300),
      subdomain_host: None,
      tcpmux_bind_port: None,
      tls_cert_path: None,
      tls_key_path: None,
      tls_force: false,
      detailed_errors_to_client: true,
      load_webhook_url: None,
    }
  }

  #[tokio::test]
  async fn login_with_wrong_privilege_key_is_rejected_and_no_controller_is_registered() {
    let state = ServerState::new(config(), spawn_stdio_logger());
    let (mut client, server) = tokio::io::duplex(4096);

    let login = Login {
      version: "1.0".into(),
      hostname: None,
      os: "linux".into(),
      arch: "x86_64".into(),
      user: "alice".into(),
      run_id: None,
      metas: Default::default(),
      privilege_key: "wrong".into(),
      timestamp: 0,
      pool_count: 2,
      client_specs: vec![],
    };
    write_msg(&mut client, &Message::Login(login)).await.unwrap();

    let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    dispatch(Box::new(server), peer, state.clone()).await;

    let resp = read_msg(&mut client).await.unwrap();
    match resp {
      Message::LoginResp(r) => assert!(!r.error.is_empty()),
      other => panic!("unexpected response: {other:?}"),
    }
    assert_eq!(state.control.len().await, 0);
  }

  #[tokio::test]
  async fn blacklisted_run_id_is_rejected_before_privilege_check() {
    let state = ServerState::new(config(), spawn_stdio_logger());
    let run_id = RunId::generate();
    state.kick_blacklist.lock().await.ban(run_id.clone());

    let (mut client, server) = tokio::io::duplex(4096);
    let login = Login {
      version: "1.0".into(),
      hostname: None,
      os: "linux".into(),
      arch: "x86_64".into(),
      user: "alice".into(),
      run_id: Some(run_id),
      metas: Default::default(),
      privilege_key: "secret".into(),
      timestamp: 0,
      pool_count: 2,
      client_specs: vec![],
    };
    write_msg(&mut client, &Message::Login(login)).await.unwrap();

    let peer: SocketAddr = "127.0.0.1:9001".parse().unwrap();
    dispatch(Box::new(server), peer, state.clone()).await;

    let resp = read_msg(&mut client).await.unwrap();
    match resp {
      Message::LoginResp(r) => assert!(r.error.to_lowercase().contains("blacklist")),
      other => panic!("unexpected response: {other:?}"),
    }
  }
}
