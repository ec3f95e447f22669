mod blacklist;
mod config;
mod control;
mod dashboard;
mod dispatcher;
mod error_i18n;
mod kick_blacklist;
mod listener;
mod load_monitor;
mod load_reporter;
mod port_manager;
mod proxy;
mod state;
mod tls_util;
mod vhost;
mod visitor;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use revtun_common::logging::{spawn_stdio_logger, LogMessage};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::listener::mux::MuxConfig;
use crate::listener::Accepted;
use crate::state::ServerState;

/// The reverse-tunnel server daemon: terminates client control connections
/// on a single bind port, shares that port with TLS and WebSocket framing
/// via the bind-port multiplexer, and exposes public traffic through
/// per-proxy-type listeners (§4).
#[derive(Parser, Debug)]
#[command(name = "revtund")]
#[command(version, about, long_about = None)]
struct Args {
  /// Path to the JSON server configuration file.
  #[arg(short, long)]
  config: PathBuf,
}

const ACCEPT_QUEUE_DEPTH: usize = 1024;
const IP_BLACKLIST_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
  let args = Args::parse();

  let config = match load_config(&args.config) {
    Ok(config) => config,
    Err(err) => {
      eprintln!("FATAL ERROR: {err}");
      std::process::exit(1);
    }
  };

  let logger = spawn_stdio_logger();

  // Install a process-wide cryptography provider; every TLS/QUIC/HTTPS-plugin
  // config builder below assumes one is already in place.
  if rustls::crypto::aws_lc_rs::default_provider().install_default().is_err() {
    logger.send(LogMessage::error("cannot install a process-wide cryptography provider".to_string())).await.ok();
    std::process::exit(1);
  }

  let state = ServerState::new(config, logger.clone());

  if let Err(err) = run(state.clone()).await {
    logger.send(LogMessage::error(format!("FATAL ERROR: {err}"))).await.ok();
    std::process::exit(1);
  }
}

fn load_config(path: &PathBuf) -> Result<ServerConfig, Box<dyn std::error::Error>> {
  let raw = std::fs::read_to_string(path)?;
  Ok(serde_json::from_str(&raw)?)
}

async fn run(state: Arc<ServerState>) -> Result<(), Box<dyn std::error::Error>> {
  let logger = state.logger.clone();
  let shutdown = state.shutdown.clone();

  let mux_config = build_mux_config(&state)?;
  let (accepted_tx, accepted_rx) = mpsc::channel::<Accepted>(ACCEPT_QUEUE_DEPTH);

  let bind_addr = SocketAddr::new(state.config.bind_addr, state.config.bind_port);
  spawn_listener("tcp bind-port", logger.clone(), {
    let tx = accepted_tx.clone();
    let shutdown = shutdown.clone();
    let logger = logger.clone();
    listener::tcp::run(bind_addr, mux_config, tx, shutdown, logger)
  });

  if let Some(kcp_port) = state.config.kcp_bind_port {
    let bind_addr = SocketAddr::new(state.config.bind_addr, kcp_port);
    spawn_listener("kcp bind-port", logger.clone(), {
      let tx = accepted_tx.clone();
      let shutdown = shutdown.clone();
      let logger = logger.clone();
      listener::kcp::run(bind_addr, tx, shutdown, logger)
    });
  }

  if let Some(quic_port) = state.config.quic_bind_port {
    match build_quic_server_config(&state) {
      Ok(Some(quic_config)) => {
        let bind_addr = SocketAddr::new(state.config.bind_addr, quic_port);
        spawn_listener("quic bind-port", logger.clone(), {
          let tx = accepted_tx.clone();
          let shutdown = shutdown.clone();
          let logger = logger.clone();
          listener::quic::run(bind_addr, quic_config, tx, shutdown, logger)
        });
      }
      Ok(None) => {
        logger
          .send(LogMessage::error("quic_bind_port is set but no tls_cert_path/tls_key_path configured; skipping QUIC listener".to_string()))
          .await
          .ok();
      }
      Err(err) => return Err(err.into()),
    }
  }
  drop(accepted_tx);

  tokio::spawn(dispatch_loop(accepted_rx, state.clone()));

  spawn_listener("http vhost", logger.clone(), {
    let bind_addr = SocketAddr::new(state.config.bind_addr, state.config.vhost_http_port);
    proxy::http::run(bind_addr, state.vhost.clone(), state.proxies.clone(), state.control.clone(), shutdown.clone(), logger.clone())
  });

  spawn_listener("https vhost", logger.clone(), {
    let bind_addr = SocketAddr::new(state.config.bind_addr, state.config.vhost_https_port);
    proxy::https::run(bind_addr, state.vhost.clone(), state.proxies.clone(), state.control.clone(), shutdown.clone(), logger.clone())
  });

  if let Some(tcpmux_port) = state.config.tcpmux_bind_port {
    let bind_addr = SocketAddr::new(state.config.bind_addr, tcpmux_port);
    spawn_listener("tcpmux connect", logger.clone(), {
      proxy::tcpmux::run(bind_addr, state.vhost.clone(), state.proxies.clone(), state.control.clone(), shutdown.clone(), logger.clone())
    });
  }

  if let Some(dashboard_port) = state.config.dashboard_port {
    let bind_addr = SocketAddr::new(state.config.bind_addr, dashboard_port);
    spawn_listener("dashboard", logger.clone(), dashboard::run(bind_addr, state.clone(), shutdown.clone(), logger.clone()));
  }

  tokio::spawn(kick_blacklist_sweep_loop(state.clone()));
  tokio::spawn(ip_blacklist_sweep_loop(state.clone()));
  tokio::spawn(load_reporter::run(state.clone(), shutdown.clone()));

  logger.send(LogMessage::info(format!("revtund listening on {bind_addr}"))).await.ok();

  tokio::signal::ctrl_c().await.ok();
  logger.send(LogMessage::info("shutdown signal received".to_string())).await.ok();
  shutdown.cancel();
  tokio::time::sleep(Duration::from_millis(200)).await;
  Ok(())
}

fn spawn_listener<F>(name: &'static str, logger: revtun_common::logging::Logger, fut: F)
where
  F: std::future::Future<Output = Result<(), revtun_common::error::RevtunError>> + Send + 'static,
{
  tokio::spawn(async move {
    if let Err(err) = fut.await {
      logger.send(LogMessage::error(format!("{name} listener exited: {err}"))).await.ok();
    }
  });
}

async fn dispatch_loop(mut rx: mpsc::Receiver<Accepted>, state: Arc<ServerState>) {
  while let Some(accepted) = rx.recv().await {
    let state = state.clone();
    tokio::spawn(async move {
      dispatcher::dispatch(accepted.conn, accepted.peer_addr, state).await;
    });
  }
}

async fn kick_blacklist_sweep_loop(state: Arc<ServerState>) {
  let mut ticker = tokio::time::interval(kick_blacklist::SWEEP_INTERVAL);
  loop {
    tokio::select! {
      _ = state.shutdown.cancelled() => return,
      _ = ticker.tick() => {
        state.kick_blacklist.lock().await.sweep();
      }
    }
  }
}

async fn ip_blacklist_sweep_loop(state: Arc<ServerState>) {
  let mut ticker = tokio::time::interval(IP_BLACKLIST_SWEEP_INTERVAL);
  loop {
    tokio::select! {
      _ = state.shutdown.cancelled() => return,
      _ = ticker.tick() => {
        state.ip_blacklist.lock().await.cleanup();
      }
    }
  }
}

fn build_mux_config(state: &ServerState) -> Result<MuxConfig, Box<dyn std::error::Error>> {
  let tls_acceptor = match (&state.config.tls_cert_path, &state.config.tls_key_path) {
    (Some(cert_path), Some(key_path)) => {
      let certs = tls_util::load_certs(cert_path)?;
      let key = tls_util::load_private_key(key_path)?;
      Some(listener::tls::build_acceptor(certs, key)?)
    }
    _ => None,
  };
  Ok(MuxConfig { tls_acceptor, tls_force: state.config.tls_force })
}

fn build_quic_server_config(state: &ServerState) -> Result<Option<quinn::ServerConfig>, Box<dyn std::error::Error>> {
  match (&state.config.tls_cert_path, &state.config.tls_key_path) {
    (Some(cert_path), Some(key_path)) => {
      let certs = tls_util::load_certs(cert_path)?;
      let key = tls_util::load_private_key(key_path)?;
      Ok(Some(listener::quic::build_server_config(certs, key)?))
    }
    _ => Ok(None),
  }
}
