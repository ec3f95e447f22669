mod config;
mod control;
mod forwarder;
mod health;
mod https_plugin;
mod inventory;
mod transport;
mod wrapper;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use revtun_common::logging::{spawn_stdio_logger, LogMessage};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::control::ControlClient;
use crate::wrapper::ProxyWrapper;

/// The reverse-tunnel client daemon: holds one control connection to the
/// server and one [`ProxyWrapper`] task per configured proxy (§4.8, §5).
#[derive(Parser, Debug)]
#[command(name = "revtunc")]
#[command(version, about, long_about = None)]
struct Args {
  /// Path to the JSON client configuration file.
  #[arg(short, long)]
  config: PathBuf,
}

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

  // Install a process-wide cryptography provider; the https_plugin's TLS
  // termination and the control channel's TLS dial both assume one is
  // already in place.
  if rustls::crypto::aws_lc_rs::default_provider().install_default().is_err() {
    logger.send(LogMessage::error("cannot install a process-wide cryptography provider".to_string())).await.ok();
    std::process::exit(1);
  }

  if let Err(err) = run(Arc::new(config), logger.clone()).await {
    logger.send(LogMessage::error(format!("FATAL ERROR: {err}"))).await.ok();
    std::process::exit(1);
  }
}

fn load_config(path: &PathBuf) -> Result<ClientConfig, Box<dyn std::error::Error>> {
  let raw = std::fs::read_to_string(path)?;
  Ok(serde_json::from_str(&raw)?)
}

async fn run(config: Arc<ClientConfig>, logger: revtun_common::logging::Logger) -> Result<(), Box<dyn std::error::Error>> {
  let shutdown = CancellationToken::new();
  let control = ControlClient::connect(config.clone(), logger.clone(), shutdown.clone()).await?;

  let mut wrapper_closes = Vec::new();
  let mut wrapper_tasks = Vec::new();
  for proxy in &config.proxies {
    let wrapper = ProxyWrapper::new(proxy.clone(), control.clone(), config.pool_count, logger.clone());
    wrapper_closes.push(wrapper.close_handle());
    wrapper_tasks.push(tokio::spawn(wrapper.run()));
  }

  logger.send(LogMessage::info(format!("revtunc connected to {}:{} with {} prox(y/ies)", config.server_addr, config.server_port, config.proxies.len()))).await.ok();

  tokio::signal::ctrl_c().await.ok();
  logger.send(LogMessage::info("shutdown signal received".to_string())).await.ok();
  for close in &wrapper_closes {
    close.cancel();
  }
  shutdown.cancel();
  for task in wrapper_tasks {
    task.await.ok();
  }
  Ok(())
}
