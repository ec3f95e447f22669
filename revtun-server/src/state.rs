//! Aggregates every shared registry the dispatcher, proxy listeners, and
//! dashboard all need a handle to, so `main.rs` builds exactly one of
//! these and clones the `Arc` into each spawned task (§4.3-4.11).

use std::sync::Arc;

use revtun_common::logging::Logger;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::blacklist::Blacklist;
use crate::config::ServerConfig;
use crate::control::ControlManager;
use crate::kick_blacklist::KickBlacklist;
use crate::load_monitor::LoadMonitor;
use crate::port_manager::PortManager;
use crate::proxy::ProxyManager;
use crate::vhost::VhostRouter;

pub struct ServerState {
  pub config: ServerConfig,
  pub control: Arc<ControlManager>,
  pub proxies: Arc<ProxyManager>,
  pub ports: RwLock<PortManager>,
  pub vhost: Arc<RwLock<VhostRouter>>,
  pub ip_blacklist: Mutex<Blacklist>,
  pub kick_blacklist: Mutex<KickBlacklist>,
  pub load_monitor: Mutex<LoadMonitor>,
  pub logger: Logger,
  pub shutdown: CancellationToken,
}

impl ServerState {
  pub fn new(config: ServerConfig, logger: Logger) -> Arc<Self> {
    let ports = PortManager::new(config.allow_ports.clone());
    let ip_ban_ttl = config.blacklist_ttl;
    Arc::new(Self {
      config,
      control: Arc::new(ControlManager::new()),
      proxies: Arc::new(ProxyManager::new()),
      ports: RwLock::new(ports),
      vhost: Arc::new(RwLock::new(VhostRouter::new())),
      ip_blacklist: Mutex::new(Blacklist::new(ip_ban_ttl, ip_ban_ttl, 5)),
      kick_blacklist: Mutex::new(KickBlacklist::new()),
      load_monitor: Mutex::new(LoadMonitor::new()),
      logger,
      shutdown: CancellationToken::new(),
    })
  }
}
