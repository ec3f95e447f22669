//! The proxy registry and its tagged-enum dispatch (§4.5, §4.6, §9
//! REDESIGN FLAGS). `NewProxy` requests are routed to one of the four
//! concrete handlers below by a plain `match` on [`ProxyConfig`] — no
//! reflection, no string-keyed factory lookup.

pub mod http;
pub mod httpreq;
pub mod https;
pub mod tcp_udp;
pub mod tcpmux;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use revtun_common::error::RevtunError;
use revtun_common::proxy::ProxyConfig;
use revtun_common::runid::RunId;
use revtun_common::traffic::TrafficRing;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::port_manager::PortManager;
use crate::vhost::VhostRouter;

/// How many times (and how often) a proxy handler polls the owning
/// controller's idle pool before giving up on a public connection it has
/// no work connection to pair with (§4.6).
pub(crate) const WORK_CONN_POLL_ATTEMPTS: u32 = 20;
pub(crate) const WORK_CONN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct RegisteredProxy {
  pub name: String,
  pub config: ProxyConfig,
  pub owner: RunId,
  pub remote_addr: String,
  pub shutdown: CancellationToken,
  pub started_at: SystemTime,
  traffic: StdMutex<TrafficRing>,
  cur_conns: AtomicU64,
}

impl RegisteredProxy {
  pub fn proxy_type(&self) -> &'static str {
    self.config.proxy_type().as_str()
  }

  /// Records bytes spliced by one work connection's `copy_bidirectional`
  /// pass into today's traffic bucket (§4.11 per-proxy traffic ring).
  pub fn record_traffic(&self, bytes_in: u64, bytes_out: u64) {
    self.traffic.lock().unwrap().record(SystemTime::now(), bytes_in, bytes_out);
  }

  pub fn traffic_window(&self, days: u32) -> (u64, u64) {
    self.traffic.lock().unwrap().window_total(SystemTime::now(), days)
  }

  pub fn conn_opened(&self) -> u64 {
    self.cur_conns.fetch_add(1, Ordering::SeqCst) + 1
  }

  pub fn conn_closed(&self) {
    self.cur_conns.fetch_sub(1, Ordering::SeqCst);
  }

  pub fn cur_conns(&self) -> u64 {
    self.cur_conns.load(Ordering::SeqCst)
  }
}

/// A snapshot taken at the moment a proxy is unregistered, kept around so
/// the dashboard can still report on it as `status=offline` until an
/// operator sweeps it with `DELETE /api/proxies?status=offline` (§4.11).
pub struct ClosedProxyRecord {
  pub name: String,
  pub proxy_type: &'static str,
  pub owner: RunId,
  pub closed_at: SystemTime,
  pub traffic_month: (u64, u64),
}

#[derive(Default)]
pub struct ProxyManager {
  proxies: RwLock<HashMap<String, Arc<RegisteredProxy>>>,
  closed: RwLock<Vec<ClosedProxyRecord>>,
}

impl ProxyManager {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `config` under `name` for `owner`, reserving whatever
  /// public resource (bind port or vhost pattern) the proxy type needs,
  /// and returns the remote address to report back in `NewProxyResp`.
  pub async fn register(
    &self,
    name: String,
    config: ProxyConfig,
    owner: RunId,
    bind_host: &str,
    port_manager: &mut PortManager,
    vhost_router: &mut VhostRouter,
  ) -> Result<Arc<RegisteredProxy>, RevtunError> {
    {
      let proxies = self.proxies.read().await;
      if let Some(existing) = proxies.get(&name) {
        if existing.owner != owner {
          return Err(RevtunError::ResourceConflict(format!("proxy name {name} is already in use")));
        }
      }
    }

    let remote_addr = match &config {
      ProxyConfig::Tcp(c) => {
        let port = port_manager.reserve(c.remote_port, &name)?;
        format!("{bind_host}:{port}")
      }
      ProxyConfig::Udp(c) => {
        let port = port_manager.reserve(c.remote_port, &name)?;
        format!("{bind_host}:{port}")
      }
      ProxyConfig::Http(_) | ProxyConfig::Https(_) | ProxyConfig::TcpMux(_) => {
        vhost_router.register(&name, config.custom_domains())?;
        config.custom_domains().join(", ")
      }
      ProxyConfig::Stcp(_) | ProxyConfig::Sudp(_) | ProxyConfig::Xtcp(_) => String::new(),
    };

    let registered = Arc::new(RegisteredProxy {
      name: name.clone(),
      config,
      owner,
      remote_addr,
      shutdown: CancellationToken::new(),
      started_at: SystemTime::now(),
      traffic: StdMutex::new(TrafficRing::new()),
      cur_conns: AtomicU64::new(0),
    });
    self.proxies.write().await.insert(name, registered.clone());
    Ok(registered)
  }

  pub async fn unregister(&self, name: &str, port_manager: &mut PortManager, vhost_router: &mut VhostRouter) {
    let removed = self.proxies.write().await.remove(name);
    if let Some(proxy) = removed {
      proxy.shutdown.cancel();
      match &proxy.config {
        ProxyConfig::Tcp(_) | ProxyConfig::Udp(_) => port_manager.release_all_for(name),
        ProxyConfig::Http(_) | ProxyConfig::Https(_) | ProxyConfig::TcpMux(_) => {
          vhost_router.unregister(proxy.config.custom_domains())
        }
        _ => {}
      }
      self.closed.write().await.push(ClosedProxyRecord {
        name: proxy.name.clone(),
        proxy_type: proxy.proxy_type(),
        owner: proxy.owner.clone(),
        closed_at: SystemTime::now(),
        traffic_month: proxy.traffic_window(30),
      });
    }
  }

  /// All currently-live proxies, for the dashboard's `status=online` view.
  pub async fn all(&self) -> Vec<Arc<RegisteredProxy>> {
    self.proxies.read().await.values().cloned().collect()
  }

  /// Snapshots of proxies torn down since the last sweep, for the
  /// dashboard's `status=offline` view.
  pub async fn closed(&self) -> tokio::sync::RwLockReadGuard<'_, Vec<ClosedProxyRecord>> {
    self.closed.read().await
  }

  /// Clears the `status=offline` history (`DELETE /api/proxies?status=offline`).
  pub async fn clear_closed(&self) -> usize {
    let mut closed = self.closed.write().await;
    let count = closed.len();
    closed.clear();
    count
  }

  pub async fn unregister_all_for(&self, owner: &RunId, port_manager: &mut PortManager, vhost_router: &mut VhostRouter) {
    let names: Vec<String> = {
      let proxies = self.proxies.read().await;
      proxies.values().filter(|p| &p.owner == owner).map(|p| p.name.clone()).collect()
    };
    for name in names {
      self.unregister(&name, port_manager, vhost_router).await;
    }
  }

  pub async fn get(&self, name: &str) -> Option<Arc<RegisteredProxy>> {
    self.proxies.read().await.get(name).cloned()
  }

  pub async fn len(&self) -> usize {
    self.proxies.read().await.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use revtun_common::proxy::{HttpConfig, TcpConfig};

  fn tcp_config(remote_port: u16) -> ProxyConfig {
    ProxyConfig::Tcp(TcpConfig {
      local_ip: "127.0.0.1".into(),
      local_port: 8080,
      remote_port,
    })
  }

  #[tokio::test]
  async fn registers_tcp_proxy_and_reports_remote_addr() {
    let manager = ProxyManager::new();
    let mut ports = PortManager::new(vec![crate::config::PortRange { start: 6000, end: 6010 }]);
    let mut vhosts = VhostRouter::new();
    let run_id = RunId::generate();
    let proxy = manager
      .register("web".into(), tcp_config(6000), run_id, "1.2.3.4", &mut ports, &mut vhosts)
      .await
      .unwrap();
    assert_eq!(proxy.remote_addr, "1.2.3.4:6000");
    assert_eq!(manager.len().await, 1);
  }

  #[tokio::test]
  async fn same_name_different_owner_is_rejected() {
    let manager = ProxyManager::new();
    let mut ports = PortManager::new(vec![crate::config::PortRange { start: 6000, end: 6010 }]);
    let mut vhosts = VhostRouter::new();
    manager
      .register("web".into(), tcp_config(6000), RunId::generate(), "1.2.3.4", &mut ports, &mut vhosts)
      .await
      .unwrap();
    let err = manager
      .register("web".into(), tcp_config(6001), RunId::generate(), "1.2.3.4", &mut ports, &mut vhosts)
      .await;
    assert!(err.is_err());
  }

  #[tokio::test]
  async fn unregister_releases_the_reserved_port() {
    let manager = ProxyManager::new();
    let mut ports = PortManager::new(vec![crate::config::PortRange { start: 6000, end: 6010 }]);
    let mut vhosts = VhostRouter::new();
    let run_id = RunId::generate();
    manager
      .register("web".into(), tcp_config(6000), run_id.clone(), "1.2.3.4", &mut ports, &mut vhosts)
      .await
      .unwrap();
    manager.unregister("web", &mut ports, &mut vhosts).await;
    assert_eq!(ports.reserve(6000, "other").unwrap(), 6000);
  }

  #[tokio::test]
  async fn unregister_snapshots_traffic_into_closed_history() {
    let manager = ProxyManager::new();
    let mut ports = PortManager::new(vec![crate::config::PortRange { start: 6000, end: 6010 }]);
    let mut vhosts = VhostRouter::new();
    let proxy = manager
      .register("web".into(), tcp_config(6000), RunId::generate(), "1.2.3.4", &mut ports, &mut vhosts)
      .await
      .unwrap();
    proxy.conn_opened();
    proxy.record_traffic(100, 200);
    assert_eq!(proxy.cur_conns(), 1);
    manager.unregister("web", &mut ports, &mut vhosts).await;
    let closed = manager.closed().await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].name, "web");
    assert_eq!(closed[0].traffic_month, (100, 200));
  }

  #[tokio::test]
  async fn http_proxy_registers_its_custom_domains() {
    let manager = ProxyManager::new();
    let mut ports = PortManager::new(vec![]);
    let mut vhosts = VhostRouter::new();
    let config = ProxyConfig::Http(HttpConfig {
      local_ip: "127.0.0.1".into(),
      local_port: 8080,
      custom_domains: vec!["blog.example.com".into()],
      subdomain: None,
      locations: vec![],
      host_header_rewrite: None,
    });
    manager
      .register("blog".into(), config, RunId::generate(), "1.2.3.4", &mut ports, &mut vhosts)
      .await
      .unwrap();
    assert_eq!(vhosts.route("blog.example.com"), Some("blog"));
  }
}
