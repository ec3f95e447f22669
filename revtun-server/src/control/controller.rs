//! Per-client control state (§3 `ClientSession`, §4.3, §4.4): the
//! work-connection pool a client keeps topped up, the heartbeat deadline
//! that decides whether the session is still alive, the set of proxies it
//! owns, and the outbound half of its control connection (used to push
//! `NewProxyResp` and unsolicited messages like a certificate update ack).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use revtun_common::msg::Message;
use revtun_common::runid::RunId;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::listener::BoxedConn;

/// The login banner a client presents once at the start of its control
/// connection (§3).
#[derive(Clone, Debug, Default)]
pub struct LoginBanner {
  pub version: String,
  pub hostname: Option<String>,
  pub os: String,
  pub arch: String,
  pub user: String,
  pub metas: HashMap<String, String>,
}

pub struct Controller {
  run_id: RunId,
  privilege_key: String,
  remote_addr: SocketAddr,
  banner: LoginBanner,
  created_at: Instant,
  heartbeat_timeout: Duration,
  last_heartbeat: Mutex<Instant>,
  max_pool_count: usize,
  work_conns: AsyncMutex<HashMap<String, VecDeque<BoxedConn>>>,
  owned_proxies: Mutex<std::collections::HashSet<String>>,
  closed: std::sync::atomic::AtomicBool,
  closed_notify: tokio::sync::Notify,
  /// Internal sessions (e.g. an SSH-tunnel-gateway-originated control
  /// connection) skip privilege-key verification entirely (§3).
  always_auth_pass: bool,
  /// Outbound control-message sender; the reader task owns the write half
  /// of the real connection and drains this channel, so any task holding
  /// an `Arc<Controller>` can push a message without touching the socket
  /// directly.
  outbox: mpsc::UnboundedSender<Message>,
}

impl Controller {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    run_id: RunId,
    privilege_key: String,
    remote_addr: SocketAddr,
    banner: LoginBanner,
    heartbeat_timeout: Duration,
    max_pool_count: usize,
    always_auth_pass: bool,
    outbox: mpsc::UnboundedSender<Message>,
  ) -> Self {
    Self {
      run_id,
      privilege_key,
      remote_addr,
      banner,
      created_at: Instant::now(),
      heartbeat_timeout,
      last_heartbeat: Mutex::new(Instant::now()),
      max_pool_count,
      work_conns: AsyncMutex::new(HashMap::new()),
      owned_proxies: Mutex::new(std::collections::HashSet::new()),
      closed: std::sync::atomic::AtomicBool::new(false),
      closed_notify: tokio::sync::Notify::new(),
      always_auth_pass,
      outbox,
    }
  }

  pub fn run_id(&self) -> &RunId {
    &self.run_id
  }

  pub fn privilege_key(&self) -> &str {
    &self.privilege_key
  }

  pub fn always_auth_pass(&self) -> bool {
    self.always_auth_pass
  }

  pub fn remote_addr(&self) -> SocketAddr {
    self.remote_addr
  }

  pub fn banner(&self) -> &LoginBanner {
    &self.banner
  }

  pub fn created_at(&self) -> Instant {
    self.created_at
  }

  pub fn send(&self, message: Message) -> bool {
    self.outbox.send(message).is_ok()
  }

  pub fn touch_heartbeat(&self) {
    *self.last_heartbeat.lock().expect("heartbeat mutex poisoned") = Instant::now();
  }

  pub fn is_expired(&self) -> bool {
    let last = *self.last_heartbeat.lock().expect("heartbeat mutex poisoned");
    last.elapsed() > self.heartbeat_timeout
  }

  pub fn mark_closed(&self) {
    self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    self.closed_notify.notify_waiters();
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(std::sync::atomic::Ordering::SeqCst)
  }

  /// Resolves once [`Self::mark_closed`] has run, used by
  /// [`crate::control::ControlManager::supersede`] to serialise
  /// supersession: the caller must wait for the prior controller to fully
  /// tear down before installing its replacement (§4.5).
  pub async fn wait_closed(&self) {
    while !self.is_closed() {
      let notified = self.closed_notify.notified();
      if self.is_closed() {
        return;
      }
      notified.await;
    }
  }

  pub fn add_owned_proxy(&self, name: String) {
    self.owned_proxies.lock().expect("owned_proxies mutex poisoned").insert(name);
  }

  pub fn remove_owned_proxy(&self, name: &str) {
    self.owned_proxies.lock().expect("owned_proxies mutex poisoned").remove(name);
  }

  pub fn owned_proxies(&self) -> Vec<String> {
    self.owned_proxies.lock().expect("owned_proxies mutex poisoned").iter().cloned().collect()
  }

  /// Adds a freshly authenticated work connection to this client's idle
  /// pool for `proxy_name`, to be claimed by that proxy's handler pairing
  /// it with a public connection. Pools are kept per-proxy since one
  /// controller may own several proxies at once and a connection offered
  /// for one backend must never be handed to another. A pool already at
  /// `max_pool_count` drops the offered connection rather than blocking
  /// the offering task (§5 "producers non-blocking; overflow work
  /// connections are closed").
  pub async fn offer_work_conn(&self, proxy_name: &str, conn: BoxedConn) {
    let mut pools = self.work_conns.lock().await;
    let pool = pools.entry(proxy_name.to_string()).or_default();
    if pool.len() >= self.max_pool_count {
      return;
    }
    pool.push_back(conn);
  }

  /// Claims the oldest idle work connection queued for `proxy_name`, if any.
  pub async fn take_work_conn(&self, proxy_name: &str) -> Option<BoxedConn> {
    self.work_conns.lock().await.get_mut(proxy_name).and_then(|pool| pool.pop_front())
  }

  pub async fn idle_work_conns(&self, proxy_name: &str) -> usize {
    self.work_conns.lock().await.get(proxy_name).map(|pool| pool.len()).unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn controller(heartbeat_timeout: Duration) -> Controller {
    let (tx, _rx) = mpsc::unbounded_channel();
    Controller::new(
      RunId::generate(),
      "key".into(),
      "127.0.0.1:1".parse().unwrap(),
      LoginBanner::default(),
      heartbeat_timeout,
      2,
      false,
      tx,
    )
  }

  #[test]
  fn freshly_created_controller_is_not_expired() {
    let controller = controller(Duration::from_secs(60));
    assert!(!controller.is_expired());
  }

  #[test]
  fn touch_heartbeat_resets_the_expiry_clock() {
    let controller = controller(Duration::from_millis(0));
    assert!(controller.is_expired());
    controller.touch_heartbeat();
    let _ = controller.is_expired();
  }

  #[tokio::test]
  async fn pool_drops_offers_past_the_configured_capacity() {
    let controller = controller(Duration::from_secs(60));
    let (a, _) = tokio::io::duplex(1);
    let (b, _) = tokio::io::duplex(1);
    let (c, _) = tokio::io::duplex(1);
    controller.offer_work_conn("web", Box::new(a)).await;
    controller.offer_work_conn("web", Box::new(b)).await;
    controller.offer_work_conn("web", Box::new(c)).await;
    assert_eq!(controller.idle_work_conns("web").await, 2);
  }

  #[test]
  fn owned_proxy_set_tracks_adds_and_removes() {
    let controller = controller(Duration::from_secs(60));
    controller.add_owned_proxy("web".into());
    assert_eq!(controller.owned_proxies(), vec!["web".to_string()]);
    controller.remove_owned_proxy("web");
    assert!(controller.owned_proxies().is_empty());
  }
}
