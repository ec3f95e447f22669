//! Per-proxy health-monitor task (§5 "one health-monitor task per proxy",
//! §4.8). Ticks every 3 s, tries a quick TCP dial to the proxy's local
//! backend, and publishes the result to the wrapper: a shared flag it can
//! read any time, plus a non-blocking notify so the wrapper's own tick loop
//! wakes up immediately on a change instead of waiting out its own 3 s tick.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyWrapperConfig;

const TICK: Duration = Duration::from_secs(3);
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn run(proxy: Arc<ProxyWrapperConfig>, health: Arc<AtomicBool>, notify: mpsc::Sender<()>, shutdown: CancellationToken) {
  let (local_ip, local_port) = proxy.config.local_addr();
  let addr = format!("{local_ip}:{local_port}");
  let mut ticker = tokio::time::interval(TICK);

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => return,
      _ = ticker.tick() => {}
    }

    let reachable = probe(&addr).await;
    let was_healthy = health.swap(reachable, Ordering::SeqCst);
    if was_healthy != reachable {
      notify.try_send(()).ok();
    }
  }
}

async fn probe(addr: &str) -> bool {
  let Ok(resolved) = tokio::net::lookup_host(addr).await else { return false };
  let addrs: Vec<SocketAddr> = resolved.collect();
  for candidate in addrs {
    if timeout(DIAL_TIMEOUT, TcpStream::connect(candidate)).await.is_ok_and(|r| r.is_ok()) {
      return true;
    }
  }
  false
}
