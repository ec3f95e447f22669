//! IP-address blacklist with a failure-count threshold (§4.7). Built on
//! [`revtun_common::ttl_cache::TtlCache`], generalized from the teacher's
//! `TtlCache` use in rate limiting: each failed login/auth attempt bumps a
//! counter with its own TTL, and a caller crossing the threshold within
//! that window is rejected outright until the entry expires.

use std::net::IpAddr;
use std::time::Duration;

use revtun_common::ttl_cache::TtlCache;

pub struct Blacklist {
  failures: TtlCache<IpAddr, u32>,
  banned: TtlCache<IpAddr, ()>,
  threshold: u32,
  ban_ttl: Duration,
}

impl Blacklist {
  pub fn new(failure_window: Duration, ban_ttl: Duration, threshold: u32) -> Self {
    Self {
      failures: TtlCache::new(failure_window),
      banned: TtlCache::new(ban_ttl),
      threshold,
      ban_ttl,
    }
  }

  pub fn is_banned(&self, addr: IpAddr) -> bool {
    self.banned.contains_live(&addr)
  }

  /// Records an authentication failure from `addr`. Once the count reaches
  /// the configured threshold within the failure window, `addr` is banned
  /// for `ban_ttl`.
  pub fn record_failure(&mut self, addr: IpAddr) {
    let count = self.failures.get(&addr).copied().unwrap_or(0) + 1;
    self.failures.insert(addr, count);
    if count >= self.threshold {
      self.banned.insert(addr, ());
    }
  }

  pub fn record_success(&mut self, addr: IpAddr) {
    self.failures.remove(&addr);
  }

  pub fn cleanup(&mut self) {
    self.failures.cleanup();
    self.banned.cleanup();
  }

  pub fn ban_ttl(&self) -> Duration {
    self.ban_ttl
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn addr() -> IpAddr {
    "127.0.0.1".parse().unwrap()
  }

  #[test]
  fn bans_after_reaching_the_failure_threshold() {
    let mut bl = Blacklist::new(Duration::from_secs(60), Duration::from_secs(60), 3);
    assert!(!bl.is_banned(addr()));
    bl.record_failure(addr());
    bl.record_failure(addr());
    assert!(!bl.is_banned(addr()));
    bl.record_failure(addr());
    assert!(bl.is_banned(addr()));
  }

  #[test]
  fn success_clears_the_failure_counter() {
    let mut bl = Blacklist::new(Duration::from_secs(60), Duration::from_secs(60), 3);
    bl.record_failure(addr());
    bl.record_failure(addr());
    bl.record_success(addr());
    bl.record_failure(addr());
    assert!(!bl.is_banned(addr()));
  }
}
