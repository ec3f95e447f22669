//! The `RunId → expiry` blacklist named in §3/§4.7/§4.11: an admin kick via
//! the dashboard API bans a `RunId` for 30 minutes, after which a fresh
//! login with that id is accepted again. Distinct from [`crate::blacklist`],
//! which bans IP addresses after repeated auth failures — that one is an
//! ambient anti-abuse addition, this one implements the spec's own
//! `Blacklist` data model verbatim.

use std::time::Duration;

use revtun_common::runid::RunId;
use revtun_common::ttl_cache::TtlCache;

pub const KICK_BAN_DURATION: Duration = Duration::from_secs(30 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct KickBlacklist {
  entries: TtlCache<RunId, ()>,
}

impl Default for KickBlacklist {
  fn default() -> Self {
    Self::new()
  }
}

impl KickBlacklist {
  pub fn new() -> Self {
    Self { entries: TtlCache::new(KICK_BAN_DURATION) }
  }

  /// Bans `run_id` for [`KICK_BAN_DURATION`] starting now.
  pub fn ban(&mut self, run_id: RunId) {
    self.entries.insert(run_id, ());
  }

  /// `true` iff an entry exists and `now < expiry`.
  pub fn is_banned(&self, run_id: &RunId) -> bool {
    self.entries.contains_live(run_id)
  }

  /// Drops expired entries; called every [`SWEEP_INTERVAL`].
  pub fn sweep(&mut self) -> usize {
    self.entries.cleanup()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn freshly_banned_id_is_blacklisted() {
    let mut bl = KickBlacklist::new();
    let id = RunId::generate();
    assert!(!bl.is_banned(&id));
    bl.ban(id.clone());
    assert!(bl.is_banned(&id));
  }

  #[test]
  fn sweep_only_removes_expired_entries() {
    let mut bl = KickBlacklist { entries: TtlCache::new(Duration::from_millis(10)) };
    let stale = RunId::generate();
    bl.ban(stale.clone());
    std::thread::sleep(Duration::from_millis(30));
    let fresh = RunId::generate();
    bl.ban(fresh.clone());
    let removed = bl.sweep();
    assert_eq!(removed, 1);
    assert!(!bl.is_banned(&stale));
    assert!(bl.is_banned(&fresh));
  }

  #[test]
  fn unrelated_id_is_not_banned() {
    let bl = KickBlacklist::new();
    assert!(!bl.is_banned(&RunId::generate()));
  }
}
