//! A `HashMap` keyed cache where every entry expires after a fixed TTL,
//! generalized from the teacher's `ferron::util::ttl_cache::TtlCache` for
//! use by the blacklist (§4.7) to track transient bans without unbounded
//! growth.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct TtlCache<K, V> {
  ttl: Duration,
  entries: HashMap<K, (V, Instant)>,
}

impl<K: Eq + Hash, V> TtlCache<K, V> {
  pub fn new(ttl: Duration) -> Self {
    Self {
      ttl,
      entries: HashMap::new(),
    }
  }

  pub fn insert(&mut self, key: K, value: V) {
    self.entries.insert(key, (value, Instant::now()));
  }

  /// Returns the value for `key` if present and not yet expired. Does not
  /// itself evict; call [`Self::cleanup`] periodically to reclaim space.
  pub fn get(&self, key: &K) -> Option<&V> {
    self.entries.get(key).and_then(|(value, inserted_at)| {
      if inserted_at.elapsed() < self.ttl {
        Some(value)
      } else {
        None
      }
    })
  }

  pub fn contains_live(&self, key: &K) -> bool {
    self.get(key).is_some()
  }

  pub fn remove(&mut self, key: &K) -> Option<V> {
    self.entries.remove(key).map(|(value, _)| value)
  }

  /// Drops every entry whose TTL has elapsed. Returns the number removed.
  pub fn cleanup(&mut self) -> usize {
    let ttl = self.ttl;
    let before = self.entries.len();
    self.entries.retain(|_, (_, inserted_at)| inserted_at.elapsed() < ttl);
    before - self.entries.len()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread::sleep;

  #[test]
  fn entry_is_live_before_ttl_and_gone_after() {
    let mut cache = TtlCache::new(Duration::from_millis(20));
    cache.insert("a", 1);
    assert_eq!(cache.get(&"a"), Some(&1));
    sleep(Duration::from_millis(40));
    assert_eq!(cache.get(&"a"), None);
  }

  #[test]
  fn cleanup_evicts_only_expired_entries() {
    let mut cache = TtlCache::new(Duration::from_millis(20));
    cache.insert("expires", 1);
    sleep(Duration::from_millis(40));
    cache.insert("fresh", 2);
    let removed = cache.cleanup();
    assert_eq!(removed, 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get(&"fresh"), Some(&2));
  }

  #[test]
  fn remove_drops_regardless_of_ttl() {
    let mut cache = TtlCache::new(Duration::from_secs(60));
    cache.insert("a", 1);
    assert_eq!(cache.remove(&"a"), Some(1));
    assert!(cache.is_empty());
  }
}
