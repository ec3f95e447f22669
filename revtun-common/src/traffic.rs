//! The concrete ring buffer backing `TrafficBuckets` (§3): one slot per
//! day, 30 slots deep, overwritten a year at a time. Sized for the widest
//! trend window the dashboard reports (`month` = 30 days); the shorter
//! windows (`day`, `3days`, `week`, `14days`) just sum a prefix of it.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const RING_LEN: usize = 30;

#[derive(Clone, Copy, Debug, Default)]
struct Bucket {
  day: u64,
  bytes_in: u64,
  bytes_out: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct TrafficRing {
  buckets: [Bucket; RING_LEN],
}

impl Default for TrafficRing {
  fn default() -> Self {
    Self::new()
  }
}

fn day_index(now: SystemTime) -> u64 {
  now.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs() / 86_400
}

impl TrafficRing {
  pub fn new() -> Self {
    Self { buckets: [Bucket::default(); RING_LEN] }
  }

  /// Adds `bytes_in`/`bytes_out` to today's bucket, first resetting it if
  /// the slot still holds a stale day from a prior month (the ring wraps
  /// every 30 days).
  pub fn record(&mut self, now: SystemTime, bytes_in: u64, bytes_out: u64) {
    let day = day_index(now);
    let slot = (day % RING_LEN as u64) as usize;
    if self.buckets[slot].day != day {
      self.buckets[slot] = Bucket { day, bytes_in: 0, bytes_out: 0 };
    }
    self.buckets[slot].bytes_in += bytes_in;
    self.buckets[slot].bytes_out += bytes_out;
  }

  /// Sums the `days` most recent days, `today` included. A slot whose
  /// stored day doesn't match the day it would need to hold to be inside
  /// the window is stale (either never written, or overwritten a month
  /// ago) and contributes zero rather than a wrapped-around count.
  pub fn window_total(&self, now: SystemTime, days: u32) -> (u64, u64) {
    let today = day_index(now);
    let mut total_in = 0u64;
    let mut total_out = 0u64;
    for offset in 0..days as u64 {
      let Some(day) = today.checked_sub(offset) else { break };
      let slot = (day % RING_LEN as u64) as usize;
      if self.buckets[slot].day == day {
        total_in += self.buckets[slot].bytes_in;
        total_out += self.buckets[slot].bytes_out;
      }
    }
    (total_in, total_out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn records_accumulate_within_the_same_day() {
    let mut ring = TrafficRing::new();
    let now = SystemTime::now();
    ring.record(now, 100, 50);
    ring.record(now, 10, 5);
    assert_eq!(ring.window_total(now, 1), (110, 55));
  }

  #[test]
  fn a_stale_slot_from_a_prior_month_does_not_leak_into_the_window() {
    let mut ring = TrafficRing::new();
    let epoch_day = SystemTime::UNIX_EPOCH;
    ring.record(epoch_day, 999, 999);
    let thirty_days_later = epoch_day + Duration::from_secs(30 * 86_400);
    assert_eq!(ring.window_total(thirty_days_later, 1), (0, 0));
  }

  #[test]
  fn month_window_includes_a_record_from_a_week_ago() {
    let mut ring = TrafficRing::new();
    let now = SystemTime::now();
    let week_ago = now - Duration::from_secs(7 * 86_400);
    ring.record(week_ago, 200, 100);
    let (total_in, total_out) = ring.window_total(now, 30);
    assert_eq!(total_in, 200);
    assert_eq!(total_out, 100);
    assert_eq!(ring.window_total(now, 3), (0, 0));
  }
}
