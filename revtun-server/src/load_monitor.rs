//! Composite server load score (§4.10), weighted the same way as the
//! original implementation: 25% current/peak connection ratio, 25%
//! current/peak traffic ratio, 20% CPU usage, 10% memory usage, 10% each
//! for the 5-minute connection and traffic growth rate, clamped to
//! `[0.0, 1.0]`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const WEIGHT_CONN_RATIO: f64 = 0.25;
const WEIGHT_TRAFFIC_RATIO: f64 = 0.25;
const WEIGHT_CPU: f64 = 0.20;
const WEIGHT_MEM: f64 = 0.10;
const WEIGHT_CONN_GROWTH: f64 = 0.10;
const WEIGHT_TRAFFIC_GROWTH: f64 = 0.10;

const HISTORY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const GROWTH_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct LoadSnapshot {
  pub load_score: f64,
  pub current_conns: u64,
  pub peak_conns: u64,
  pub current_traffic: u64,
  pub peak_traffic: u64,
  pub cpu_usage: f64,
  pub mem_usage: f64,
  pub conn_growth_rate: f64,
  pub traffic_growth_rate: f64,
}

/// Samples current connection/traffic counters against their own history
/// to derive a load score. Host CPU/memory usage is supplied by the
/// caller (`sysinfo`-style collection lives outside this module's
/// responsibility) rather than sampled here.
pub struct LoadMonitor {
  peak_conns: u64,
  peak_traffic: u64,
  conn_history: BTreeMap<Instant, u64>,
  traffic_history: BTreeMap<Instant, u64>,
}

impl Default for LoadMonitor {
  fn default() -> Self {
    Self::new()
  }
}

impl LoadMonitor {
  pub fn new() -> Self {
    Self {
      peak_conns: 0,
      peak_traffic: 0,
      conn_history: BTreeMap::new(),
      traffic_history: BTreeMap::new(),
    }
  }

  /// Drops history points older than the 24-hour retention window.
  pub fn cleanup_history(&mut self, now: Instant) {
    self.conn_history.retain(|t, _| now.duration_since(*t) <= HISTORY_WINDOW);
    self.traffic_history.retain(|t, _| now.duration_since(*t) <= HISTORY_WINDOW);
  }

  pub fn sample(&mut self, now: Instant, current_conns: u64, current_traffic: u64, cpu_usage: f64, mem_usage: f64) -> LoadSnapshot {
    self.conn_history.insert(now, current_conns);
    self.traffic_history.insert(now, current_traffic);
    self.peak_conns = self.peak_conns.max(current_conns);
    self.peak_traffic = self.peak_traffic.max(current_traffic);

    let conn_growth_rate = growth_rate(&self.conn_history, now, current_conns);
    let traffic_growth_rate = growth_rate(&self.traffic_history, now, current_traffic);

    let conn_ratio = ratio(current_conns, self.peak_conns);
    let traffic_ratio = ratio(current_traffic, self.peak_traffic);

    let load_score = (WEIGHT_CONN_RATIO * conn_ratio
      + WEIGHT_TRAFFIC_RATIO * traffic_ratio
      + WEIGHT_CPU * cpu_usage
      + WEIGHT_MEM * mem_usage
      + WEIGHT_CONN_GROWTH * conn_growth_rate
      + WEIGHT_TRAFFIC_GROWTH * traffic_growth_rate)
      .clamp(0.0, 1.0);

    LoadSnapshot {
      load_score,
      current_conns,
      peak_conns: self.peak_conns,
      current_traffic,
      peak_traffic: self.peak_traffic,
      cpu_usage,
      mem_usage,
      conn_growth_rate,
      traffic_growth_rate,
    }
  }
}

fn ratio(current: u64, peak: u64) -> f64 {
  if peak == 0 {
    0.0
  } else {
    current as f64 / peak as f64
  }
}

/// Finds the history point closest to (but not after) `now - GROWTH_WINDOW`
/// and returns `(current - previous) / previous`. With no data point that
/// old yet — the "no baseline" case the REDESIGN FLAGS call out — the rate
/// is reported as `0.0` rather than `current / 0`, matching the original's
/// `prevConns > 0` guard.
fn growth_rate(history: &BTreeMap<Instant, u64>, now: Instant, current: u64) -> f64 {
  let target = now.checked_sub(GROWTH_WINDOW).unwrap_or(now);
  let previous = history
    .range(..=now)
    .filter(|(t, _)| **t <= target)
    .next_back()
    .map(|(_, v)| *v);

  match previous {
    Some(prev) if prev > 0 => (current as f64 - prev as f64) / prev as f64,
    _ => 0.0,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn score_is_zero_with_no_history_and_zero_usage() {
    let mut monitor = LoadMonitor::new();
    let snap = monitor.sample(Instant::now(), 0, 0, 0.0, 0.0);
    assert_eq!(snap.load_score, 0.0);
  }

  #[test]
  fn score_clamps_to_one_under_extreme_load() {
    let mut monitor = LoadMonitor::new();
    let snap = monitor.sample(Instant::now(), 100, 100, 1.0, 1.0);
    assert!(snap.load_score <= 1.0);
    assert_eq!(snap.conn_growth_rate, 0.0);
  }

  #[test]
  fn ratio_tracks_peak_not_absolute_count() {
    let mut monitor = LoadMonitor::new();
    let t0 = Instant::now();
    monitor.sample(t0, 100, 0, 0.0, 0.0);
    let snap = monitor.sample(t0, 50, 0, 0.0, 0.0);
    assert!((snap.load_score - 0.25 * 0.5).abs() < 1e-9);
  }
}
