//! Control-channel session table: one [`Controller`] per logged-in client,
//! keyed by the `RunId` handed out at login (§3, §4.3). Work connections a
//! client dials in proactively (its `pool_count` of spares) are queued
//! here until a proxy handler claims one to pair with a public connection.

mod controller;

pub use controller::{Controller, LoginBanner};

use std::collections::HashMap;
use std::sync::Arc;

use revtun_common::runid::RunId;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct ControlManager {
  controllers: RwLock<HashMap<RunId, Arc<Controller>>>,
}

impl ControlManager {
  pub fn new() -> Self {
    Self::default()
  }

  /// Installs `controller`, returning whatever controller previously held
  /// this `RunId`, if any. Per §4.5 the caller must `wait_closed()` on that
  /// returned controller before this call (it is not done here, so the old
  /// session's proxies stay registered for exactly as long as its teardown
  /// takes — a reconnecting client observes its old proxies disappear only
  /// once, not flicker).
  pub async fn insert(&self, controller: Arc<Controller>) -> Option<Arc<Controller>> {
    self.controllers.write().await.insert(controller.run_id().clone(), controller)
  }

  pub async fn get(&self, run_id: &RunId) -> Option<Arc<Controller>> {
    self.controllers.read().await.get(run_id).cloned()
  }

  /// Removes `run_id` only if the live entry is still `expected` — a
  /// controller's own teardown calls this with itself, so a successor that
  /// has already superseded it is never removed by the predecessor's
  /// delayed cleanup (§4.5).
  pub async fn remove_if_current(&self, run_id: &RunId, expected: &Arc<Controller>) {
    let mut controllers = self.controllers.write().await;
    if let Some(current) = controllers.get(run_id) {
      if Arc::ptr_eq(current, expected) {
        controllers.remove(run_id);
      }
    }
  }

  pub async fn len(&self) -> usize {
    self.controllers.read().await.len()
  }

  pub async fn all(&self) -> Vec<Arc<Controller>> {
    self.controllers.read().await.values().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::SocketAddr;
  use std::time::Duration;

  fn new_controller() -> Arc<Controller> {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    Arc::new(Controller::new(
      RunId::generate(),
      "key".into(),
      "127.0.0.1:1".parse::<SocketAddr>().unwrap(),
      LoginBanner::default(),
      Duration::from_secs(90),
      5,
      false,
      tx,
    ))
  }

  #[tokio::test]
  async fn insert_get_and_remove_round_trip() {
    let manager = ControlManager::new();
    let controller = new_controller();
    let run_id = controller.run_id().clone();
    assert!(manager.insert(controller.clone()).await.is_none());
    assert!(manager.get(&run_id).await.is_some());
    assert_eq!(manager.len().await, 1);
    manager.remove_if_current(&run_id, &controller).await;
    assert!(manager.get(&run_id).await.is_none());
  }

  #[tokio::test]
  async fn superseding_returns_the_prior_controller() {
    let manager = ControlManager::new();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let run_id = RunId::generate();
    let first = Arc::new(Controller::new(
      run_id.clone(),
      "key".into(),
      "127.0.0.1:1".parse().unwrap(),
      LoginBanner::default(),
      Duration::from_secs(90),
      5,
      false,
      tx,
    ));
    manager.insert(first.clone()).await;

    let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
    let second = Arc::new(Controller::new(
      run_id,
      "key".into(),
      "127.0.0.1:2".parse().unwrap(),
      LoginBanner::default(),
      Duration::from_secs(90),
      5,
      false,
      tx2,
    ));
    let previous = manager.insert(second.clone()).await;
    assert!(previous.is_some());
    assert!(Arc::ptr_eq(&previous.unwrap(), &first));
  }

  #[tokio::test]
  async fn a_superseded_predecessors_delayed_cleanup_does_not_remove_the_successor() {
    let manager = ControlManager::new();
    let run_id = RunId::generate();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let first = Arc::new(Controller::new(run_id.clone(), "key".into(), "127.0.0.1:1".parse().unwrap(), LoginBanner::default(), Duration::from_secs(90), 5, false, tx));
    let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
    let second = Arc::new(Controller::new(run_id.clone(), "key".into(), "127.0.0.1:2".parse().unwrap(), LoginBanner::default(), Duration::from_secs(90), 5, false, tx2));
    manager.insert(first.clone()).await;
    manager.insert(second.clone()).await;

    manager.remove_if_current(&run_id, &first).await;
    let still_live = manager.get(&run_id).await.unwrap();
    assert!(Arc::ptr_eq(&still_live, &second));
  }
}
