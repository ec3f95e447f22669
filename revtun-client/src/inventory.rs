//! Tunnel-inventory collaborator (§6, §9 "two CLI layers"): a thin typed
//! client for the newer `Tunnel`-struct `getAllTunnels(token)` API, chosen
//! over the ad-hoc `map[string]interface{}` variant per the redesign note.
//! Actually populating it from a live inventory service is an external HTTP
//! API hosted elsewhere and out of scope — `fetch()` exists only so
//! [`crate::config::ClientConfig`] and the wrapper can be written against a
//! stable type.

use revtun_common::error::RevtunError;
use revtun_common::proxy::ProxyConfig;
use serde::{Deserialize, Serialize};

use crate::config::InventoryConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tunnel {
  pub name: String,
  pub config: ProxyConfig,
}

pub struct InventoryClient {
  config: InventoryConfig,
}

impl InventoryClient {
  pub fn new(config: InventoryConfig) -> Self {
    Self { config }
  }

  pub async fn fetch(&self) -> Result<Vec<Tunnel>, RevtunError> {
    let _ = &self.config;
    Err(RevtunError::ExternalService("tunnel-inventory API is out of scope for this crate".into()))
  }
}
