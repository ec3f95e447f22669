//! Typed configuration the (out-of-scope) CLI/file-parsing layer populates
//! before handing control to [`crate::run`]. Plain `serde`-deserializable
//! structs, the same role `ferron_common::config::ServerConfiguration`
//! plays for the teacher: something an adapter fills in, not something
//! this crate parses off disk itself.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
  pub bind_addr: IpAddr,
  pub bind_port: u16,
  #[serde(default)]
  pub kcp_bind_port: Option<u16>,
  #[serde(default)]
  pub quic_bind_port: Option<u16>,
  #[serde(default = "default_vhost_http_port")]
  pub vhost_http_port: u16,
  #[serde(default = "default_vhost_https_port")]
  pub vhost_https_port: u16,
  #[serde(default)]
  pub dashboard_port: Option<u16>,
  #[serde(default)]
  pub dashboard_user: Option<String>,
  #[serde(default)]
  pub dashboard_pwd: Option<String>,
  pub privilege_key: String,
  #[serde(default = "default_allow_ports")]
  pub allow_ports: Vec<PortRange>,
  #[serde(default = "default_max_pool_count")]
  pub max_pool_count_per_client: u32,
  #[serde(default = "default_heartbeat_timeout")]
  pub heartbeat_timeout: Duration,
  #[serde(default = "default_blacklist_ttl")]
  pub blacklist_ttl: Duration,
  #[serde(default = "default_subdomain_host")]
  pub subdomain_host: Option<String>,
  #[serde(default)]
  pub tcpmux_bind_port: Option<u16>,
  #[serde(default)]
  pub tls_cert_path: Option<String>,
  #[serde(default)]
  pub tls_key_path: Option<String>,
  #[serde(default)]
  pub tls_force: bool,
  #[serde(default)]
  pub detailed_errors_to_client: bool,
  #[serde(default)]
  pub load_webhook_url: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PortRange {
  pub start: u16,
  pub end: u16,
}

impl PortRange {
  pub fn contains(&self, port: u16) -> bool {
    (self.start..=self.end).contains(&port)
  }
}

fn default_vhost_http_port() -> u16 {
  80
}

fn default_vhost_https_port() -> u16 {
  443
}

fn default_allow_ports() -> Vec<PortRange> {
  vec![PortRange { start: 10000, end: 60000 }]
}

fn default_max_pool_count() -> u32 {
  5
}

fn default_heartbeat_timeout() -> Duration {
  Duration::from_secs(90)
}

fn default_blacklist_ttl() -> Duration {
  Duration::from_secs(300)
}

fn default_subdomain_host() -> Option<String> {
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn port_range_is_inclusive() {
    let range = PortRange { start: 100, end: 200 };
    assert!(range.contains(100));
    assert!(range.contains(200));
    assert!(!range.contains(99));
    assert!(!range.contains(201));
  }
}
