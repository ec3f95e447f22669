//! Typed configuration the (out-of-scope) CLI/file-parsing layer populates
//! before handing control to [`crate::run`], mirroring the role
//! [`revtun_server::config::ServerConfig`] plays on the other side of the
//! tunnel (§2.1).

use std::collections::HashMap;

use revtun_common::proxy::ProxyConfig;
use revtun_common::runid::RunId;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
  pub server_addr: String,
  pub server_port: u16,
  #[serde(default)]
  pub server_tls: bool,
  #[serde(default)]
  pub tls_ca_cert_path: Option<String>,
  /// Compared verbatim against the server's `privilege_key` (§6 Login) —
  /// this crate does not derive it as an HMAC of a separate token and
  /// timestamp; see DESIGN.md for why.
  pub token: String,
  #[serde(default)]
  pub run_id: Option<RunId>,
  #[serde(default = "default_pool_count")]
  pub pool_count: u32,
  #[serde(default = "default_user")]
  pub user: String,
  #[serde(default)]
  pub hostname: Option<String>,
  #[serde(default = "default_version")]
  pub version: String,
  #[serde(default)]
  pub metas: HashMap<String, String>,
  pub proxies: Vec<ProxyWrapperConfig>,
  #[serde(default)]
  pub inventory: Option<InventoryConfig>,
}

impl ClientConfig {
  pub fn os(&self) -> &'static str {
    std::env::consts::OS
  }

  pub fn arch(&self) -> &'static str {
    std::env::consts::ARCH
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyWrapperConfig {
  pub name: String,
  #[serde(flatten)]
  pub config: ProxyConfig,
  #[serde(default)]
  pub https_plugin: Option<HttpsPluginConfig>,
}

/// Configuration for the client-side HTTPS-to-HTTP termination plugin
/// (§4.9), attached to a `https`-typed [`ProxyWrapperConfig`]. The proxy's
/// own `local_ip`/`local_port` name the cleartext backend the plugin
/// forwards to after terminating TLS.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpsPluginConfig {
  /// Local port the plugin listens on for tunnelled TLS connections handed
  /// to it by the wrapper's forwarder.
  pub listen_port: u16,
  #[serde(default = "default_true")]
  pub auto_tls: bool,
  #[serde(default)]
  pub crt_base64: String,
  #[serde(default)]
  pub key_base64: String,
  #[serde(default)]
  pub cert_path: Option<String>,
  #[serde(default)]
  pub key_path: Option<String>,
  #[serde(default)]
  pub enable_http2: bool,
  #[serde(default)]
  pub extra_headers: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InventoryConfig {
  pub base_url: String,
  pub token: String,
}

fn default_pool_count() -> u32 {
  5
}

fn default_user() -> String {
  "revtunc".to_string()
}

fn default_version() -> String {
  env!("CARGO_PKG_VERSION").to_string()
}

fn default_true() -> bool {
  true
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn proxy_wrapper_config_deserializes_the_flattened_proxy_config() {
    let json = r#"{
      "name": "web",
      "type": "http",
      "local_ip": "127.0.0.1",
      "local_port": 8080,
      "custom_domains": ["example.com"]
    }"#;
    let wrapper: ProxyWrapperConfig = serde_json::from_str(json).unwrap();
    assert_eq!(wrapper.name, "web");
    assert_eq!(wrapper.config.proxy_type(), revtun_common::proxy::ProxyType::Http);
  }
}
