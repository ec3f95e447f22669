//! Proxy type/config taxonomy (§4.1, §4.6, §9 REDESIGN FLAGS).
//!
//! The original reflection-based "look up a constructor by type name"
//! factory is replaced here with a plain tagged enum: every proxy type the
//! wire protocol knows about is a variant, dispatch is an ordinary `match`,
//! and adding a type is a compile error everywhere it isn't handled instead
//! of a silent no-op at runtime.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
  Tcp,
  Udp,
  Http,
  Https,
  TcpMux,
  Stcp,
  Sudp,
  Xtcp,
}

impl ProxyType {
  /// Whether the server reserves a public `bind_port` for this type, as
  /// opposed to routing purely by name/SNI (`Http`/`Https`/`TcpMux`) or by
  /// rendezvous secret (`Stcp`/`Sudp`/`Xtcp`).
  pub fn reserves_bind_port(self) -> bool {
    matches!(self, ProxyType::Tcp | ProxyType::Udp)
  }

  pub fn is_vhost_routed(self) -> bool {
    matches!(self, ProxyType::Http | ProxyType::Https | ProxyType::TcpMux)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ProxyType::Tcp => "tcp",
      ProxyType::Udp => "udp",
      ProxyType::Http => "http",
      ProxyType::Https => "https",
      ProxyType::TcpMux => "tcpmux",
      ProxyType::Stcp => "stcp",
      ProxyType::Sudp => "sudp",
      ProxyType::Xtcp => "xtcp",
    }
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TcpConfig {
  pub local_ip: String,
  pub local_port: u16,
  pub remote_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UdpConfig {
  pub local_ip: String,
  pub local_port: u16,
  pub remote_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
  pub local_ip: String,
  pub local_port: u16,
  #[serde(default)]
  pub custom_domains: Vec<String>,
  pub subdomain: Option<String>,
  #[serde(default)]
  pub locations: Vec<String>,
  pub host_header_rewrite: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpsConfig {
  pub local_ip: String,
  pub local_port: u16,
  #[serde(default)]
  pub custom_domains: Vec<String>,
  pub subdomain: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TcpMuxConfig {
  pub local_ip: String,
  pub local_port: u16,
  #[serde(default)]
  pub custom_domains: Vec<String>,
  pub multiplexer: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StcpConfig {
  pub local_ip: String,
  pub local_port: u16,
  pub secret_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SudpConfig {
  pub local_ip: String,
  pub local_port: u16,
  pub secret_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct XtcpConfig {
  pub local_ip: String,
  pub local_port: u16,
  pub secret_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyConfig {
  Tcp(TcpConfig),
  Udp(UdpConfig),
  Http(HttpConfig),
  Https(HttpsConfig),
  TcpMux(TcpMuxConfig),
  Stcp(StcpConfig),
  Sudp(SudpConfig),
  Xtcp(XtcpConfig),
}

impl ProxyConfig {
  pub fn proxy_type(&self) -> ProxyType {
    match self {
      ProxyConfig::Tcp(_) => ProxyType::Tcp,
      ProxyConfig::Udp(_) => ProxyType::Udp,
      ProxyConfig::Http(_) => ProxyType::Http,
      ProxyConfig::Https(_) => ProxyType::Https,
      ProxyConfig::TcpMux(_) => ProxyType::TcpMux,
      ProxyConfig::Stcp(_) => ProxyType::Stcp,
      ProxyConfig::Sudp(_) => ProxyType::Sudp,
      ProxyConfig::Xtcp(_) => ProxyType::Xtcp,
    }
  }

  pub fn local_addr(&self) -> (&str, u16) {
    match self {
      ProxyConfig::Tcp(c) => (&c.local_ip, c.local_port),
      ProxyConfig::Udp(c) => (&c.local_ip, c.local_port),
      ProxyConfig::Http(c) => (&c.local_ip, c.local_port),
      ProxyConfig::Https(c) => (&c.local_ip, c.local_port),
      ProxyConfig::TcpMux(c) => (&c.local_ip, c.local_port),
      ProxyConfig::Stcp(c) => (&c.local_ip, c.local_port),
      ProxyConfig::Sudp(c) => (&c.local_ip, c.local_port),
      ProxyConfig::Xtcp(c) => (&c.local_ip, c.local_port),
    }
  }

  pub fn custom_domains(&self) -> &[String] {
    match self {
      ProxyConfig::Http(c) => &c.custom_domains,
      ProxyConfig::Https(c) => &c.custom_domains,
      ProxyConfig::TcpMux(c) => &c.custom_domains,
      _ => &[],
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tagged_json_round_trips_and_keeps_the_type_tag() {
    let cfg = ProxyConfig::Http(HttpConfig {
      local_ip: "127.0.0.1".into(),
      local_port: 8080,
      custom_domains: vec!["example.com".into()],
      subdomain: None,
      locations: vec![],
      host_header_rewrite: None,
    });
    let json = serde_json::to_string(&cfg).unwrap();
    assert!(json.contains("\"type\":\"http\""));
    let decoded: ProxyConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded.proxy_type(), ProxyType::Http);
  }

  #[test]
  fn only_tcp_and_udp_reserve_bind_ports() {
    assert!(ProxyType::Tcp.reserves_bind_port());
    assert!(ProxyType::Udp.reserves_bind_port());
    assert!(!ProxyType::Http.reserves_bind_port());
    assert!(!ProxyType::Stcp.reserves_bind_port());
  }
}
