//! Visitor-key-authenticated direct tunnels (`stcp`/`sudp`/`xtcp`), named
//! in §4.6 as "out of core scope except as routes in the visitor manager":
//! a `NewVisitorConn` names a proxy by `proxy_name` and presents a
//! `sign_key`, which must equal the secret key that proxy registered with.
//! On a match the visitor connection is spliced directly to a work
//! connection claimed from the proxy's owning controller, the same pool
//! `tcp`/`http`/`https` proxies draw from (§3 WorkConnection).

use revtun_common::error::RevtunError;
use revtun_common::msg::NewVisitorConn;
use revtun_common::proxy::ProxyConfig;

use crate::control::ControlManager;
use crate::listener::BoxedConn;
use crate::proxy::tcp_udp::claim_work_conn;
use crate::proxy::ProxyManager;

fn secret_key(config: &ProxyConfig) -> Option<&str> {
  match config {
    ProxyConfig::Stcp(c) => Some(&c.secret_key),
    ProxyConfig::Sudp(c) => Some(&c.secret_key),
    ProxyConfig::Xtcp(c) => Some(&c.secret_key),
    _ => None,
  }
}

/// Resolves a `NewVisitorConn` request to a work connection pulled from
/// the addressed proxy's owner, or an error describing why it couldn't be
/// (unknown proxy, wrong type, bad `sign_key`, no idle work connection).
pub async fn resolve(control: &ControlManager, proxies: &ProxyManager, request: &NewVisitorConn) -> Result<BoxedConn, RevtunError> {
  let registered = proxies
    .get(&request.proxy_name)
    .await
    .ok_or_else(|| RevtunError::ResourceConflict(format!("no proxy named {}", request.proxy_name)))?;

  let Some(expected_key) = secret_key(&registered.config) else {
    return Err(RevtunError::Protocol(format!("proxy {} is not a visitor-routed type", request.proxy_name)));
  };

  if expected_key != request.sign_key {
    return Err(RevtunError::Auth(format!("bad sign_key for proxy {}", request.proxy_name)));
  }

  claim_work_conn(control, &registered)
    .await
    .ok_or_else(|| RevtunError::Transient(format!("proxy {}: no work connection available for visitor", request.proxy_name)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use revtun_common::proxy::StcpConfig;
  use revtun_common::runid::RunId;

  #[tokio::test]
  async fn unknown_proxy_name_is_a_resource_conflict() {
    let control = ControlManager::new();
    let proxies = ProxyManager::new();
    let request = NewVisitorConn {
      run_id: None,
      proxy_name: "missing".into(),
      sign_key: "k".into(),
      timestamp: 0,
    };
    let err = resolve(&control, &proxies, &request).await.unwrap_err();
    assert!(matches!(err, RevtunError::ResourceConflict(_)));
  }

  #[tokio::test]
  async fn wrong_sign_key_is_an_auth_error() {
    let control = ControlManager::new();
    let proxies = ProxyManager::new();
    let mut ports = crate::port_manager::PortManager::new(vec![]);
    let mut vhosts = crate::vhost::VhostRouter::new();
    let config = ProxyConfig::Stcp(StcpConfig {
      local_ip: "127.0.0.1".into(),
      local_port: 8080,
      secret_key: "correct".into(),
    });
    proxies
      .register("visit".into(), config, RunId::generate(), "1.2.3.4", &mut ports, &mut vhosts)
      .await
      .unwrap();

    let request = NewVisitorConn {
      run_id: None,
      proxy_name: "visit".into(),
      sign_key: "wrong".into(),
      timestamp: 0,
    };
    let err = resolve(&control, &proxies, &request).await.unwrap_err();
    assert!(matches!(err, RevtunError::Auth(_)));
  }
}
