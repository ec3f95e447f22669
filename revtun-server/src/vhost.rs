//! Name-based routing for `http`/`https`/`tcpmux` proxies (§4.5, §4.6):
//! maps an inbound `Host`/SNI value to the proxy currently registered for
//! it. Built on [`revtun_common::radix::HostnameRadixTree`].

use revtun_common::radix::HostnameRadixTree;
use revtun_common::error::RevtunError;

#[derive(Clone, Debug)]
pub struct VhostTarget {
  pub proxy_name: String,
}

#[derive(Default)]
pub struct VhostRouter {
  tree: HostnameRadixTree<VhostTarget>,
}

impl VhostRouter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers every custom domain and subdomain pattern a proxy asked
  /// for. Fails with a `ResourceConflict` if any one of them is already
  /// claimed by a different proxy — this must be checked atomically
  /// against all requested patterns before any of them are inserted, so a
  /// partially-conflicting `NewProxy` never leaves half its domains
  /// registered.
  pub fn register(&mut self, proxy_name: &str, patterns: &[String]) -> Result<(), RevtunError> {
    for pattern in patterns {
      if let Some(existing) = self.tree.lookup(pattern) {
        if existing.proxy_name != proxy_name {
          return Err(RevtunError::ResourceConflict(format!(
            "hostname {pattern} is already routed to proxy {}",
            existing.proxy_name
          )));
        }
      }
    }
    for pattern in patterns {
      self.tree.insert(
        pattern,
        VhostTarget {
          proxy_name: proxy_name.to_string(),
        },
      );
    }
    Ok(())
  }

  pub fn unregister(&mut self, patterns: &[String]) {
    for pattern in patterns {
      self.tree.remove(pattern);
    }
  }

  pub fn route(&self, host: &str) -> Option<&str> {
    self.tree.lookup(host).map(|target| target.proxy_name.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn routes_a_registered_custom_domain() {
    let mut router = VhostRouter::new();
    router.register("blog", &["blog.example.com".to_string()]).unwrap();
    assert_eq!(router.route("blog.example.com"), Some("blog"));
  }

  #[test]
  fn rejects_conflicting_registration_and_leaves_nothing_partially_registered() {
    let mut router = VhostRouter::new();
    router.register("blog", &["blog.example.com".to_string()]).unwrap();
    let err = router.register("other", &["api.example.com".to_string(), "blog.example.com".to_string()]);
    assert!(err.is_err());
    assert_eq!(router.route("api.example.com"), None);
  }

  #[test]
  fn unregister_removes_all_listed_patterns() {
    let mut router = VhostRouter::new();
    router.register("blog", &["blog.example.com".to_string()]).unwrap();
    router.unregister(&["blog.example.com".to_string()]);
    assert_eq!(router.route("blog.example.com"), None);
  }
}
