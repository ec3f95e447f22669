//! Hostname routing tree: exact-match and `*.`-wildcard lookup keyed by
//! domain labels, generalized from the teacher's
//! `ferron::util::hostname_radix_tree::HostnameRadixTree` so the vhost
//! router can key on any payload type (a proxy name, a `RunId`, ...).
//!
//! Labels are indexed from the TLD inward (`"a.b.example.com"` walks
//! `com -> example -> b -> a`), so hosts sharing a suffix share a path
//! prefix in the tree. A `*` child at any node matches every hostname that
//! reaches that node and has at least one further label, and is tried only
//! after an exact-label child fails to consume the rest of the hostname —
//! exact matches always win over wildcard matches, regardless of depth.

use std::collections::BTreeMap;

const WILDCARD_LABEL: &str = "*";

#[derive(Debug)]
struct Node<T> {
  children: BTreeMap<String, Node<T>>,
  value: Option<T>,
}

impl<T> Default for Node<T> {
  fn default() -> Self {
    Self {
      children: BTreeMap::new(),
      value: None,
    }
  }
}

/// A generic exact/wildcard hostname router.
#[derive(Debug, Default)]
pub struct HostnameRadixTree<T> {
  root: Node<T>,
}

impl<T> HostnameRadixTree<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Inserts `value` under `pattern`, which is either a bare hostname
  /// (`"api.example.com"`) or a single leading wildcard label
  /// (`"*.example.com"`). Returns the previous value at that exact pattern,
  /// if any.
  pub fn insert(&mut self, pattern: &str, value: T) -> Option<T> {
    let labels = reversed_labels(pattern);
    let mut node = &mut self.root;
    for label in labels {
      node = node.children.entry(label).or_default();
    }
    node.value.replace(value)
  }

  pub fn remove(&mut self, pattern: &str) -> Option<T> {
    let labels: Vec<String> = reversed_labels(pattern).collect();
    remove_recursive(&mut self.root, &labels)
  }

  /// Looks up `hostname`, preferring the longest exact match and falling
  /// back to the nearest enclosing wildcard.
  pub fn lookup(&self, hostname: &str) -> Option<&T> {
    let labels: Vec<String> = reversed_labels(hostname).collect();
    lookup_recursive(&self.root, &labels)
  }

  pub fn is_empty(&self) -> bool {
    self.root.children.is_empty() && self.root.value.is_none()
  }
}

fn reversed_labels(hostname: &str) -> impl Iterator<Item = String> + '_ {
  hostname.split('.').rev().map(str::to_ascii_lowercase)
}

fn lookup_recursive<'a, T>(node: &'a Node<T>, remaining: &[String]) -> Option<&'a T> {
  if remaining.is_empty() {
    return node.value.as_ref();
  }

  if let Some(child) = node.children.get(&remaining[0]) {
    if let Some(found) = lookup_recursive(child, &remaining[1..]) {
      return Some(found);
    }
  }

  node
    .children
    .get(WILDCARD_LABEL)
    .and_then(|wildcard| wildcard.value.as_ref())
}

fn remove_recursive<T>(node: &mut Node<T>, remaining: &[String]) -> Option<T> {
  if remaining.is_empty() {
    return node.value.take();
  }
  let child = node.children.get_mut(&remaining[0])?;
  let removed = remove_recursive(child, &remaining[1..]);
  if child.children.is_empty() && child.value.is_none() {
    node.children.remove(&remaining[0]);
  }
  removed
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exact_match_wins_over_wildcard() {
    let mut tree = HostnameRadixTree::new();
    tree.insert("*.example.com", "wildcard");
    tree.insert("api.example.com", "exact");
    assert_eq!(tree.lookup("api.example.com"), Some(&"exact"));
    assert_eq!(tree.lookup("other.example.com"), Some(&"wildcard"));
  }

  #[test]
  fn wildcard_matches_nested_subdomains() {
    let mut tree = HostnameRadixTree::new();
    tree.insert("*.example.com", "wildcard");
    assert_eq!(tree.lookup("a.b.example.com"), Some(&"wildcard"));
  }

  #[test]
  fn lookup_is_case_insensitive() {
    let mut tree = HostnameRadixTree::new();
    tree.insert("API.Example.com", "exact");
    assert_eq!(tree.lookup("api.example.com"), Some(&"exact"));
  }

  #[test]
  fn unrelated_hostname_misses() {
    let mut tree = HostnameRadixTree::new();
    tree.insert("example.com", "value");
    assert_eq!(tree.lookup("other.org"), None);
  }

  #[test]
  fn remove_prunes_empty_branches() {
    let mut tree = HostnameRadixTree::new();
    tree.insert("api.example.com", "exact");
    assert_eq!(tree.remove("api.example.com"), Some("exact"));
    assert!(tree.is_empty());
    assert_eq!(tree.lookup("api.example.com"), None);
  }
}
