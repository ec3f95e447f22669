//! The identifier a server hands a client at login and the client presents
//! on every subsequent work connection and heartbeat (§3, §4.3).

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// 8 random bytes, hex-encoded to the 16-hex-character identifier named in
/// §3. Opaque to everything except the control manager's session table:
/// nothing about a `RunId` encodes the tunnel's config or client identity,
/// so leaking one in a log line is harmless on its own (it still requires
/// the matching privilege key to act on).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
  pub fn generate() -> Self {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    Self(hex::encode(bytes))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RunId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl fmt::Debug for RunId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "RunId({})", self.0)
  }
}

impl From<String> for RunId {
  fn from(value: String) -> Self {
    Self(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generated_ids_are_distinct_and_16_hex_chars() {
    let a = RunId::generate();
    let b = RunId::generate();
    assert_ne!(a, b);
    assert_eq!(a.as_str().len(), 16);
    assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
  }
}
