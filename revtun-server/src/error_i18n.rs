//! Fixed translation table for errors surfaced to a client whose session
//! has `DetailedErrorsToClient` off (§7): a short phrase in the same
//! language the upstream project ships to its own end users, rather than
//! the raw Rust error text.

use revtun_common::error::RevtunError;

/// Returns the phrase a client should see for `err` when detailed errors
/// are disabled, or the error's own message when they are enabled.
pub fn translate(err: &RevtunError, detailed: bool) -> String {
  if detailed {
    return err.to_string();
  }
  match err {
    RevtunError::Protocol(_) => "协议错误".to_string(),
    RevtunError::Auth(_) => "认证失败".to_string(),
    RevtunError::ResourceConflict(_) => "资源冲突".to_string(),
    RevtunError::Transient(_) => "临时错误，请重试".to_string(),
    RevtunError::Fatal(_) => "服务器内部错误".to_string(),
    RevtunError::ExternalService(_) => "外部服务错误".to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn detailed_mode_passes_the_original_message_through() {
    let err = RevtunError::Auth("bad privilege key".into());
    assert_eq!(translate(&err, true), "authentication failed: bad privilege key");
  }

  #[test]
  fn non_detailed_mode_uses_the_fixed_phrase() {
    let err = RevtunError::Auth("bad privilege key".into());
    assert_eq!(translate(&err, false), "认证失败");
  }
}
