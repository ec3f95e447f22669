//! Shared error taxonomy for everything that isn't already its own typed
//! error (`FrameError` in [`crate::frame`]). Mirrors the split the teacher
//! draws between module-local `thiserror` enums at typed seams and
//! `anyhow::Error` once an error crosses into operational/logging code
//! (§7).

use thiserror::Error;

/// The six classes of failure the control plane and proxy engine need to
/// tell apart: each steers a different reaction (disconnect vs. reject vs.
/// retry vs. abort vs. surface upstream).
#[derive(Error, Debug)]
pub enum RevtunError {
  /// Malformed or out-of-protocol input on a wire connection. The
  /// connection that produced it is no longer trustworthy and must be
  /// closed.
  #[error("protocol violation: {0}")]
  Protocol(String),

  /// A login, work-connection, or visitor-connection handshake failed
  /// authentication.
  #[error("authentication failed: {0}")]
  Auth(String),

  /// The requested resource (bind port, proxy name, subdomain) is already
  /// held by another session.
  #[error("resource conflict: {0}")]
  ResourceConflict(String),

  /// Expected to clear on its own (a dial timeout, a momentarily full
  /// channel); the caller may retry without operator intervention.
  #[error("transient failure: {0}")]
  Transient(String),

  /// Unrecoverable within the current process (a listener failed to bind
  /// after exhausting retries, a required certificate is absent).
  #[error("fatal error: {0}")]
  Fatal(String),

  /// A dependency outside this process misbehaved (local backend refused
  /// the connection, upstream ACME endpoint errored).
  #[error("external service error: {0}")]
  ExternalService(String),
}

impl From<std::io::Error> for RevtunError {
  /// I/O failures on an already-established connection are treated as
  /// transient: the caller (a byte-splicing proxy loop) just ends that one
  /// connection, it does not indicate the proxy or controller is broken.
  fn from(err: std::io::Error) -> Self {
    RevtunError::Transient(err.to_string())
  }
}

impl RevtunError {
  /// Whether the caller should back off and retry rather than surface the
  /// error to the operator or close the enclosing session.
  pub fn is_retryable(&self) -> bool {
    matches!(self, RevtunError::Transient(_) | RevtunError::ExternalService(_))
  }

  /// Whether the connection/session this error occurred on must be torn
  /// down rather than merely logged.
  pub fn is_session_fatal(&self) -> bool {
    matches!(self, RevtunError::Protocol(_) | RevtunError::Auth(_) | RevtunError::Fatal(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn transient_and_external_are_retryable() {
    assert!(RevtunError::Transient("timeout".into()).is_retryable());
    assert!(RevtunError::ExternalService("backend down".into()).is_retryable());
    assert!(!RevtunError::Auth("bad key".into()).is_retryable());
  }

  #[test]
  fn protocol_auth_and_fatal_are_session_fatal() {
    assert!(RevtunError::Protocol("bad frame".into()).is_session_fatal());
    assert!(RevtunError::Auth("bad key".into()).is_session_fatal());
    assert!(RevtunError::Fatal("no cert".into()).is_session_fatal());
    assert!(!RevtunError::ResourceConflict("port taken".into()).is_session_fatal());
  }
}
