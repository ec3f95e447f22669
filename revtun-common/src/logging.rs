use async_channel::{Receiver, Sender};

/// A log message with its content and error status.
///
/// Mirrors the teacher's `project-karpacz-common::log::LogMessage`: a plain
/// value type handed over an `async_channel` so the hot path never blocks on
/// stdout/stderr.
#[derive(Clone, Debug)]
pub struct LogMessage {
  is_error: bool,
  message: String,
}

impl LogMessage {
  /// Creates a new info-level log message.
  pub fn info(message: impl Into<String>) -> Self {
    Self {
      is_error: false,
      message: message.into(),
    }
  }

  /// Creates a new error-level log message.
  pub fn error(message: impl Into<String>) -> Self {
    Self {
      is_error: true,
      message: message.into(),
    }
  }

  pub fn new(message: String, is_error: bool) -> Self {
    Self { is_error, message }
  }

  /// Consumes the message and returns its components.
  pub fn get_message(self) -> (String, bool) {
    (self.message, self.is_error)
  }

  pub fn is_error(&self) -> bool {
    self.is_error
  }

  pub fn message(&self) -> &str {
    &self.message
  }
}

/// A cheaply-cloneable handle used to emit log messages from anywhere in the
/// process without awaiting a lock.
pub type Logger = Sender<LogMessage>;

/// Spawns the log-draining task and returns the sender half handed out to the
/// rest of the process. Modeled on `ferron/src/server.rs`'s dedicated logging
/// runtime loop: log lines are printed as they arrive, with errors routed to
/// stderr and everything else to stdout.
pub fn spawn_stdio_logger() -> Logger {
  let (tx, rx) = async_channel::unbounded::<LogMessage>();
  tokio::spawn(drain_loop(rx));
  tx
}

async fn drain_loop(rx: Receiver<LogMessage>) {
  while let Ok(message) = rx.recv().await {
    let (message, is_error) = message.get_message();
    if is_error {
      eprintln!("[error] {message}");
    } else {
      println!("{message}");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_message_and_flag() {
    let msg = LogMessage::new("hello".to_string(), true);
    let (text, is_error) = msg.get_message();
    assert_eq!(text, "hello");
    assert!(is_error);
  }

  #[tokio::test]
  async fn logger_delivers_to_drain_task() {
    let logger = spawn_stdio_logger();
    logger.send(LogMessage::info("test message")).await.unwrap();
    // give the drain loop a tick to run; nothing to assert on stdout, but the
    // send must not fail.
    tokio::task::yield_now().await;
  }
}
