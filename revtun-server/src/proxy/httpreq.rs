//! Minimal byte-level HTTP request-head helpers shared by the `http` vhost
//! listener and the `tcpmux` HTTP-CONNECT listener (§4.6). Neither needs a
//! real HTTP parser: both only ever look at the request line and the
//! `Host` header of the *first* request on a connection before falling
//! back to raw byte splicing.

use revtun_common::error::RevtunError;
use tokio::io::AsyncReadExt;

/// Reads bytes off `stream` until a full header block (`\r\n\r\n`) has been
/// seen or `max_len` is hit, returning exactly what was read — this is the
/// prefix that gets replayed ahead of the live connection once routing
/// decides where it goes.
pub async fn peek_request_head<S: tokio::io::AsyncRead + Unpin>(stream: &mut S, max_len: usize) -> Result<Vec<u8>, RevtunError> {
  let mut buf = Vec::with_capacity(1024.min(max_len));
  let mut chunk = [0u8; 1024];
  loop {
    if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= max_len {
      break;
    }
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
      break;
    }
    buf.extend_from_slice(&chunk[..n]);
  }
  Ok(buf)
}

/// Case-insensitive header lookup over a raw request-head byte buffer.
pub fn find_header(head: &[u8], name: &str) -> Option<String> {
  let text = String::from_utf8_lossy(head);
  let prefix = format!("{name}:");
  text.lines().find_map(|line| {
    if line.len() > prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(&prefix) {
      Some(line[prefix.len()..].trim().to_string())
    } else {
      None
    }
  })
}

/// Returns the request line's target (`GET <target> HTTP/1.1`), used to
/// pick the longest-matching `locations` path prefix for an `http` proxy.
pub fn request_target(head: &[u8]) -> Option<String> {
  let text = String::from_utf8_lossy(head);
  let line = text.lines().next()?;
  line.split_whitespace().nth(1).map(str::to_string)
}

/// Replaces the value of the (first) `Host` header with `new_host`,
/// leaving every other byte — including the body, if any was already
/// buffered in `head` — untouched.
pub fn rewrite_host_header(head: &[u8], new_host: &str) -> Vec<u8> {
  let text = String::from_utf8_lossy(head);
  let mut out = String::with_capacity(head.len());
  for line in split_keep_terminators(&text) {
    if line.len() > 5 && line[..5].eq_ignore_ascii_case("host:") {
      out.push_str("Host: ");
      out.push_str(new_host);
      out.push_str("\r\n");
    } else {
      out.push_str(line);
    }
  }
  out.into_bytes()
}

/// Splits `text` into lines that retain their trailing `\r\n` (or lack
/// thereof, for the final line), since naive `.lines()` eats the
/// terminators we need to reassemble exactly.
fn split_keep_terminators(text: &str) -> Vec<&str> {
  let mut out = Vec::new();
  let mut start = 0;
  let bytes = text.as_bytes();
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'\n' {
      out.push(&text[start..=i]);
      start = i + 1;
    }
    i += 1;
  }
  if start < bytes.len() {
    out.push(&text[start..]);
  }
  out
}

/// Parses `CONNECT host:port HTTP/1.1` into `(host, port)`, for the
/// `tcpmux` proxy type's HTTP-CONNECT sub-listener.
pub fn parse_connect_target(head: &[u8]) -> Option<(String, u16)> {
  let text = String::from_utf8_lossy(head);
  let line = text.lines().next()?;
  let mut parts = line.split_whitespace();
  if parts.next()? != "CONNECT" {
    return None;
  }
  let authority = parts.next()?;
  let (host, port) = authority.rsplit_once(':')?;
  Some((host.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn finds_host_header_case_insensitively() {
    let head = b"GET / HTTP/1.1\r\nHOST: example.com:8080\r\n\r\n";
    assert_eq!(find_header(head, "host"), Some("example.com:8080".to_string()));
  }

  #[test]
  fn missing_header_returns_none() {
    let head = b"GET / HTTP/1.1\r\n\r\n";
    assert_eq!(find_header(head, "host"), None);
  }

  #[test]
  fn rewrite_host_header_replaces_only_that_line() {
    let head = b"GET /x HTTP/1.1\r\nHost: old.example.com\r\nAccept: */*\r\n\r\n";
    let rewritten = rewrite_host_header(head, "new.example.com");
    let text = String::from_utf8(rewritten).unwrap();
    assert!(text.contains("Host: new.example.com\r\n"));
    assert!(text.contains("Accept: */*\r\n"));
    assert!(text.starts_with("GET /x HTTP/1.1\r\n"));
  }

  #[test]
  fn parses_connect_target() {
    let head = b"CONNECT api.example.com:443 HTTP/1.1\r\nHost: api.example.com:443\r\n\r\n";
    assert_eq!(parse_connect_target(head), Some(("api.example.com".to_string(), 443)));
  }

  #[test]
  fn request_target_is_the_path_component() {
    let head = b"GET /v1/status HTTP/1.1\r\nHost: x\r\n\r\n";
    assert_eq!(request_target(head), Some("/v1/status".to_string()));
  }
}
