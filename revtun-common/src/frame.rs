//! L0 frame codec: `{u8 type, u64 length (big-endian), bytes payload}` over
//! any bidirectional byte pipe, with a self-describing JSON payload per §4.1.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::msg::Message;

/// Payloads larger than this are rejected outright, per §4.1.
pub const MAX_FRAME_LEN: u64 = 10 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
  #[error("short read: connection closed before a full frame header was received")]
  ShortRead,
  #[error("unknown message type byte: {0}")]
  UnknownType(u8),
  #[error("frame payload too large: {0} bytes (max {MAX_FRAME_LEN})")]
  TooLarge(u64),
  #[error("malformed payload for type {type_byte}: {source}")]
  Malformed {
    type_byte: u8,
    #[source]
    source: serde_json::Error,
  },
  #[error("I/O error while reading or writing a frame")]
  Io(#[from] std::io::Error),
}

/// Reads one framed message from `reader`.
///
/// EOF (or any short read) before the 9-byte header is fully consumed is
/// reported as [`FrameError::ShortRead`], matching the `ErrShortRead`
/// contract in §4.1.
pub async fn read_msg<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, FrameError> {
  let type_byte = match reader.read_u8().await {
    Ok(b) => b,
    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::ShortRead),
    Err(e) => return Err(e.into()),
  };

  let length = match reader.read_u64().await {
    Ok(n) => n,
    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::ShortRead),
    Err(e) => return Err(e.into()),
  };

  if length > MAX_FRAME_LEN {
    return Err(FrameError::TooLarge(length));
  }

  let mut payload = vec![0u8; length as usize];
  reader
    .read_exact(&mut payload)
    .await
    .map_err(|e| if e.kind() == std::io::ErrorKind::UnexpectedEof {
      FrameError::ShortRead
    } else {
      FrameError::Io(e)
    })?;

  Message::decode(type_byte, &payload)
}

/// Writes `message` as one framed message to `writer`.
pub async fn write_msg<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<(), FrameError> {
  let (type_byte, payload) = message.encode()?;
  if payload.len() as u64 > MAX_FRAME_LEN {
    return Err(FrameError::TooLarge(payload.len() as u64));
  }
  writer.write_u8(type_byte).await?;
  writer.write_u64(payload.len() as u64).await?;
  writer.write_all(&payload).await?;
  writer.flush().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::msg::Message;
  use std::io::Cursor;

  #[tokio::test]
  async fn round_trip_ping() {
    let msg = Message::Ping;
    let mut buf = Vec::new();
    write_msg(&mut buf, &msg).await.unwrap();
    let mut cursor = Cursor::new(buf);
    let decoded = read_msg(&mut cursor).await.unwrap();
    assert!(matches!(decoded, Message::Ping));
  }

  #[tokio::test]
  async fn round_trip_login() {
    let msg = Message::Login(crate::msg::Login {
      version: "1.0".into(),
      hostname: Some("host".into()),
      os: "linux".into(),
      arch: "x86_64".into(),
      user: "alice".into(),
      run_id: None,
      metas: Default::default(),
      privilege_key: "abc".into(),
      timestamp: 1234,
      pool_count: 5,
      client_specs: Default::default(),
    });
    let mut buf = Vec::new();
    write_msg(&mut buf, &msg).await.unwrap();
    let mut cursor = Cursor::new(buf);
    let decoded = read_msg(&mut cursor).await.unwrap();
    match decoded {
      Message::Login(login) => {
        assert_eq!(login.user, "alice");
        assert_eq!(login.pool_count, 5);
      }
      other => panic!("unexpected message: {other:?}"),
    }
  }

  #[tokio::test]
  async fn short_read_before_header() {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let err = read_msg(&mut cursor).await.unwrap_err();
    assert!(matches!(err, FrameError::ShortRead));
  }

  #[tokio::test]
  async fn unknown_type_byte() {
    let mut buf = Vec::new();
    buf.push(0xFFu8);
    buf.extend_from_slice(&0u64.to_be_bytes());
    let mut cursor = Cursor::new(buf);
    let err = read_msg(&mut cursor).await.unwrap_err();
    assert!(matches!(err, FrameError::UnknownType(0xFF)));
  }

  #[tokio::test]
  async fn oversized_length_rejected() {
    let mut buf = Vec::new();
    buf.push(1u8);
    buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
    let mut cursor = Cursor::new(buf);
    let err = read_msg(&mut cursor).await.unwrap_err();
    assert!(matches!(err, FrameError::TooLarge(_)));
  }
}
