//! WebSocket transport listener (§4.3). The mux recognises the upgrade
//! request by its request line alone (`GET <WEBSOCKET_PATH>`); this module
//! does the actual handshake and then bridges WebSocket binary frames onto
//! a `tokio::io::duplex`, so the rest of the server sees an ordinary byte
//! pipe instead of framed WS messages.

use futures_util::{SinkExt, StreamExt};
use revtun_common::error::RevtunError;
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::listener::BoxedConn;

pub const WEBSOCKET_PATH: &str = "/revtun/ws";

const BRIDGE_BUF: usize = 64 * 1024;

/// Completes the server-side WebSocket handshake on `stream` (which must
/// already contain the full, unconsumed upgrade request — callers pass a
/// [`crate::listener::prefixed::Prefixed`] wrapper when the mux peeked
/// bytes off the front) and returns a boxed byte pipe carrying binary
/// frame payloads.
pub async fn upgrade<S>(stream: S) -> Result<BoxedConn, RevtunError>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let ws = tokio_tungstenite::accept_async(stream)
    .await
    .map_err(|e| RevtunError::Protocol(format!("websocket handshake failed: {e}")))?;

  let (local, remote) = tokio::io::duplex(BRIDGE_BUF);
  let (mut remote_read, mut remote_write) = tokio::io::split(remote);
  let (mut ws_write, mut ws_read) = ws.split();

  tokio::spawn(async move {
    while let Some(msg) = ws_read.next().await {
      match msg {
        Ok(WsMessage::Binary(data)) => {
          if remote_write.write_all(&data).await.is_err() {
            break;
          }
        }
        Ok(WsMessage::Close(_)) | Err(_) => break,
        Ok(_) => {}
      }
    }
  });
  tokio::spawn(async move {
    let mut buf = vec![0u8; BRIDGE_BUF];
    loop {
      match remote_read.read(&mut buf).await {
        Ok(0) => break,
        Ok(n) => {
          if ws_write.send(WsMessage::Binary(buf[..n].to_vec().into())).await.is_err() {
            break;
          }
        }
        Err(_) => break,
      }
    }
    ws_write.close().await.ok();
  });

  Ok(Box::new(local))
}
