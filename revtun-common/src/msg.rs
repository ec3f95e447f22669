//! Wire message variants exchanged over the frame codec (§4.1, §6).
//!
//! Each variant gets its own type byte; the payload is whatever subset of
//! fields that variant needs, JSON-encoded. The type byte disambiguates
//! variants whose JSON shapes would otherwise collide (e.g. an empty object
//! for both `Ping` and `Pong`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::frame::FrameError;
use crate::proxy::ProxyConfig;
use crate::runid::RunId;

const TYPE_LOGIN: u8 = 1;
const TYPE_LOGIN_RESP: u8 = 2;
const TYPE_NEW_PROXY: u8 = 3;
const TYPE_NEW_PROXY_RESP: u8 = 4;
const TYPE_PING: u8 = 5;
const TYPE_PONG: u8 = 6;
const TYPE_NEW_WORK_CONN: u8 = 7;
const TYPE_NEW_VISITOR_CONN: u8 = 8;
const TYPE_CLOSE_PROXY: u8 = 9;
const TYPE_UDP_PACKET: u8 = 10;
const TYPE_UPDATE_CERT: u8 = 11;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Login {
  pub version: String,
  pub hostname: Option<String>,
  pub os: String,
  pub arch: String,
  pub user: String,
  pub run_id: Option<RunId>,
  #[serde(default)]
  pub metas: HashMap<String, String>,
  pub privilege_key: String,
  pub timestamp: i64,
  pub pool_count: u32,
  #[serde(default)]
  pub client_specs: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginResp {
  pub version: String,
  pub run_id: RunId,
  pub server_udp_port: u16,
  #[serde(default)]
  pub error: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewProxy {
  pub proxy_name: String,
  pub config: ProxyConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewProxyResp {
  pub proxy_name: String,
  #[serde(default)]
  pub remote_addr: String,
  #[serde(default)]
  pub error: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewWorkConn {
  pub run_id: RunId,
  /// Which proxy this connection is offered for. The server's work-conn
  /// pool is keyed by proxy name (not just by controller) so a client
  /// running several proxies at once never has a connection meant for one
  /// backend handed to another (§4.6).
  pub proxy_name: String,
  pub timestamp: i64,
  pub privilege_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewVisitorConn {
  pub run_id: Option<RunId>,
  pub proxy_name: String,
  pub sign_key: String,
  pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseProxy {
  pub proxy_name: String,
}

/// One UDP datagram relayed over a dedicated work connection. `content` is
/// base64-encoded since JSON has no byte-string type; `remote_addr` is the
/// originating public client's address so the client-side forwarder knows
/// which local "connection" (really: which return address) a reply belongs
/// to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UdpPacket {
  pub remote_addr: String,
  pub content: String,
}

/// Server-authoritative certificate push for a client's `https` proxy
/// (§4.9, §6 "Certificate update channel"): `crt_base64`/`key_base64` are
/// each `base64(PEM(...))`, matching the precedence the plugin's own
/// config fields use, so a received update can be written into it
/// unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateCert {
  pub proxy_name: String,
  pub crt_base64: String,
  pub key_base64: String,
}

#[derive(Clone, Debug)]
pub enum Message {
  Login(Login),
  LoginResp(LoginResp),
  NewProxy(NewProxy),
  NewProxyResp(NewProxyResp),
  Ping,
  Pong,
  NewWorkConn(NewWorkConn),
  NewVisitorConn(NewVisitorConn),
  CloseProxy(CloseProxy),
  UdpPacket(UdpPacket),
  UpdateCert(UpdateCert),
}

impl Message {
  pub(crate) fn encode(&self) -> Result<(u8, Vec<u8>), FrameError> {
    fn to_vec<T: Serialize>(type_byte: u8, value: &T) -> Result<(u8, Vec<u8>), FrameError> {
      serde_json::to_vec(value)
        .map(|bytes| (type_byte, bytes))
        .map_err(|source| FrameError::Malformed { type_byte, source })
    }

    match self {
      Message::Login(v) => to_vec(TYPE_LOGIN, v),
      Message::LoginResp(v) => to_vec(TYPE_LOGIN_RESP, v),
      Message::NewProxy(v) => to_vec(TYPE_NEW_PROXY, v),
      Message::NewProxyResp(v) => to_vec(TYPE_NEW_PROXY_RESP, v),
      Message::Ping => Ok((TYPE_PING, b"{}".to_vec())),
      Message::Pong => Ok((TYPE_PONG, b"{}".to_vec())),
      Message::NewWorkConn(v) => to_vec(TYPE_NEW_WORK_CONN, v),
      Message::NewVisitorConn(v) => to_vec(TYPE_NEW_VISITOR_CONN, v),
      Message::CloseProxy(v) => to_vec(TYPE_CLOSE_PROXY, v),
      Message::UdpPacket(v) => to_vec(TYPE_UDP_PACKET, v),
      Message::UpdateCert(v) => to_vec(TYPE_UPDATE_CERT, v),
    }
  }

  pub(crate) fn decode(type_byte: u8, payload: &[u8]) -> Result<Message, FrameError> {
    let parse = |payload: &[u8]| serde_json::from_slice(payload).map_err(|source| FrameError::Malformed { type_byte, source });

    Ok(match type_byte {
      TYPE_LOGIN => Message::Login(parse(payload)?),
      TYPE_LOGIN_RESP => Message::LoginResp(parse(payload)?),
      TYPE_NEW_PROXY => Message::NewProxy(parse(payload)?),
      TYPE_NEW_PROXY_RESP => Message::NewProxyResp(parse(payload)?),
      TYPE_PING => Message::Ping,
      TYPE_PONG => Message::Pong,
      TYPE_NEW_WORK_CONN => Message::NewWorkConn(parse(payload)?),
      TYPE_NEW_VISITOR_CONN => Message::NewVisitorConn(parse(payload)?),
      TYPE_CLOSE_PROXY => Message::CloseProxy(parse(payload)?),
      TYPE_UDP_PACKET => Message::UdpPacket(parse(payload)?),
      TYPE_UPDATE_CERT => Message::UpdateCert(parse(payload)?),
      other => return Err(FrameError::UnknownType(other)),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn login_round_trips_through_json() {
    let login = Login {
      version: "1.0".into(),
      hostname: None,
      os: "linux".into(),
      arch: "x86_64".into(),
      user: "alice".into(),
      run_id: None,
      metas: Default::default(),
      privilege_key: "key".into(),
      timestamp: 42,
      pool_count: 1,
      client_specs: vec!["tcp".into()],
    };
    let (type_byte, payload) = Message::Login(login).encode().unwrap();
    assert_eq!(type_byte, TYPE_LOGIN);
    match Message::decode(type_byte, &payload).unwrap() {
      Message::Login(decoded) => assert_eq!(decoded.user, "alice"),
      other => panic!("unexpected message: {other:?}"),
    }
  }

  #[test]
  fn update_cert_round_trips_through_json() {
    let update = UpdateCert {
      proxy_name: "web-https".into(),
      crt_base64: "Y2VydA==".into(),
      key_base64: "a2V5".into(),
    };
    let (type_byte, payload) = Message::UpdateCert(update).encode().unwrap();
    match Message::decode(type_byte, &payload).unwrap() {
      Message::UpdateCert(decoded) => assert_eq!(decoded.proxy_name, "web-https"),
      other => panic!("unexpected message: {other:?}"),
    }
  }

  #[test]
  fn ping_and_pong_have_distinct_type_bytes_despite_identical_payload() {
    let (ping_type, ping_payload) = Message::Ping.encode().unwrap();
    let (pong_type, pong_payload) = Message::Pong.encode().unwrap();
    assert_eq!(ping_payload, pong_payload);
    assert_ne!(ping_type, pong_type);
    assert!(matches!(Message::decode(ping_type, &ping_payload).unwrap(), Message::Ping));
    assert!(matches!(Message::decode(pong_type, &pong_payload).unwrap(), Message::Pong));
  }
}
