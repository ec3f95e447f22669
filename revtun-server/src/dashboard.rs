//! Read-only JSON status API plus the two admin mutations the dashboard
//! exposes: sweeping stale `offline` proxy history and kicking a connected
//! client (§4.11). Built directly on `hyper::server::conn::http1` and
//! `service_fn`, the same low-level shape the vhost listeners' sibling
//! crate reaches for instead of a routing framework.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use revtun_common::error::RevtunError;
use revtun_common::logging::LogMessage;
use revtun_common::runid::RunId;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::state::ServerState;

pub async fn run(bind_addr: SocketAddr, state: Arc<ServerState>, shutdown: CancellationToken, logger: revtun_common::logging::Logger) -> Result<(), RevtunError> {
  let listener = TcpListener::bind(bind_addr).await.map_err(|e| RevtunError::Fatal(format!("cannot bind dashboard on {bind_addr}: {e}")))?;

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => return Ok(()),
      accepted = listener.accept() => {
        let (stream, _peer) = match accepted {
          Ok(pair) => pair,
          Err(err) => {
            logger.send(LogMessage::error(format!("dashboard listener: accept failed: {err}"))).await.ok();
            continue;
          }
        };
        let state = state.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
          let io = TokioIo::new(stream);
          let service = service_fn(move |req| {
            let state = state.clone();
            async move { Ok::<_, Infallible>(handle(req, state).await) }
          });
          if let Err(err) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
            logger.send(LogMessage::info(format!("dashboard connection ended: {err}"))).await.ok();
          }
        });
      }
    }
  }
}

fn json_response(status: StatusCode, body: &impl Serialize) -> Response<Full<Bytes>> {
  let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
  Response::builder()
    .status(status)
    .header("content-type", "application/json")
    .body(Full::new(Bytes::from(bytes)))
    .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
  Response::builder().status(status).body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap()
}

fn is_authorized(req: &Request<Incoming>, state: &ServerState) -> bool {
  let (Some(user), Some(pwd)) = (&state.config.dashboard_user, &state.config.dashboard_pwd) else {
    return true;
  };
  let Some(header) = req.headers().get(hyper::header::AUTHORIZATION) else {
    return false;
  };
  let Ok(header) = header.to_str() else { return false };
  let Some(encoded) = header.strip_prefix("Basic ") else { return false };
  let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
    return false;
  };
  let Ok(decoded) = String::from_utf8(decoded) else { return false };
  decoded == format!("{user}:{pwd}")
}

async fn handle(req: Request<Incoming>, state: Arc<ServerState>) -> Response<Full<Bytes>> {
  if req.uri().path() == "/healthz" {
    return plain_response(StatusCode::OK, "ok");
  }

  if !is_authorized(&req, &state) {
    return plain_response(StatusCode::UNAUTHORIZED, "unauthorized");
  }

  let method = req.method().clone();
  let path = req.uri().path().to_string();
  let query = req.uri().query().unwrap_or("").to_string();
  let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

  match (&method, segments.as_slice()) {
    (&Method::GET, ["api", "serverinfo"]) => server_info(&state).await,
    (&Method::GET, ["api", "proxy", proxy_type]) => proxies_by_type(&state, proxy_type, &query).await,
    (&Method::GET, ["api", "proxy", proxy_type, name]) => proxy_detail(&state, proxy_type, name).await,
    (&Method::GET, ["api", "traffic", name]) => traffic(&state, name, &query).await,
    (&Method::DELETE, ["api", "proxies"]) => sweep_offline(&state, &query).await,
    (&Method::POST, ["api", "client", "kick"]) => kick(req, &state).await,
    _ => plain_response(StatusCode::NOT_FOUND, "not found"),
  }
}

#[derive(Serialize)]
struct ServerInfo {
  bind_port: u16,
  kcp_bind_port: Option<u16>,
  quic_bind_port: Option<u16>,
  vhost_http_port: u16,
  vhost_https_port: u16,
  client_count: usize,
  proxy_count: usize,
}

async fn server_info(state: &ServerState) -> Response<Full<Bytes>> {
  let info = ServerInfo {
    bind_port: state.config.bind_port,
    kcp_bind_port: state.config.kcp_bind_port,
    quic_bind_port: state.config.quic_bind_port,
    vhost_http_port: state.config.vhost_http_port,
    vhost_https_port: state.config.vhost_https_port,
    client_count: state.control.len().await,
    proxy_count: state.proxies.len().await,
  };
  json_response(StatusCode::OK, &info)
}

#[derive(Serialize)]
struct ProxyInfo {
  name: String,
  proxy_type: String,
  owner: String,
  remote_addr: String,
  cur_conns: u64,
  traffic_today_in: u64,
  traffic_today_out: u64,
  status: &'static str,
}

async fn proxies_by_type(state: &ServerState, proxy_type: &str, query: &str) -> Response<Full<Bytes>> {
  let status = query_param(query, "status").unwrap_or_else(|| "online".to_string());
  if status == "offline" {
    let closed = state.proxies.closed().await;
    let list: Vec<_> = closed
      .iter()
      .filter(|r| r.proxy_type == proxy_type)
      .map(|r| ProxyInfo {
        name: r.name.clone(),
        proxy_type: r.proxy_type.to_string(),
        owner: r.owner.to_string(),
        remote_addr: String::new(),
        cur_conns: 0,
        traffic_today_in: r.traffic_month.0,
        traffic_today_out: r.traffic_month.1,
        status: "offline",
      })
      .collect();
    return json_response(StatusCode::OK, &list);
  }

  let list: Vec<_> = state
    .proxies
    .all()
    .await
    .into_iter()
    .filter(|p| p.proxy_type() == proxy_type)
    .map(|p| {
      let (in_bytes, out_bytes) = p.traffic_window(1);
      ProxyInfo {
        name: p.name.clone(),
        proxy_type: p.proxy_type().to_string(),
        owner: p.owner.to_string(),
        remote_addr: p.remote_addr.clone(),
        cur_conns: p.cur_conns(),
        traffic_today_in: in_bytes,
        traffic_today_out: out_bytes,
        status: "online",
      }
    })
    .collect();
  json_response(StatusCode::OK, &list)
}

async fn proxy_detail(state: &ServerState, proxy_type: &str, name: &str) -> Response<Full<Bytes>> {
  if let Some(p) = state.proxies.get(name).await {
    if p.proxy_type() == proxy_type {
      let (in_bytes, out_bytes) = p.traffic_window(1);
      let info = ProxyInfo {
        name: p.name.clone(),
        proxy_type: p.proxy_type().to_string(),
        owner: p.owner.to_string(),
        remote_addr: p.remote_addr.clone(),
        cur_conns: p.cur_conns(),
        traffic_today_in: in_bytes,
        traffic_today_out: out_bytes,
        status: "online",
      };
      return json_response(StatusCode::OK, &info);
    }
  }
  plain_response(StatusCode::NOT_FOUND, "not found")
}

#[derive(Serialize)]
struct TrafficResponse {
  trend: String,
  bytes_in: u64,
  bytes_out: u64,
}

fn trend_days(trend: &str) -> u32 {
  match trend {
    "3days" => 3,
    "week" => 7,
    "14days" => 14,
    "month" => 30,
    _ => 1,
  }
}

async fn traffic(state: &ServerState, name: &str, query: &str) -> Response<Full<Bytes>> {
  let trend = query_param(query, "trend").unwrap_or_else(|| "day".to_string());
  let Some(proxy) = state.proxies.get(name).await else {
    return plain_response(StatusCode::NOT_FOUND, "not found");
  };
  let (bytes_in, bytes_out) = proxy.traffic_window(trend_days(&trend));
  json_response(StatusCode::OK, &TrafficResponse { trend, bytes_in, bytes_out })
}

#[derive(Serialize)]
struct SweepResponse {
  swept: usize,
}

async fn sweep_offline(state: &ServerState, query: &str) -> Response<Full<Bytes>> {
  if query_param(query, "status").as_deref() != Some("offline") {
    return plain_response(StatusCode::BAD_REQUEST, "only status=offline is supported");
  }
  let swept = state.proxies.clear_closed().await;
  json_response(StatusCode::OK, &SweepResponse { swept })
}

#[derive(serde::Deserialize)]
struct KickRequest {
  #[serde(rename = "runId")]
  run_id: String,
}

#[derive(Serialize)]
struct KickResponse {
  kicked: bool,
}

async fn kick(req: Request<Incoming>, state: &ServerState) -> Response<Full<Bytes>> {
  let body = match req.into_body().collect().await {
    Ok(collected) => collected.to_bytes(),
    Err(_) => return plain_response(StatusCode::BAD_REQUEST, "could not read request body"),
  };
  let Ok(kick_req) = serde_json::from_slice::<KickRequest>(&body) else {
    return plain_response(StatusCode::BAD_REQUEST, "expected {\"runId\": \"...\"}");
  };
  let run_id = RunId::from(kick_req.run_id);

  let kicked = if let Some(controller) = state.control.get(&run_id).await {
    state.control.remove_if_current(&run_id, &controller).await;
    controller.mark_closed();
    true
  } else {
    false
  };
  state.kick_blacklist.lock().await.ban(run_id);

  json_response(StatusCode::OK, &KickResponse { kicked })
}

fn query_param(query: &str, key: &str) -> Option<String> {
  query.split('&').find_map(|pair| {
    let (k, v) = pair.split_once('=')?;
    (k == key).then(|| v.to_string())
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn query_param_finds_a_value_among_several_pairs() {
    assert_eq!(query_param("status=offline&x=1", "status"), Some("offline".to_string()));
    assert_eq!(query_param("x=1", "status"), None);
  }

  #[test]
  fn trend_days_maps_every_named_window() {
    assert_eq!(trend_days("day"), 1);
    assert_eq!(trend_days("3days"), 3);
    assert_eq!(trend_days("week"), 7);
    assert_eq!(trend_days("14days"), 14);
    assert_eq!(trend_days("month"), 30);
    assert_eq!(trend_days("garbage"), 1);
  }
}
