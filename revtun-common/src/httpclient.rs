//! One-shot outbound HTTP/HTTPS calls for the handful of places this system
//! talks to the outside world instead of to a tunnel peer: the server's load
//! webhook and public-IP lookup (§4.10), the client's tunnel-inventory query
//! (§6). Mirrors `ferron`'s own outbound client shape in
//! `optional_modules/fauth.rs` — a raw `hyper::client::conn::http1::handshake`
//! over a manually dialed stream, not a pooled/reqwest-style client, since
//! none of these call sites need connection reuse.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::RevtunError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Issues one request and returns the response with its body fully buffered.
/// Closes the connection afterward; callers doing this more than a few times
/// a minute should not reach for this helper.
pub async fn send(req: Request<Full<Bytes>>) -> Result<Response<Bytes>, RevtunError> {
  let uri = req.uri().clone();
  let host = uri.host().ok_or_else(|| RevtunError::ExternalService(format!("URL has no host: {uri}")))?.to_string();
  let is_https = uri.scheme_str() == Some("https");
  let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

  let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
    .await
    .map_err(|_| RevtunError::Transient(format!("connect to {host}:{port} timed out")))?
    .map_err(|e| RevtunError::ExternalService(format!("connect to {host}:{port} failed: {e}")))?;

  if is_https {
    let io = TokioIo::new(tls_connect(&host, tcp).await?);
    request_over(io, req).await
  } else {
    let io = TokioIo::new(tcp);
    request_over(io, req).await
  }
}

async fn tls_connect(host: &str, tcp: TcpStream) -> Result<tokio_rustls::client::TlsStream<TcpStream>, RevtunError> {
  let mut roots = RootCertStore::empty();
  for cert in rustls_native_certs::load_native_certs().certs {
    roots.add(cert).ok();
  }
  let config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  let server_name = ServerName::try_from(host.to_string()).map_err(|e| RevtunError::ExternalService(format!("invalid TLS server name {host}: {e}")))?;
  connector
    .connect(server_name, tcp)
    .await
    .map_err(|e| RevtunError::ExternalService(format!("TLS handshake with {host} failed: {e}")))
}

async fn request_over<S>(io: TokioIo<S>, req: Request<Full<Bytes>>) -> Result<Response<Bytes>, RevtunError>
where
  S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
  let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.map_err(|e| RevtunError::ExternalService(format!("HTTP handshake failed: {e}")))?;

  tokio::spawn(async move {
    let _ = conn.await;
  });

  let response = sender.send_request(req).await.map_err(|e| RevtunError::ExternalService(format!("HTTP request failed: {e}")))?;
  let (parts, body): (_, Incoming) = response.into_parts();
  let collected = body.collect().await.map_err(|e| RevtunError::ExternalService(format!("failed reading response body: {e}")))?;
  Ok(Response::from_parts(parts, collected.to_bytes()))
}

/// Convenience wrapper for a GET request returning the body as text.
pub async fn get_text(url: &str) -> Result<String, RevtunError> {
  let uri: Uri = url.parse().map_err(|e| RevtunError::ExternalService(format!("invalid URL {url}: {e}")))?;
  let req = Request::get(uri).body(Full::new(Bytes::new())).map_err(|e| RevtunError::ExternalService(e.to_string()))?;
  let resp = send(req).await?;
  String::from_utf8(resp.body().to_vec()).map_err(|e| RevtunError::ExternalService(format!("non-utf8 response body: {e}")))
}

/// Convenience wrapper for a JSON POST, returning the response body as text.
pub async fn post_json(url: &str, body: &impl serde::Serialize) -> Result<String, RevtunError> {
  let uri: Uri = url.parse().map_err(|e| RevtunError::ExternalService(format!("invalid URL {url}: {e}")))?;
  let payload = serde_json::to_vec(body).map_err(|e| RevtunError::ExternalService(format!("failed to encode JSON body: {e}")))?;
  let req = Request::post(uri)
    .header("content-type", "application/json")
    .body(Full::new(Bytes::from(payload)))
    .map_err(|e| RevtunError::ExternalService(e.to_string()))?;
  let resp = send(req).await?;
  String::from_utf8(resp.body().to_vec()).map_err(|e| RevtunError::ExternalService(format!("non-utf8 response body: {e}")))
}
