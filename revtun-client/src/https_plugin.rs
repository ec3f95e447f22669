//! HTTPS-to-HTTP termination plugin (§4.9): the client side of an `https`
//! proxy. The forwarder hands this plugin tunnelled TLS connections over an
//! in-memory queue; the plugin terminates TLS with a runtime-supplied
//! certificate and reverse-proxies the cleartext request to the proxy's
//! local backend, the same raw-`hyper`-no-framework style
//! `ferron/src/optional_modules/fauth.rs` uses for its own outbound calls.
//!
//! Certificate hot-swap (§4.8 "Hot reload") is realised the way `acme.rs`
//! realises its own ACME cert rotation: a single persistent resolver whose
//! `CertifiedKey` is replaced under a lock, rather than tearing down and
//! rebuilding the TLS acceptor.

use std::sync::{Arc, RwLock as StdRwLock};

use base64::Engine;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper::server::conn::http2 as server_http2;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use revtun_common::error::RevtunError;
use revtun_common::logging::{LogMessage, Logger};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::{HttpsPluginConfig, ProxyWrapperConfig};
use crate::transport::BoxedConn;

pub struct PluginHandle {
  pub queue_tx: mpsc::UnboundedSender<BoxedConn>,
  resolver: Arc<HotSwapResolver>,
}

#[derive(Debug)]
struct HotSwapResolver {
  key: StdRwLock<Arc<CertifiedKey>>,
}

impl ResolvesServerCert for HotSwapResolver {
  fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    Some(self.key.read().unwrap().clone())
  }
}

/// Starts the plugin's accept loop and returns a handle the wrapper uses to
/// feed it tunnelled connections and to push certificate updates.
pub async fn spawn(proxy: Arc<ProxyWrapperConfig>, logger: Logger, shutdown: CancellationToken) -> Result<PluginHandle, RevtunError> {
  let plugin = proxy.https_plugin.clone().ok_or_else(|| RevtunError::Fatal(format!("proxy {} has no https_plugin configured", proxy.name)))?;

  let certified_key = build_certified_key(&plugin)?;
  let resolver = Arc::new(HotSwapResolver { key: StdRwLock::new(Arc::new(certified_key)) });

  let mut server_config = rustls::ServerConfig::builder().with_no_client_auth().with_cert_resolver(resolver.clone());
  if plugin.enable_http2 {
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
  } else {
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
  }
  let acceptor = TlsAcceptor::from(Arc::new(server_config));

  let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<BoxedConn>();
  let (local_ip, local_port) = proxy.config.local_addr();
  let local_addr = format!("{local_ip}:{local_port}");

  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => return,
        incoming = queue_rx.recv() => {
          let Some(conn) = incoming else { return };
          let acceptor = acceptor.clone();
          let local_addr = local_addr.clone();
          let logger = logger.clone();
          let proxy_name = proxy.name.clone();
          let extra_headers = plugin.extra_headers.clone();
          tokio::spawn(async move {
            if let Err(err) = handle_connection(conn, acceptor, local_addr, extra_headers).await {
              logger.send(LogMessage::error(format!("https plugin {proxy_name}: connection failed: {err}"))).await.ok();
            }
          });
        }
      }
    }
  });

  Ok(PluginHandle { queue_tx, resolver })
}

async fn handle_connection(conn: BoxedConn, acceptor: TlsAcceptor, local_addr: String, extra_headers: std::collections::HashMap<String, String>) -> Result<(), RevtunError> {
  let tls = acceptor.accept(conn).await.map_err(|e| RevtunError::Protocol(format!("TLS handshake failed: {e}")))?;
  let sni = tls.get_ref().1.server_name().map(|s| s.to_string());
  let is_http2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());

  let backend = TcpStream::connect(&local_addr).await.map_err(|e| RevtunError::Transient(format!("local backend {local_addr} unreachable: {e}")))?;
  let (sender, backend_conn) = client_http1::handshake(TokioIo::new(backend)).await.map_err(|e| RevtunError::Protocol(format!("local backend handshake failed: {e}")))?;
  tokio::spawn(async move {
    backend_conn.await.ok();
  });
  let sender = Arc::new(AsyncMutex::new(sender));

  let io = TokioIo::new(tls);
  let service = service_fn(move |req: Request<Incoming>| {
    let sender = sender.clone();
    let sni = sni.clone();
    let extra_headers = extra_headers.clone();
    async move { proxy_request(req, sender, sni, extra_headers).await }
  });

  if is_http2 {
    server_http2::Builder::new(TokioExecutor::new())
      .serve_connection(io, service)
      .await
      .map_err(|e| RevtunError::Transient(format!("connection serving failed: {e}")))
  } else {
    server_http1::Builder::new()
      .serve_connection(io, service)
      .await
      .map_err(|e| RevtunError::Transient(format!("connection serving failed: {e}")))
  }
}

async fn proxy_request(
  req: Request<Incoming>,
  sender: Arc<AsyncMutex<client_http1::SendRequest<BoxBody<Bytes, hyper::Error>>>>,
  sni: Option<String>,
  extra_headers: std::collections::HashMap<String, String>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
  let host = req.headers().get(http::header::HOST).and_then(|v| v.to_str().ok()).map(|s| s.to_string());
  if let (Some(sni), Some(host)) = (&sni, &host) {
    if !canonical_host(sni).eq_ignore_ascii_case(&canonical_host(host)) {
      return Ok(misdirected_request());
    }
  }

  let (parts, body) = req.into_parts();
  let mut builder = Request::builder().method(parts.method).uri(parts.uri);
  for (name, value) in parts.headers.iter() {
    builder = builder.header(name, value);
  }
  for (name, value) in &extra_headers {
    builder = builder.header(name.as_str(), value.as_str());
  }
  let Ok(outbound) = builder.body(body.boxed()) else {
    return Ok(bad_gateway());
  };

  let mut sender = sender.lock().await;
  match sender.send_request(outbound).await {
    Ok(resp) => {
      let (parts, body) = resp.into_parts();
      let bytes = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
      Ok(Response::from_parts(parts, Full::new(bytes)))
    }
    Err(_) => Ok(bad_gateway()),
  }
}

fn canonical_host(host: &str) -> String {
  host.split(':').next().unwrap_or(host).trim_end_matches('.').to_ascii_lowercase()
}

fn misdirected_request() -> Response<Full<Bytes>> {
  Response::builder().status(StatusCode::MISDIRECTED_REQUEST).body(Full::new(Bytes::new())).unwrap()
}

fn bad_gateway() -> Response<Full<Bytes>> {
  Response::builder().status(StatusCode::BAD_GATEWAY).body(Full::new(Bytes::new())).unwrap()
}

/// Replaces the running plugin's certificate in place; the control channel
/// and the TLS acceptor it's installed in are left untouched.
pub async fn hot_swap(handle: &PluginHandle, crt_base64: &str, key_base64: &str, logger: &Logger) {
  match decode_certified_key(crt_base64, key_base64) {
    Ok(certified_key) => {
      *handle.resolver.key.write().unwrap() = Arc::new(certified_key);
      logger.send(LogMessage::info("https plugin certificate hot-swapped".to_string())).await.ok();
    }
    Err(err) => {
      logger.send(LogMessage::error(format!("https plugin certificate update rejected: {err}"))).await.ok();
    }
  }
}

fn build_certified_key(plugin: &HttpsPluginConfig) -> Result<CertifiedKey, RevtunError> {
  if plugin.auto_tls {
    if !plugin.crt_base64.is_empty() && !plugin.key_base64.is_empty() {
      return decode_certified_key(&plugin.crt_base64, &plugin.key_base64);
    }
    return self_signed_certified_key();
  }

  let cert_path = plugin.cert_path.as_ref().ok_or_else(|| RevtunError::Fatal("https_plugin.cert_path required when auto_tls is false".into()))?;
  let key_path = plugin.key_path.as_ref().ok_or_else(|| RevtunError::Fatal("https_plugin.key_path required when auto_tls is false".into()))?;
  let certs = load_certs_from_file(cert_path)?;
  let key = load_key_from_file(key_path)?;
  sign(certs, key)
}

fn decode_certified_key(crt_base64: &str, key_base64: &str) -> Result<CertifiedKey, RevtunError> {
  let cert_pem = base64::engine::general_purpose::STANDARD.decode(crt_base64).map_err(|e| RevtunError::Protocol(format!("invalid crt_base64: {e}")))?;
  let key_pem = base64::engine::general_purpose::STANDARD.decode(key_base64).map_err(|e| RevtunError::Protocol(format!("invalid key_base64: {e}")))?;

  let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<Result<_, _>>().map_err(|e| RevtunError::Protocol(format!("invalid certificate PEM: {e}")))?;
  let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
    .map_err(|e| RevtunError::Protocol(format!("invalid private key PEM: {e}")))?
    .ok_or_else(|| RevtunError::Protocol("no private key found".into()))?;

  sign(certs, key)
}

fn self_signed_certified_key() -> Result<CertifiedKey, RevtunError> {
  let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).map_err(|e| RevtunError::Fatal(format!("invalid self-signed cert params: {e}")))?;
  let key_pair = rcgen::KeyPair::generate().map_err(|e| RevtunError::Fatal(format!("failed to generate key pair: {e}")))?;
  let certificate = params.self_signed(&key_pair).map_err(|e| RevtunError::Fatal(format!("failed to self-sign certificate: {e}")))?;
  let private_key = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|e| RevtunError::Fatal(format!("invalid generated key: {e}")))?;
  sign(vec![certificate.der().to_owned()], private_key)
}

fn sign(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<CertifiedKey, RevtunError> {
  let signing_key = rustls::crypto::CryptoProvider::get_default()
    .ok_or_else(|| RevtunError::Fatal("no default crypto provider installed".into()))?
    .key_provider
    .load_private_key(key)
    .map_err(|e| RevtunError::Fatal(format!("invalid private key: {e}")))?;
  Ok(CertifiedKey::new(certs, signing_key))
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>, RevtunError> {
  let file = std::fs::File::open(path).map_err(|e| RevtunError::Fatal(format!("failed to open {path}: {e}")))?;
  let mut reader = std::io::BufReader::new(file);
  rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>().map_err(|e| RevtunError::Fatal(format!("failed to parse {path}: {e}")))
}

fn load_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>, RevtunError> {
  let file = std::fs::File::open(path).map_err(|e| RevtunError::Fatal(format!("failed to open {path}: {e}")))?;
  let mut reader = std::io::BufReader::new(file);
  rustls_pemfile::private_key(&mut reader)
    .map_err(|e| RevtunError::Fatal(format!("failed to parse {path}: {e}")))?
    .ok_or_else(|| RevtunError::Fatal(format!("no private key found in {path}")))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn canonical_host_strips_port_and_trailing_dot() {
    assert_eq!(canonical_host("Example.com.:8443"), "example.com");
    assert_eq!(canonical_host("example.com"), "example.com");
  }
}
