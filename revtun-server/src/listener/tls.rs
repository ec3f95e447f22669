//! Wraps an accepted byte pipe in the control plane's own server TLS
//! context (§4.3's TLS sub-listener — distinct from the per-proxy HTTPS
//! muxer in [`crate::proxy::https`], which never terminates TLS at all).

use std::sync::Arc;

use revtun_common::error::RevtunError;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

pub async fn accept_tls<S>(acceptor: &TlsAcceptor, stream: S) -> Result<TlsStream<S>, RevtunError>
where
  S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
  acceptor.accept(stream).await.map_err(|e| RevtunError::Protocol(format!("TLS handshake failed: {e}")))
}

/// Builds the control-plane TLS acceptor from a single certificate chain
/// and private key (PEM-encoded, already loaded by the out-of-scope config
/// layer).
pub fn build_acceptor(cert_chain: Vec<rustls_pki_types::CertificateDer<'static>>, key: rustls_pki_types::PrivateKeyDer<'static>) -> Result<TlsAcceptor, RevtunError> {
  let config = rustls::ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| RevtunError::Fatal(format!("invalid control-plane TLS certificate: {e}")))?;
  Ok(TlsAcceptor::from(Arc::new(config)))
}
