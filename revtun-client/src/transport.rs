//! Dials the server's control bind port (§4.3), normalising the result to
//! the same [`BoxedConn`] currency `revtun_server::listener` trades in —
//! everything above this module (control read/write loop, work-conn
//! dialer) only ever sees a plain byte pipe.

use std::sync::Arc;

use revtun_common::error::RevtunError;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::ClientConfig;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

pub type BoxedConn = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Opens one fresh connection to the server's bind port, TLS-wrapped when
/// `server_tls` is set. Used both for the control connection and for every
/// work connection the client proactively dials (§5 "one control reader ...
/// one wrapper-loop task per proxy").
pub async fn dial(config: &ClientConfig) -> Result<BoxedConn, RevtunError> {
  let tcp = TcpStream::connect((config.server_addr.as_str(), config.server_port))
    .await
    .map_err(|e| RevtunError::Transient(format!("connect to {}:{} failed: {e}", config.server_addr, config.server_port)))?;
  tcp.set_nodelay(true).ok();

  if !config.server_tls {
    return Ok(Box::new(tcp));
  }

  let roots = root_store(config)?;
  let tls_config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(tls_config));
  let server_name = ServerName::try_from(config.server_addr.clone()).map_err(|e| RevtunError::Fatal(format!("invalid server name {}: {e}", config.server_addr)))?;
  let tls = connector
    .connect(server_name, tcp)
    .await
    .map_err(|e| RevtunError::Transient(format!("TLS handshake with {} failed: {e}", config.server_addr)))?;
  Ok(Box::new(tls))
}

fn root_store(config: &ClientConfig) -> Result<RootCertStore, RevtunError> {
  let mut roots = RootCertStore::empty();
  match &config.tls_ca_cert_path {
    Some(path) => {
      let file = std::fs::File::open(path).map_err(|e| RevtunError::Fatal(format!("failed to open {path}: {e}")))?;
      let mut reader = std::io::BufReader::new(file);
      for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| RevtunError::Fatal(format!("failed to parse CA cert {path}: {e}")))?;
        roots.add(cert).map_err(|e| RevtunError::Fatal(format!("invalid CA cert {path}: {e}")))?;
      }
    }
    None => {
      for cert in rustls_native_certs::load_native_certs().certs {
        roots.add(cert).ok();
      }
    }
  }
  Ok(roots)
}
