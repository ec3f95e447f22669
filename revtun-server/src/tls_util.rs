//! Loads a PEM certificate chain and private key off disk for the
//! control-plane TLS sub-listener (§4.3). Mirrors `ferron`'s own
//! `util/load_tls.rs` helpers — a plain `rustls-pemfile` read, no ACME, no
//! hot reload (the server's own listening certificate is static; only the
//! client-side HTTPS-to-HTTP plugin's certificate is runtime-swappable,
//! §4.9).

use rustls_pki_types::{CertificateDer, PrivateKeyDer};

pub fn load_certs(filename: &str) -> std::io::Result<Vec<CertificateDer<'static>>> {
  let file = std::fs::File::open(filename).map_err(|e| std::io::Error::other(format!("failed to open {filename}: {e}")))?;
  let mut reader = std::io::BufReader::new(file);
  rustls_pemfile::certs(&mut reader).collect()
}

pub fn load_private_key(filename: &str) -> std::io::Result<PrivateKeyDer<'static>> {
  let file = std::fs::File::open(filename).map_err(|e| std::io::Error::other(format!("failed to open {filename}: {e}")))?;
  let mut reader = std::io::BufReader::new(file);
  match rustls_pemfile::private_key(&mut reader) {
    Ok(Some(key)) => Ok(key),
    Ok(None) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key found in file")),
    Err(err) => Err(err),
  }
}
