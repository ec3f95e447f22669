//! Peeks at the first bytes of a new connection to guess its protocol,
//! used by the server's shared-port listeners (§4.2) to route a connection
//! before any revtun framing has been exchanged on it. Every sniffer here
//! is best-effort: a positive match is a strong signal, a miss just means
//! "try the next sniffer, then fall through to revtun's own frame type
//! byte."

/// Protocols the sniffer can recognize from a connection's leading bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SniffedProtocol {
  Http,
  TlsClientHello,
  Quic,
  OpenVpn,
  WireGuard,
  Ikev2,
  Socks5,
  Vless,
  Unknown,
}

const HTTP_METHODS: &[&str] = &["GET ", "POST", "PUT ", "HEAD", "DELE", "OPTI", "PATC", "CONN", "TRAC"];

/// Runs every sniffer in order and returns the first match, or
/// [`SniffedProtocol::Unknown`] if none recognize `buf`.
pub fn sniff(buf: &[u8]) -> SniffedProtocol {
  if is_tls_client_hello(buf) {
    SniffedProtocol::TlsClientHello
  } else if is_http_request_line(buf) {
    SniffedProtocol::Http
  } else if is_quic_long_header(buf) {
    SniffedProtocol::Quic
  } else if is_wireguard_handshake_init(buf) {
    SniffedProtocol::WireGuard
  } else if is_openvpn_packet(buf) {
    SniffedProtocol::OpenVpn
  } else if is_ikev2_header(buf) {
    SniffedProtocol::Ikev2
  } else if is_socks5_greeting(buf) {
    SniffedProtocol::Socks5
  } else if is_vless_header(buf) {
    SniffedProtocol::Vless
  } else {
    SniffedProtocol::Unknown
  }
}

fn is_http_request_line(buf: &[u8]) -> bool {
  if buf.len() < 4 {
    return false;
  }
  HTTP_METHODS.iter().any(|m| buf.starts_with(m.as_bytes()))
}

/// A TLS record header (`ContentType::Handshake = 0x16`, version `0x03 0x0N`
/// with `N` in the legacy-minor range `[0x01, 0x04]`) followed by a
/// ClientHello handshake message (`HandshakeType = 0x01`).
fn is_tls_client_hello(buf: &[u8]) -> bool {
  buf.len() >= 6 && buf[0] == 0x16 && buf[1] == 0x03 && (0x01..=0x04).contains(&buf[2]) && buf[5] == 0x01
}

/// Parses the SNI extension out of a TLS ClientHello record, if present.
/// Returns `None` on any malformed or truncated input rather than erroring:
/// sniffing is advisory, a parse failure just means "route elsewhere."
pub fn parse_sni(buf: &[u8]) -> Option<String> {
  if !is_tls_client_hello(buf) {
    return None;
  }

  let mut pos = 5usize; // skip the TLS record header
  pos += 1; // handshake type
  pos = pos.checked_add(3)?; // handshake length (u24)
  pos = pos.checked_add(2)?; // client_version
  pos = pos.checked_add(32)?; // random
  let session_id_len = *buf.get(pos)? as usize;
  pos = pos.checked_add(1)?.checked_add(session_id_len)?;

  let cipher_suites_len = u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]) as usize;
  pos = pos.checked_add(2)?.checked_add(cipher_suites_len)?;

  let compression_len = *buf.get(pos)? as usize;
  pos = pos.checked_add(1)?.checked_add(compression_len)?;

  if pos + 2 > buf.len() {
    return None;
  }
  let extensions_len = u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]) as usize;
  pos = pos.checked_add(2)?;
  let extensions_end = pos.checked_add(extensions_len)?.min(buf.len());

  while pos + 4 <= extensions_end {
    let ext_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    let ext_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
    let ext_start = pos + 4;
    let ext_end = ext_start.checked_add(ext_len)?;
    if ext_end > extensions_end {
      return None;
    }

    if ext_type == 0x0000 {
      // server_name extension: server_name_list_len(2) then entries of
      // { name_type(1), name_len(2), name }
      let list = &buf[ext_start..ext_end];
      if list.len() < 2 {
        return None;
      }
      let mut p = 2usize;
      if p + 3 > list.len() {
        return None;
      }
      let name_type = list[p];
      let name_len = u16::from_be_bytes([list[p + 1], list[p + 2]]) as usize;
      p += 3;
      if name_type != 0x00 || p + name_len > list.len() {
        return None;
      }
      return std::str::from_utf8(&list[p..p + name_len]).ok().map(str::to_string);
    }

    pos = ext_end;
  }

  None
}

/// QUIC long header: top bit of the first byte set *and* the fixed bit
/// (second-from-top) set, followed by the fixed 4-byte version field
/// (draft/v1/v2 all keep this invariant).
fn is_quic_long_header(buf: &[u8]) -> bool {
  buf.len() >= 5 && (buf[0] & 0x80) != 0 && (buf[0] & 0x40) != 0
}

/// OpenVPN's opcode occupies the top 5 bits of the first byte; the only
/// opcodes seen on a freshly opened socket are `P_CONTROL_HARD_RESET_CLIENT_V2`
/// (7) and `P_CONTROL_V1` (4). Over TCP the packet is instead prefixed with a
/// 2-byte length that must account for exactly the rest of the buffer, with
/// the same opcode check applied to the byte that follows the prefix.
fn is_openvpn_packet(buf: &[u8]) -> bool {
  if buf.len() < 2 {
    return false;
  }
  let opcode = buf[0] >> 3;
  if matches!(opcode, 4 | 7) {
    return true;
  }
  if buf.len() > 3 {
    let declared_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if declared_len == buf.len() - 2 {
      let op = buf[2] >> 3;
      if matches!(op, 4 | 7) {
        return true;
      }
    }
  }
  false
}

/// WireGuard's handshake-initiation message is exactly 148 bytes and starts
/// with message type `1` (a `u8`) followed by 3 reserved zero bytes; the
/// length floor is a strict check to avoid false positives on short buffers.
fn is_wireguard_handshake_init(buf: &[u8]) -> bool {
  buf.len() >= 148 && buf[0] == 1 && buf[1] == 0 && buf[2] == 0 && buf[3] == 0
}

/// IKEv2 header: a 28-byte fixed header whose initiator SPI (bytes 0..8)
/// must be non-zero and responder SPI (bytes 8..16) must be zero for the
/// first packet of an exchange, followed by `next_payload`, `version`
/// (`0x20` for IKEv2), and `exchange_type` (34 = `IKE_SA_INIT`, always the
/// first exchange over UDP).
fn is_ikev2_header(buf: &[u8]) -> bool {
  if buf.len() < 28 {
    return false;
  }
  let init_spi = u64::from_be_bytes(buf[0..8].try_into().expect("8-byte slice"));
  if init_spi == 0 {
    return false;
  }
  let resp_spi = u64::from_be_bytes(buf[8..16].try_into().expect("8-byte slice"));
  resp_spi == 0 && buf[17] == 0x20 && buf[18] == 34
}

/// A SOCKS5 greeting: version byte `0x05` followed by a non-zero method
/// count and that many method bytes.
fn is_socks5_greeting(buf: &[u8]) -> bool {
  if buf.len() < 3 || buf[0] != 0x05 {
    return false;
  }
  let nmethods = buf[1] as usize;
  nmethods > 0 && buf.len() >= 2 + nmethods
}

/// VLESS requests begin with a 16-byte UUID followed by an additional
/// options length byte and a command byte (`1` = TCP, `2` = UDP); we only
/// check the version byte (always `0`) and the command byte's range.
fn is_vless_header(buf: &[u8]) -> bool {
  buf.len() >= 18 && buf[0] == 0x00 && matches!(buf[17], 1 | 2)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn recognizes_http_methods() {
    assert_eq!(sniff(b"GET / HTTP/1.1\r\n"), SniffedProtocol::Http);
    assert_eq!(sniff(b"POST /x HTTP/1.1\r\n"), SniffedProtocol::Http);
  }

  #[test]
  fn recognizes_tls_client_hello_header() {
    let buf = [0x16, 0x03, 0x01, 0x00, 0x10, 0x01, 0, 0, 0];
    assert_eq!(sniff(&buf), SniffedProtocol::TlsClientHello);
  }

  #[test]
  fn parses_sni_from_constructed_client_hello() {
    let hostname = b"example.com";
    let mut hello = Vec::new();
    hello.push(0x01); // handshake type: client hello
    let body_len_pos = hello.len();
    hello.extend_from_slice(&[0, 0, 0]); // placeholder length
    hello.extend_from_slice(&[3, 3]); // client_version
    hello.extend_from_slice(&[0u8; 32]); // random
    hello.push(0); // session_id_len
    hello.extend_from_slice(&[0, 2]); // cipher_suites_len
    hello.extend_from_slice(&[0x13, 0x01]); // one cipher suite
    hello.push(1); // compression_len
    hello.push(0); // compression method

    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&[0, 0]); // ext type: server_name
    let mut sni_body = Vec::new();
    let mut name_list = Vec::new();
    name_list.push(0x00); // name_type: host_name
    name_list.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
    name_list.extend_from_slice(hostname);
    sni_body.extend_from_slice(&(name_list.len() as u16).to_be_bytes());
    sni_body.extend_from_slice(&name_list);
    sni_ext.extend_from_slice(&(sni_body.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(&sni_body);

    hello.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    hello.extend_from_slice(&sni_ext);

    let body_len = (hello.len() - body_len_pos - 3) as u32;
    let len_bytes = body_len.to_be_bytes();
    hello[body_len_pos..body_len_pos + 3].copy_from_slice(&len_bytes[1..]);

    let mut record = vec![0x16, 0x03, 0x03];
    record.extend_from_slice(&(hello.len() as u16).to_be_bytes());
    record.extend_from_slice(&hello);

    assert_eq!(parse_sni(&record), Some("example.com".to_string()));
  }

  #[test]
  fn recognizes_quic_long_header() {
    let buf = [0x80 | 0x40 | 0x0F, 0, 0, 0, 1, 0, 0];
    assert_eq!(sniff(&buf), SniffedProtocol::Quic);
  }

  #[test]
  fn quic_long_header_requires_the_fixed_bit() {
    let buf = [0x80 | 0x0F, 0, 0, 0, 1, 0, 0];
    assert_ne!(sniff(&buf), SniffedProtocol::Quic);
  }

  #[test]
  fn tls_record_with_illegal_version_byte_is_not_a_client_hello() {
    let buf = [0x16, 0x03, 0x99, 0x00, 0x10, 0x01, 0, 0, 0];
    assert_ne!(sniff(&buf), SniffedProtocol::TlsClientHello);
  }

  #[test]
  fn wireguard_requires_the_full_148_byte_handshake() {
    let short = [1u8, 0, 0, 0];
    assert_ne!(sniff(&short), SniffedProtocol::WireGuard);
    let mut full = vec![0u8; 148];
    full[0] = 1;
    assert_eq!(sniff(&full), SniffedProtocol::WireGuard);
  }

  #[test]
  fn ikev2_rejects_a_zero_initiator_spi() {
    let mut buf = vec![0u8; 28];
    buf[17] = 0x20;
    buf[18] = 34;
    assert_ne!(sniff(&buf), SniffedProtocol::Ikev2);
  }

  #[test]
  fn ikev2_accepts_a_well_formed_ike_sa_init() {
    let mut buf = vec![0u8; 28];
    buf[0..8].copy_from_slice(&1u64.to_be_bytes());
    buf[17] = 0x20;
    buf[18] = 34;
    assert_eq!(sniff(&buf), SniffedProtocol::Ikev2);
  }

  #[test]
  fn openvpn_rejects_opcodes_outside_the_handshake_set() {
    let buf = [(1u8) << 3, 0];
    assert_ne!(sniff(&buf), SniffedProtocol::OpenVpn);
  }

  #[test]
  fn openvpn_recognizes_the_hard_reset_client_opcode() {
    let buf = [7u8 << 3, 0];
    assert_eq!(sniff(&buf), SniffedProtocol::OpenVpn);
  }

  #[test]
  fn openvpn_tcp_framing_requires_an_exact_length_match() {
    let mut buf = vec![0u8, 3, 7 << 3, 0xAA, 0xBB];
    let declared = (buf.len() - 2) as u16;
    buf[0..2].copy_from_slice(&declared.to_be_bytes());
    assert_eq!(sniff(&buf), SniffedProtocol::OpenVpn);

    buf[0..2].copy_from_slice(&999u16.to_be_bytes());
    assert_ne!(sniff(&buf), SniffedProtocol::OpenVpn);
  }

  #[test]
  fn recognizes_socks5_greeting() {
    let buf = [0x05, 0x01, 0x00];
    assert_eq!(sniff(&buf), SniffedProtocol::Socks5);
  }

  #[test]
  fn unknown_for_empty_buffer() {
    assert_eq!(sniff(&[]), SniffedProtocol::Unknown);
  }
}
