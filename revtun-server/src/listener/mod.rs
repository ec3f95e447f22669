//! Transport listeners and the bind-port session multiplexer (§4.3).
//!
//! Every transport (plain TCP, TLS, KCP, QUIC, WebSocket) normalises its
//! accepted connections to [`BoxedConn`] before handing them to
//! [`mux::dispatch_connections`] — from that point on the rest of the
//! server (frame codec, dispatcher, proxy byte-splicing) never has to know
//! which wire transport a given logical connection arrived on.

pub mod kcp;
pub mod mux;
pub mod prefixed;
pub mod quic;
pub mod tcp;
pub mod tls;
pub mod websocket;

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

/// A normalised bidirectional byte pipe: the common currency every
/// transport listener and the proxy byte-splicers trade in. Spelled out as
/// a trait-object alias with the auto traits named explicitly (`Unpin`,
/// `Send`), since a `dyn Trait` only gets an auto trait when it is named on
/// the object type itself, not merely implied by a supertrait bound.
pub type BoxedConn = Box<dyn AsyncReadWrite + Unpin + Send>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// A freshly accepted logical connection together with the peer address
/// the transport reported for it (best-effort — KCP/QUIC/WebSocket all
/// surface one, but some are less meaningful than a raw TCP peer addr).
pub struct Accepted {
  pub conn: BoxedConn,
  pub peer_addr: SocketAddr,
}
