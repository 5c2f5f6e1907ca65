//! Host capability seam.
//!
//! `Host` is the single boundary between this crate and whatever networking
//! stack the application runs (a full swarm in production, the in-memory
//! [`crate::mock::MockHost`] in tests). The caller constructs the concrete
//! implementation and wraps it in an `Arc`. Neither the transport nor the
//! relay finder holds anything wider than this trait, which keeps the
//! host ↔ transport reference cycle out of the picture.

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::RelayError;

/// A peer id plus the addresses it is reachable on.
#[derive(Debug, Clone, PartialEq)]
pub struct AddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl AddrInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        AddrInfo { peer_id, addrs }
    }
}

/// Byte-stream object trait. Dropping a substream resets it; well-behaved
/// code calls `shutdown()` first on clean paths.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// A negotiated byte stream to a remote peer.
pub type Substream = Box<dyn StreamIo>;

/// An inbound stream delivered to a registered protocol handler.
pub struct IncomingStream {
    /// The peer on the other end of the stream. For STOP streams this is the
    /// relay forwarding the circuit, not the circuit's source peer.
    pub peer: PeerId,
    pub stream: Substream,
}

/// How long the address book keeps an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressTtl {
    /// Short-lived hint.
    Temporary,
    /// Valid while a connection to the peer exists.
    Connected,
    /// Never expires.
    Permanent,
}

/// Narrow view of the host a relay client needs. See the module docs.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    // ── Identity ─────────────────────────────────────────────────────────────

    /// This host's own peer identity.
    fn local_peer_id(&self) -> PeerId;

    /// Addresses this host is currently listening on.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    // ── Connections and streams ──────────────────────────────────────────────

    /// Ensure a connection to `info` exists, dialing its addresses if needed.
    async fn connect(&self, info: &AddrInfo) -> Result<(), RelayError>;

    /// Open a new stream to `peer` negotiated under `protocol`.
    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<Substream, RelayError>;

    /// Remote addresses of the currently open connections to `peer`.
    fn connections(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// Register `tx` to receive every inbound stream negotiated under
    /// `protocol`. Replaces any previous handler for that protocol.
    fn set_stream_handler(&self, protocol: &str, tx: mpsc::Sender<IncomingStream>);

    /// Remove the handler for `protocol`. Streams arriving afterwards are
    /// reset by the host.
    fn remove_stream_handler(&self, protocol: &str);

    // ── Peerstore ────────────────────────────────────────────────────────────

    /// Whether the peer's protocol book lists support for `protocol`.
    fn supports_protocol(&self, peer: &PeerId, protocol: &str) -> bool;

    /// Record addresses for `peer` in the address book.
    fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: AddressTtl);

    /// All known addresses for `peer`.
    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr>;

    // ── Connection manager ───────────────────────────────────────────────────

    /// Pin connections to `peer` open under `tag`.
    fn protect(&self, peer: &PeerId, tag: &str);

    /// Drop the pin previously placed under `tag`.
    fn unprotect(&self, peer: &PeerId, tag: &str);
}

/// External source of relay candidates.
///
/// `candidates(n)` returns a channel yielding up to `n` `AddrInfo`s and then
/// closing. The implementation decides where they come from (DHT walk,
/// routing table sample, static list, ...); this crate only consumes them.
#[async_trait]
pub trait CandidateSource: Send + Sync + 'static {
    async fn candidates(&self, n: usize) -> mpsc::Receiver<AddrInfo>;
}

/// `CandidateSource` over a fixed list, backing the static-relay mode.
/// Every call yields the same peers.
pub struct StaticRelaySource {
    relays: Vec<AddrInfo>,
}

impl StaticRelaySource {
    pub fn new(relays: Vec<AddrInfo>) -> Self {
        StaticRelaySource { relays }
    }
}

#[async_trait]
impl CandidateSource for StaticRelaySource {
    async fn candidates(&self, n: usize) -> mpsc::Receiver<AddrInfo> {
        let (tx, rx) = mpsc::channel(self.relays.len().max(1));
        for info in self.relays.iter().take(n) {
            // Capacity covers the whole list, so this never fails.
            let _ = tx.try_send(info.clone());
        }
        rx
    }
}
