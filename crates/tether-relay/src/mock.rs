//! In-memory `Host`: zero networking, suitable for tests, local demos, and
//! any scenario where the remote side is a scripted task in the same
//! process.
//!
//! Streams are `tokio::io::duplex` pairs: `open_stream` hands the client end
//! to the caller and pushes the server end into the channel registered with
//! [`MockHost::serve_protocol`], where a test task plays the remote peer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use libp2p::{identity, Multiaddr, PeerId};
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::host::{AddrInfo, AddressTtl, Host, IncomingStream, Substream};

const STREAM_BUFFER: usize = 64 * 1024;

#[derive(Default)]
struct Inner {
    listen_addrs: Vec<Multiaddr>,
    /// Peers `connect` succeeds for, with the remote address the resulting
    /// connection reports.
    reachable: HashMap<PeerId, Vec<Multiaddr>>,
    connections: HashMap<PeerId, Vec<Multiaddr>>,
    /// peer → protocols its protocol book lists.
    protocols: HashMap<PeerId, HashSet<String>>,
    addr_book: HashMap<PeerId, Vec<(Multiaddr, AddressTtl)>>,
    /// protocol → handler receiving inbound streams.
    handlers: HashMap<String, mpsc::Sender<IncomingStream>>,
    /// (peer, protocol) → channel receiving the server end of opened streams.
    servers: HashMap<(PeerId, String), mpsc::Sender<Substream>>,
    protect_calls: Vec<(PeerId, String)>,
    unprotect_calls: Vec<(PeerId, String)>,
}

/// Thread-safe in-memory `Host`. Clones share state.
#[derive(Clone)]
pub struct MockHost {
    local: PeerId,
    inner: Arc<Mutex<Inner>>,
}

/// A fresh random peer id.
pub fn new_peer_id() -> PeerId {
    PeerId::from(identity::Keypair::generate_ed25519().public())
}

impl MockHost {
    pub fn new() -> Self {
        MockHost {
            local: new_peer_id(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn set_listen_addrs(&self, addrs: Vec<Multiaddr>) {
        self.inner.lock().unwrap().listen_addrs = addrs;
    }

    /// Make `connect` succeed for this peer. The addresses become the remote
    /// addresses its connections report.
    pub fn add_reachable_peer(&self, info: &AddrInfo) {
        self.inner
            .lock()
            .unwrap()
            .reachable
            .insert(info.peer_id, info.addrs.clone());
    }

    /// Fill the peer's protocol book.
    pub fn set_protocols(&self, peer: PeerId, protocols: &[&str]) {
        self.inner
            .lock()
            .unwrap()
            .protocols
            .insert(peer, protocols.iter().map(|p| p.to_string()).collect());
    }

    /// Register the scripted remote for `(peer, protocol)`. Every stream the
    /// code under test opens arrives on the returned channel.
    pub fn serve_protocol(&self, peer: PeerId, protocol: &str) -> mpsc::Receiver<Substream> {
        let (tx, rx) = mpsc::channel(8);
        self.inner
            .lock()
            .unwrap()
            .servers
            .insert((peer, protocol.to_string()), tx);
        rx
    }

    /// Deliver an inbound stream to the handler registered for `protocol`,
    /// as the host would on stream negotiation. Returns false when no
    /// handler is installed.
    pub fn push_incoming_stream(&self, protocol: &str, peer: PeerId, stream: Substream) -> bool {
        let tx = {
            let inner = self.inner.lock().unwrap();
            inner.handlers.get(protocol).cloned()
        };
        match tx {
            Some(tx) => tx.try_send(IncomingStream { peer, stream }).is_ok(),
            None => false,
        }
    }

    /// Drop all connections to `peer`. The caller emits the corresponding
    /// connectedness event on the bus if the scenario needs one.
    pub fn disconnect(&self, peer: &PeerId) {
        self.inner.lock().unwrap().connections.remove(peer);
    }

    pub fn protect_calls(&self) -> Vec<(PeerId, String)> {
        self.inner.lock().unwrap().protect_calls.clone()
    }

    pub fn unprotect_calls(&self) -> Vec<(PeerId, String)> {
        self.inner.lock().unwrap().unprotect_calls.clone()
    }

    /// Addresses recorded in the address book for `peer`, with their TTLs.
    pub fn recorded_addrs(&self, peer: &PeerId) -> Vec<(Multiaddr, AddressTtl)> {
        self.inner
            .lock()
            .unwrap()
            .addr_book
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_stream_handler(&self, protocol: &str) -> bool {
        self.inner.lock().unwrap().handlers.contains_key(protocol)
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Host for MockHost {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.lock().unwrap().listen_addrs.clone()
    }

    async fn connect(&self, info: &AddrInfo) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.connections.contains_key(&info.peer_id) {
            return Ok(());
        }
        let Some(known) = inner.reachable.get(&info.peer_id).cloned() else {
            return Err(RelayError::ConnectionFailed(format!(
                "no route to {}",
                info.peer_id
            )));
        };
        let remote = if info.addrs.is_empty() { known } else { info.addrs.clone() };
        inner.connections.insert(info.peer_id, remote);
        Ok(())
    }

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<Substream, RelayError> {
        let tx = {
            let inner = self.inner.lock().unwrap();
            if !inner.connections.contains_key(&peer) {
                return Err(RelayError::ConnectionFailed(format!(
                    "not connected to {peer}"
                )));
            }
            inner.servers.get(&(peer, protocol.to_string())).cloned()
        };
        let Some(tx) = tx else {
            return Err(RelayError::ConnectionFailed(format!(
                "{peer} does not serve {protocol}"
            )));
        };
        let (client, server) = tokio::io::duplex(STREAM_BUFFER);
        tx.send(Box::new(server) as Substream)
            .await
            .map_err(|_| RelayError::ConnectionFailed(format!("{peer} went away")))?;
        Ok(Box::new(client))
    }

    fn connections(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    fn set_stream_handler(&self, protocol: &str, tx: mpsc::Sender<IncomingStream>) {
        self.inner
            .lock()
            .unwrap()
            .handlers
            .insert(protocol.to_string(), tx);
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.inner.lock().unwrap().handlers.remove(protocol);
    }

    fn supports_protocol(&self, peer: &PeerId, protocol: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .protocols
            .get(peer)
            .is_some_and(|set| set.contains(protocol))
    }

    fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: AddressTtl) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.addr_book.entry(*peer).or_default();
        for addr in addrs {
            entry.push((addr.clone(), ttl));
        }
    }

    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.inner
            .lock()
            .unwrap()
            .addr_book
            .get(peer)
            .map(|entries| entries.iter().map(|(addr, _)| addr.clone()).collect())
            .unwrap_or_default()
    }

    fn protect(&self, peer: &PeerId, tag: &str) {
        self.inner
            .lock()
            .unwrap()
            .protect_calls
            .push((*peer, tag.to_string()));
    }

    fn unprotect(&self, peer: &PeerId, tag: &str) {
        self.inner
            .lock()
            .unwrap()
            .unprotect_calls
            .push((*peer, tag.to_string()));
    }
}
