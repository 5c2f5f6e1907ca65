//! Typed event bus.
//!
//! A thin wrapper over `tokio::sync::broadcast` with one channel per event
//! type. Emission never blocks; send errors (no subscribers) are ignored so
//! producers can fire-and-forget, the same discipline the rest of the crate
//! uses for its internal signals.

use libp2p::{Multiaddr, PeerId};
use tokio::sync::broadcast;

/// Capacity of each event channel, per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The host's self-classification of how dialable it is. Produced by an
/// external probe; consumed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unknown,
    Private,
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    NotConnected,
}

/// Emitted by the reachability subsystem whenever its verdict changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalReachabilityChanged {
    pub reachability: Reachability,
}

/// Emitted by the host when a peer's connection state changes.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConnectednessChanged {
    pub peer: PeerId,
    pub connectedness: Connectedness,
}

/// Emitted by the auto-relay supervisor: the current advertisable address
/// set. An empty set is valid and simply advertises nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoRelayAddrsUpdated {
    pub addrs: Vec<Multiaddr>,
}

/// Per-host event bus shared between the supervisor, the finder, and the
/// application. Clones share the underlying channels.
#[derive(Clone)]
pub struct EventBus {
    reachability: broadcast::Sender<LocalReachabilityChanged>,
    connectedness: broadcast::Sender<PeerConnectednessChanged>,
    relay_addrs: broadcast::Sender<AutoRelayAddrsUpdated>,
}

impl EventBus {
    pub fn new() -> Self {
        let (reachability, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connectedness, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (relay_addrs, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus {
            reachability,
            connectedness,
            relay_addrs,
        }
    }

    pub fn subscribe_reachability(&self) -> broadcast::Receiver<LocalReachabilityChanged> {
        self.reachability.subscribe()
    }

    pub fn emit_reachability(&self, event: LocalReachabilityChanged) {
        let _ = self.reachability.send(event);
    }

    pub fn subscribe_connectedness(&self) -> broadcast::Receiver<PeerConnectednessChanged> {
        self.connectedness.subscribe()
    }

    pub fn emit_connectedness(&self, event: PeerConnectednessChanged) {
        let _ = self.connectedness.send(event);
    }

    pub fn subscribe_relay_addrs(&self) -> broadcast::Receiver<AutoRelayAddrsUpdated> {
        self.relay_addrs.subscribe()
    }

    pub fn emit_relay_addrs(&self, event: AutoRelayAddrsUpdated) {
        let _ = self.relay_addrs.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
