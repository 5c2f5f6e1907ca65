//! Circuit Relay v2 client and reachability-driven auto-relay.
//!
//! A peer that cannot be dialed directly stays reachable by reserving slots
//! on third-party relays and advertising circuit addresses through them.
//! This crate provides the client side: the HOP/STOP transport
//! ([`transport::CircuitTransport`]), the reservation exchange
//! ([`reservation::reserve`]), the relay finder that keeps a small
//! reservation set alive ([`finder::RelayFinder`]), and the supervisor that
//! ties it all to the host's reachability ([`autorelay::AutoRelay`]).
//!
//! The host itself (identity, peerstore, connections, streams) stays behind
//! the narrow [`host::Host`] trait; [`mock::MockHost`] implements it in
//! memory.

pub mod autorelay;
pub mod config;
pub mod error;
pub mod events;
pub mod finder;
pub mod host;
pub mod metrics;
pub mod mock;
pub mod reservation;
pub mod sanitize;
pub mod transport;

pub use autorelay::AutoRelay;
pub use config::AutoRelayConfig;
pub use error::RelayError;
pub use events::{
    AutoRelayAddrsUpdated, Connectedness, EventBus, LocalReachabilityChanged,
    PeerConnectednessChanged, Reachability,
};
pub use finder::{RelayFinder, ScheduledWorkTimes, AUTORELAY_TAG};
pub use host::{AddrInfo, AddressTtl, CandidateSource, Host, IncomingStream, Substream};
pub use metrics::{NoopTracer, Tracer};
pub use reservation::Reservation;
pub use transport::{CircuitConn, CircuitLimit, CircuitListener, CircuitTransport, ConnStat};
