//! Wire protocol for the Circuit Relay v2 client.
//!
//! Two protobuf message families, framed on a stream as
//! `varint(length) || bytes(length)`:
//!
//! - HOP: spoken between a peer and a relay to request a reservation or to
//!   initiate a relayed connection.
//! - STOP: spoken from the relay to the destination peer announcing an
//!   incoming relayed connection.
//!
//! This crate is transport-agnostic: it only needs something implementing
//! tokio's `AsyncRead`/`AsyncWrite`.

pub mod framing;
pub mod message;

pub use framing::{write_message, MessageReader, ProtoError, MAX_MESSAGE_SIZE};
pub use message::{
    HopMessage, HopMessageType, Limit, Peer, Reservation, Status, StopMessage, StopMessageType,
};

/// Protocol identifier for HOP streams (peer → relay).
pub const HOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/hop";

/// Protocol identifier for STOP streams (relay → destination peer).
pub const STOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/stop";
