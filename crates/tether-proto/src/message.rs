//! HOP and STOP protobuf messages.
//!
//! The structs are written by hand rather than generated: the schema is tiny
//! and stable, and hand-written types let the field docs live next to the
//! tags. Multiaddresses travel in their canonical binary form (`bytes`), peer
//! ids as their multihash bytes.

/// Message type discriminants for the HOP protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum HopMessageType {
    Reserve = 1,
    Connect = 2,
    Status = 3,
}

/// Message type discriminants for the STOP protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum StopMessageType {
    Connect = 1,
    Status = 2,
}

/// Outcome codes carried in STATUS messages, shared by both protocols.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Ok = 100,
    ReservationRefused = 200,
    ResourceLimitExceeded = 201,
    PermissionDenied = 202,
    ConnectionFailed = 203,
    NoReservation = 204,
    MalformedMessage = 400,
    UnexpectedMessage = 401,
}

impl Status {
    /// Short human-readable description, used when surfacing a relay's
    /// STATUS verbatim in an error.
    pub fn description(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::ReservationRefused => "reservation refused",
            Status::ResourceLimitExceeded => "resource limit exceeded",
            Status::PermissionDenied => "permission denied",
            Status::ConnectionFailed => "connection failed",
            Status::NoReservation => "no reservation",
            Status::MalformedMessage => "malformed message",
            Status::UnexpectedMessage => "unexpected message",
        }
    }
}

/// A peer reference: multihash id plus multiaddresses in binary form.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Peer {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
}

/// A granted reservation as reported by the relay.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reservation {
    /// Absolute expiry, seconds since the Unix epoch.
    #[prost(uint64, tag = "1")]
    pub expire: u64,
    /// The relay's own addresses, handed back so the client can advertise
    /// circuit addresses through them.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
    /// Opaque signed voucher blob; carried but not validated by this client.
    #[prost(bytes = "vec", optional, tag = "3")]
    pub voucher: Option<Vec<u8>>,
}

/// Per-circuit resource limits announced by the relay.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Limit {
    /// Maximum circuit duration in seconds.
    #[prost(uint32, optional, tag = "1")]
    pub duration: Option<u32>,
    /// Maximum bytes relayed in each direction.
    #[prost(uint64, optional, tag = "2")]
    pub data: Option<u64>,
}

/// A message on a HOP stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HopMessage {
    #[prost(enumeration = "HopMessageType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub peer: Option<Peer>,
    #[prost(message, optional, tag = "3")]
    pub reservation: Option<Reservation>,
    #[prost(message, optional, tag = "4")]
    pub limit: Option<Limit>,
    #[prost(enumeration = "Status", optional, tag = "5")]
    pub status: Option<i32>,
    /// Opaque id attached to CONNECT requests for cross-node log correlation.
    /// Not semantically significant.
    #[prost(string, optional, tag = "6")]
    pub diagnostic_session_id: Option<String>,
}

/// A message on a STOP stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopMessage {
    #[prost(enumeration = "StopMessageType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub peer: Option<Peer>,
    #[prost(message, optional, tag = "3")]
    pub limit: Option<Limit>,
    #[prost(enumeration = "Status", optional, tag = "4")]
    pub status: Option<i32>,
    #[prost(string, optional, tag = "5")]
    pub diagnostic_session_id: Option<String>,
}

impl HopMessage {
    pub fn reserve() -> Self {
        HopMessage {
            r#type: HopMessageType::Reserve as i32,
            ..Default::default()
        }
    }

    pub fn connect(dest: Peer, session_id: String) -> Self {
        HopMessage {
            r#type: HopMessageType::Connect as i32,
            peer: Some(dest),
            diagnostic_session_id: Some(session_id),
            ..Default::default()
        }
    }

    pub fn with_status(status: Status) -> Self {
        HopMessage {
            r#type: HopMessageType::Status as i32,
            status: Some(status as i32),
            ..Default::default()
        }
    }

    /// The STATUS code of this message, if it carries a valid one.
    pub fn status_code(&self) -> Option<Status> {
        self.status.and_then(|s| Status::try_from(s).ok())
    }
}

impl StopMessage {
    pub fn connect(src: Peer) -> Self {
        StopMessage {
            r#type: StopMessageType::Connect as i32,
            peer: Some(src),
            ..Default::default()
        }
    }

    pub fn with_status(status: Status) -> Self {
        StopMessage {
            r#type: StopMessageType::Status as i32,
            status: Some(status as i32),
            ..Default::default()
        }
    }

    pub fn status_code(&self) -> Option<Status> {
        self.status.and_then(|s| Status::try_from(s).ok())
    }
}
