use tether_proto::{ProtoError, Status};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("peer does not support the circuit relay HOP protocol")]
    ProtocolNotSupported,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("relay rejected the request: {} ({reason})", status.description())]
    Rejected { status: Status, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("component already shut down")]
    Shutdown,
}

impl RelayError {
    /// Wrap a non-OK STATUS reported by the relay, keeping its code verbatim.
    pub fn from_status(status: Status) -> Self {
        RelayError::Rejected {
            status,
            reason: status.description().to_string(),
        }
    }
}

impl From<ProtoError> for RelayError {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::Io(io) => RelayError::ConnectionFailed(io.to_string()),
            other => RelayError::MalformedMessage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::ConnectionFailed(e.to_string())
    }
}
