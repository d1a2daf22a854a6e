#![forbid(unsafe_code)]

// Error taxonomy for signaling operations.
//
// Every variant is recoverable at the request level: handlers turn it into
// an `{reqId?, error}` frame and the connection stays open. Connection I/O
// failures are handled by the connection loop itself, not through this type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    /// Unparseable payload or a field that fails validation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Display text is load-bearing: clients match on it.
    #[error("Producer not found")]
    ProducerNotFound,

    #[error("Peer id already taken: {0}")]
    PeerIdTaken(String),

    /// A request whose stated preconditions do not hold (e.g. `produce`
    /// before a send transport exists).
    #[error("{0}")]
    Precondition(String),

    /// The media worker rejected an operation; the message is forwarded
    /// verbatim and any partially-created resource has been rolled back.
    #[error("{0}")]
    Worker(String),
}

pub type SignalResult<T> = Result<T, SignalError>;

impl From<crate::media::MediaError> for SignalError {
    fn from(err: crate::media::MediaError) -> Self {
        SignalError::Worker(err.to_string())
    }
}
