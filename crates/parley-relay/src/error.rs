//! Relay errors.
//!
//! Every error here stays local to the relay. Routing errors drop the message
//! and leave the connection alone; protocol violations terminate the offending
//! connection only. Peers never receive an error reply, they observe silence.

use parley_proto::ProtoError;
use thiserror::Error;

/// Errors raised while handling a relay connection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    // ============ Routing Errors ============
    /// A socket id had no alias prefix
    #[error("Malformed socket id: {0:?}")]
    MalformedSocketId(String),

    /// A message claimed to come from another connection's alias
    #[error("Sender alias {claimed} does not match connection alias {actual}")]
    SpoofedSender {
        /// Alias prefix found in the message
        claimed: String,
        /// Alias of the connection it arrived on
        actual: String,
    },

    /// No live connection under this alias
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// No host registered under this alias
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    /// The connection already registered a host
    #[error("Host already registered for {0}")]
    AlreadyListening(String),

    // ============ Protocol Violations ============
    /// A text frame arrived where only binary frames are allowed
    #[error("Non-binary frame received")]
    NonBinaryFrame,

    /// A binary frame did not decode into a broker message
    #[error("Undecodable frame: {0}")]
    Decode(#[from] ProtoError),

    /// `CreateServerRequest` without server data
    #[error("Missing server data")]
    MissingServerData,

    // ============ Capacity & I/O ============
    /// The relay is at its peer limit
    #[error("Relay at capacity ({0} peers)")]
    ServerFull(usize),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl RelayError {
    /// Returns true if the offending connection must be closed
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::NonBinaryFrame | RelayError::Decode(_) | RelayError::MissingServerData
        )
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err.to_string())
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
