//! Error types for the broker, peer sockets and transport collaborators.
//!
//! # Error Categories
//!
//! - **Request**: a broker operation could not complete (not identified, timed
//!   out, link gone)
//! - **Negotiation**: a peer socket failed (transport failure, protocol
//!   violation by the remote, send on a channel that is not open)
//! - **Transport**: the underlying peer connection library reported an error

use parley_proto::ProtoError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors reported by the transport collaborator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A session description could not be parsed
    #[error("SDP Parse Error: {0}")]
    SdpParse(Cow<'static, str>),

    /// Operation invalid in the current signaling state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// The transport was closed
    #[error("Transport is closed")]
    Closed,

    /// Data channel operation failed
    #[error("Data channel error: {0}")]
    Channel(Cow<'static, str>),

    /// Any other failure
    #[error("Transport error: {0}")]
    Other(Cow<'static, str>),
}

impl TransportError {
    /// Whether the error carries the SDP parse error signature
    ///
    /// Receivers retry an answer with its original description when this holds.
    #[must_use]
    pub fn is_sdp_parse_error(&self) -> bool {
        self.to_string().contains("SDP Parse Error")
    }
}

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors raised by the broker and its peer sockets
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    // ============ Request Errors ============
    /// Operation invoked before the relay assigned an alias
    #[error("Not yet identified by the relay")]
    NotIdentified,

    /// `listen` called while already listening or waiting to listen
    #[error("Already listening")]
    AlreadyListening,

    /// Request timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Relay link closed before a response arrived
    #[error("Relay link closed")]
    Disconnected,

    /// Relay link failed to send or connect
    #[error("Relay link error: {0}")]
    Link(Cow<'static, str>),

    /// Wire encoding failed
    #[error("Codec error: {0}")]
    Codec(#[from] ProtoError),

    // ============ Negotiation Errors ============
    /// The remote broke the negotiation protocol
    #[error("Protocol violation: {0}")]
    Protocol(Cow<'static, str>),

    /// The peer connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(Cow<'static, str>),

    /// Send attempted with no usable data channel
    #[error("Channel not open: {0}")]
    ChannelNotOpen(Cow<'static, str>),

    /// The socket was closed
    #[error("Manually closed")]
    Closed,

    /// Transport collaborator error
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BrokerError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout(_) | BrokerError::Disconnected | BrokerError::Link(_)
        )
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        BrokerError::Timeout(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        BrokerError::Protocol(Cow::Borrowed(context))
    }

    /// Create a link error with static context (zero allocation)
    #[must_use]
    pub const fn link(context: &'static str) -> Self {
        BrokerError::Link(Cow::Borrowed(context))
    }

    /// Create a connection failure with static context (zero allocation)
    #[must_use]
    pub const fn connection_failed(context: &'static str) -> Self {
        BrokerError::ConnectionFailed(Cow::Borrowed(context))
    }
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised by NAT detection
#[derive(Debug, Error, Clone)]
pub enum NatError {
    /// The probe transport failed
    #[error("NAT probe failed: {0}")]
    Transport(#[from] TransportError),
}
