//! Codec errors.

use thiserror::Error;

/// Errors produced while encoding or decoding wire messages
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// A message could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A frame could not be decoded into a message
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// A JSON negotiation payload was malformed
    #[error("Invalid negotiation payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        ProtoError::InvalidPayload(err.to_string())
    }
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtoError>;
