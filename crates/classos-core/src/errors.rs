//! Protocol-level errors.

use thiserror::Error;

use crate::envelope::MessageType;

/// Failure to encode or decode something on the wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a valid JSON envelope.
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    /// The envelope is fine but its payload does not match the declared type.
    #[error("malformed {message_type} payload: {source}")]
    Payload {
        /// Declared type of the envelope.
        message_type: MessageType,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// The `type` tag is outside the closed set.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A role string other than `admin` or `agent`.
    #[error("unknown role: {0}")]
    UnknownRole(String),

    /// Serializing an envelope or payload failed.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ProtocolError>;
