//! Agent client errors.

use classos_core::ProtocolError;
use thiserror::Error;

/// Errors surfaced by [`AgentClient`](crate::AgentClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server URL could not be used to build a dial target.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// TCP connect or WebSocket upgrade failed.
    #[error("failed to connect: {0}")]
    Dial(#[source] Box<tokio_tungstenite::tungstenite::Error>),

    /// No live connection to write to.
    #[error("WebSocket connection not established")]
    NotConnected,

    /// The socket rejected a write.
    #[error("failed to write message: {0}")]
    Write(#[source] Box<tokio_tungstenite::tungstenite::Error>),

    /// A write did not complete in time.
    #[error("write timed out")]
    WriteTimeout,

    /// Envelope could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A message handler reported a failure.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The client was closed.
    #[error("client closed")]
    Cancelled,
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(ClientError::NotConnected.to_string(), "WebSocket connection not established");
        assert_eq!(ClientError::Cancelled.to_string(), "client closed");
        assert_eq!(
            ClientError::Handler("boom".into()).to_string(),
            "handler failed: boom"
        );
    }

    #[test]
    fn protocol_error_converts() {
        let err: ClientError = ProtocolError::UnknownType("x".into()).into();
        assert!(matches!(err, ClientError::Protocol(_)));
    }
}
