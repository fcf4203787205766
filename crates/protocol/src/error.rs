//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering wire codec and command channel failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize an outbound message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize an inbound message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Channel errors
    /// The channel endpoint URL is unusable.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Channel handshake was refused or could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Channel was closed or broke while in use.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionRefused => ProtocolError::HandshakeFailed(err.to_string()),
            _ => ProtocolError::ConnectionClosed(err.to_string()),
        }
    }
}
