//! Command channel message definitions.
//!
//! The server sends one JSON object per WebSocket frame, tagged by `action`.
//! The agent answers with one JSON object tagged by `type`. There is no
//! failure message: a command that fails is simply never acknowledged.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Opaque token the server uses to match acknowledgements to commands.
///
/// The server currently sends a JSON number, but strings are accepted too.
/// The token is echoed back with the same JSON type it arrived with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    /// Numeric token (the server's `model_version_id`).
    Number(serde_json::Number),
    /// String token.
    Text(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Number(n) => write!(f, "{}", n),
            CorrelationId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        CorrelationId::Number(value.into())
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        CorrelationId::Text(value.to_string())
    }
}

/// A command received from the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum InboundCommand {
    /// Fetch a remote object into the root directory.
    Download {
        /// Endpoint-relative locator (or absolute URL) of the object. After
        /// the `/downloads/` prefix is removed it is also the destination
        /// path relative to root.
        #[serde(rename = "url")]
        source_locator: String,
        #[serde(rename = "model_version_id")]
        correlation_id: CorrelationId,
    },
    /// Remove a previously fetched object.
    Delete {
        /// Path of the file relative to root.
        #[serde(rename = "filename")]
        relative_path: String,
        /// Optional directory prefix for `relative_path`.
        #[serde(default)]
        subdirectory: Option<String>,
        #[serde(rename = "model_version_id")]
        correlation_id: CorrelationId,
    },
    /// Any action this agent does not know. Ignored.
    #[serde(other)]
    Unknown,
}

impl InboundCommand {
    /// Decode a command from a raw frame payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Name of the action, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            InboundCommand::Download { .. } => "download",
            InboundCommand::Delete { .. } => "delete",
            InboundCommand::Unknown => "unknown",
        }
    }

    /// Correlation token, if the command carries one.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            InboundCommand::Download { correlation_id, .. }
            | InboundCommand::Delete { correlation_id, .. } => Some(correlation_id),
            InboundCommand::Unknown => None,
        }
    }
}

/// An acknowledgement sent back to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundResult {
    /// A download finished and the file is in place.
    #[serde(rename = "complete")]
    Completed {
        #[serde(rename = "model_version_id")]
        correlation_id: CorrelationId,
    },
    /// A file was removed.
    #[serde(rename = "deleted")]
    Deleted {
        #[serde(rename = "model_version_id")]
        correlation_id: CorrelationId,
    },
}

impl OutboundResult {
    /// Encode the result as a JSON text frame payload.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Correlation token being acknowledged.
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            OutboundResult::Completed { correlation_id }
            | OutboundResult::Deleted { correlation_id } => correlation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_decode_download() {
        let raw = br#"{"action":"download","url":"/downloads/Checkpoint/a.safetensors","filename":"","subdirectory":"","model_version_id":128713,"client_id":"desk-1"}"#;
        let cmd = InboundCommand::from_slice(raw).unwrap();
        assert_eq!(
            cmd,
            InboundCommand::Download {
                source_locator: "/downloads/Checkpoint/a.safetensors".to_string(),
                correlation_id: CorrelationId::from(128713u64),
            }
        );
        assert_eq!(cmd.action(), "download");
    }

    #[test]
    fn test_decode_delete_with_string_token() {
        let raw = br#"{"action":"delete","filename":"models/a.bin","model_version_id":"42"}"#;
        let cmd = InboundCommand::from_slice(raw).unwrap();
        assert_eq!(
            cmd,
            InboundCommand::Delete {
                relative_path: "models/a.bin".to_string(),
                subdirectory: None,
                correlation_id: CorrelationId::from("42"),
            }
        );
    }

    #[test]
    fn test_decode_delete_with_subdirectory() {
        let raw = br#"{"action":"delete","filename":"a.bin","subdirectory":"LORA","model_version_id":7}"#;
        match InboundCommand::from_slice(raw).unwrap() {
            InboundCommand::Delete { subdirectory, .. } => {
                assert_eq!(subdirectory.as_deref(), Some("LORA"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_action() {
        let raw = br#"{"action":"rename","filename":"a","model_version_id":1}"#;
        let cmd = InboundCommand::from_slice(raw).unwrap();
        assert_eq!(cmd, InboundCommand::Unknown);
        assert!(cmd.correlation_id().is_none());
    }

    #[test]
    fn test_decode_malformed() {
        let err = InboundCommand::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));

        // Known action with its required field missing.
        let err = InboundCommand::from_slice(br#"{"action":"download","model_version_id":1}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));

        // No action tag at all.
        let err = InboundCommand::from_slice(br#"{"model_version_id":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_encode_results() {
        let json = OutboundResult::Deleted {
            correlation_id: CorrelationId::from("42"),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"deleted","model_version_id":"42"}"#);

        let json = OutboundResult::Completed {
            correlation_id: CorrelationId::from(128713u64),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"complete","model_version_id":128713}"#);
    }

    #[test]
    fn test_correlation_id_display() {
        assert_eq!(CorrelationId::from(42u64).to_string(), "42");
        assert_eq!(CorrelationId::from("abc").to_string(), "abc");
    }
}
