//! # Model Agent Protocol
//!
//! Wire definitions for the command channel between the model manager
//! server and a local agent.
//!
//! ## Overview
//!
//! - **Inbound commands**: `download` and `delete`, tagged by `action`
//! - **Outbound results**: `complete` and `deleted`, tagged by `type`
//! - **Errors**: codec and channel failures shared with the agent
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{InboundCommand, OutboundResult};
//!
//! let raw = br#"{"action":"delete","filename":"models/a.bin","model_version_id":"42"}"#;
//! let command = InboundCommand::from_slice(raw).unwrap();
//!
//! if let InboundCommand::Delete { correlation_id, .. } = command {
//!     let ack = OutboundResult::Deleted { correlation_id };
//!     assert_eq!(ack.to_json().unwrap(), r#"{"type":"deleted","model_version_id":"42"}"#);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Command and result definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{CorrelationId, InboundCommand, OutboundResult};
