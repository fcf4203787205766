//! # Model Agent Library
//!
//! The agent keeps a persistent WebSocket command channel open to a model
//! server and carries out the server's `download` and `delete` commands
//! against a single local root directory.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Agent                            │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │   SessionManager (connect, serve, wait, retry)     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │   CommandDispatcher                                │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  ┌──────────────────────┐  ┌──────────────────────────┐  │
//! │  │    PathResolver      │  │    TransferExecutor      │  │
//! │  └──────────────────────┘  └──────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent::{Agent, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut agent = Agent::new(config)?;
//!     agent.start().await?;
//!
//!     // Wait for a shutdown signal...
//!
//!     agent.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`logging`]: Tracing subscriber setup
//! - [`files`]: Path confinement, streaming downloads, removals
//! - [`router`]: Command decoding and dispatch
//! - [`network`]: Command channel session and reconnect loop
//! - [`agent`]: Wiring and lifecycle

pub mod agent;
pub mod config;
pub mod files;
pub mod logging;
pub mod network;
pub mod router;

// Re-export protocol for convenience
pub use protocol;

pub use agent::{Agent, AgentEvent, AgentState, ShutdownHandle};
pub use config::{Config, ConfigError};
pub use files::{
    PathError, PathResolver, RemoveOutcome, ResolvedPath, TransferError, TransferExecutor,
    TransferStats,
};
pub use network::{
    ConnectionState, SessionConfig, SessionEvent, SessionManager, Sleeper, TokioSleeper,
};
pub use router::{CommandDispatcher, DispatchError, DispatchResult};
