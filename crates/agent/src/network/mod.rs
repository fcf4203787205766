//! Network module for the command channel.
//!
//! The [`session`] module owns the WebSocket connection to the server and
//! its reconnect loop. Waiting between attempts goes through the [`Sleeper`]
//! trait so tests can run the loop without real delays.

pub mod session;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Source of the delay between reconnection attempts.
pub trait Sleeper: Send + Sync {
    /// Wait for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// [`Sleeper`] backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

// Re-export key types
pub use session::{
    ConnectionState, SessionConfig, SessionEvent, SessionManager, CLIENT_ID_HEADER,
};
