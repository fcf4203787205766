//! Filesystem side of the agent.
//!
//! - [`resolver`]: turns server locators into paths confined to the root
//! - [`transfer`]: streams downloads to disk and removes files
//!
//! # Security
//!
//! Nothing in this module accepts a bare `Path` from the network. Both
//! [`TransferExecutor::materialize`] and [`TransferExecutor::remove`] take a
//! [`ResolvedPath`], which only [`PathResolver::resolve`] can produce.

pub mod resolver;
pub mod transfer;

pub use resolver::{locator_path, PathError, PathResolver, ResolvedPath, DOWNLOADS_PREFIX};
pub use transfer::{RemoveOutcome, TransferError, TransferExecutor, TransferStats};
