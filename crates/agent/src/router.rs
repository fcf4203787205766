//! Command dispatcher.
//!
//! Decodes inbound frames, runs the matching filesystem operation and
//! produces the acknowledgement to send back, if any. [`CommandDispatcher::handle`]
//! is the single place where failures turn into "log and send nothing".

use protocol::messages::{CorrelationId, InboundCommand, OutboundResult};
use protocol::ProtocolError;
use tracing::{debug, error, info, warn};

use crate::files::{
    locator_path, PathError, PathResolver, RemoveOutcome, TransferError, TransferExecutor,
};

/// Result type for dispatcher operations.
pub type DispatchResult = Result<Option<OutboundResult>, DispatchError>;

/// Errors that can occur while dispatching a command.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The frame is not a valid command.
    #[error("malformed command: {0}")]
    Decode(#[from] ProtocolError),

    /// The locator was rejected by the path resolver.
    #[error("{action} {correlation_id}: rejected locator {locator:?}: {source}")]
    Path {
        action: &'static str,
        correlation_id: CorrelationId,
        locator: String,
        source: PathError,
    },

    /// The filesystem or network operation failed.
    #[error("{action} {correlation_id}: {locator:?}: {source}")]
    Transfer {
        action: &'static str,
        correlation_id: CorrelationId,
        locator: String,
        source: TransferError,
    },
}

/// Routes decoded commands to the resolver and executor.
pub struct CommandDispatcher {
    resolver: PathResolver,
    executor: TransferExecutor,
}

impl CommandDispatcher {
    /// Create a dispatcher over the given resolver and executor.
    pub fn new(resolver: PathResolver, executor: TransferExecutor) -> Self {
        Self { resolver, executor }
    }

    /// The path resolver commands are confined by.
    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Dispatch a raw frame payload.
    ///
    /// Returns `Ok(None)` for commands that are valid but produce no
    /// acknowledgement (unknown actions, deletes of missing files).
    pub async fn dispatch(&self, raw: &[u8]) -> DispatchResult {
        let command = InboundCommand::from_slice(raw)?;
        debug!(
            action = command.action(),
            correlation_id = ?command.correlation_id(),
            "Dispatching command"
        );

        match command {
            InboundCommand::Download {
                source_locator,
                correlation_id,
            } => self.handle_download(source_locator, correlation_id).await,
            InboundCommand::Delete {
                relative_path,
                subdirectory,
                correlation_id,
            } => {
                let locator = join_subdirectory(subdirectory.as_deref(), &relative_path);
                self.handle_delete(locator, correlation_id).await
            }
            InboundCommand::Unknown => {
                debug!("Ignoring command with unknown action");
                Ok(None)
            }
        }
    }

    /// Dispatch a raw frame payload, logging any failure.
    ///
    /// Never fails: every error becomes `None`, meaning nothing is sent back.
    pub async fn handle(&self, raw: &[u8]) -> Option<OutboundResult> {
        match self.dispatch(raw).await {
            Ok(result) => result,
            Err(DispatchError::Decode(e)) => {
                warn!(error = %e, bytes = raw.len(), "Ignoring malformed command");
                None
            }
            Err(DispatchError::Path {
                action,
                correlation_id,
                locator,
                source,
            }) => {
                error!(
                    action,
                    correlation_id = %correlation_id,
                    locator = %locator,
                    error = %source,
                    "Command rejected"
                );
                None
            }
            Err(DispatchError::Transfer {
                action,
                correlation_id,
                locator,
                source,
            }) => {
                error!(
                    action,
                    correlation_id = %correlation_id,
                    locator = %locator,
                    error = %source,
                    "Command failed"
                );
                None
            }
        }
    }

    async fn handle_download(
        &self,
        locator: String,
        correlation_id: CorrelationId,
    ) -> DispatchResult {
        const ACTION: &str = "download";

        let destination = match self.resolver.resolve(locator_path(&locator)) {
            Ok(destination) => destination,
            Err(source) => {
                return Err(DispatchError::Path {
                    action: ACTION,
                    correlation_id,
                    locator,
                    source,
                })
            }
        };

        let source_url = match self.executor.source_url(&locator) {
            Ok(url) => url,
            Err(source) => {
                return Err(DispatchError::Transfer {
                    action: ACTION,
                    correlation_id,
                    locator,
                    source,
                })
            }
        };

        info!(
            correlation_id = %correlation_id,
            url = %source_url,
            file = %destination.relative().display(),
            destination = %destination,
            "Downloading"
        );

        match self.executor.materialize(&source_url, &destination).await {
            Ok(stats) => {
                info!(
                    correlation_id = %correlation_id,
                    destination = %destination,
                    bytes = stats.bytes_written,
                    writes = stats.writes,
                    "Download complete"
                );
                Ok(Some(OutboundResult::Completed { correlation_id }))
            }
            Err(source) => Err(DispatchError::Transfer {
                action: ACTION,
                correlation_id,
                locator,
                source,
            }),
        }
    }

    async fn handle_delete(&self, locator: String, correlation_id: CorrelationId) -> DispatchResult {
        const ACTION: &str = "delete";

        let target = match self.resolver.resolve(&locator) {
            Ok(target) => target,
            Err(source) => {
                return Err(DispatchError::Path {
                    action: ACTION,
                    correlation_id,
                    locator,
                    source,
                })
            }
        };

        match self.executor.remove(&target).await {
            Ok(RemoveOutcome::Removed) => {
                info!(
                    correlation_id = %correlation_id,
                    file = %target.relative().display(),
                    path = %target.entry().display(),
                    "Deleted"
                );
                Ok(Some(OutboundResult::Deleted { correlation_id }))
            }
            Ok(RemoveOutcome::NotFound) => {
                warn!(
                    correlation_id = %correlation_id,
                    path = %target.entry().display(),
                    "Nothing to delete"
                );
                Ok(None)
            }
            Err(source) => Err(DispatchError::Transfer {
                action: ACTION,
                correlation_id,
                locator,
                source,
            }),
        }
    }
}

/// Prefix `filename` with the optional subdirectory of a delete command.
fn join_subdirectory(subdirectory: Option<&str>, filename: &str) -> String {
    match subdirectory
        .map(|dir| dir.trim_end_matches(|c| c == '/' || c == '\\'))
        .filter(|dir| !dir.is_empty())
    {
        Some(dir) => format!("{}/{}", dir, filename),
        None => filename.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use url::Url;

    struct TestContext {
        temp_dir: TempDir,
        dispatcher: CommandDispatcher,
    }

    impl TestContext {
        fn root(&self) -> &Path {
            self.dispatcher.resolver().root()
        }

        fn outside(&self) -> PathBuf {
            self.temp_dir.path().join("outside")
        }
    }

    fn setup() -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("srv").join("store");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(temp_dir.path().join("outside")).unwrap();

        let resolver = PathResolver::new(&root).unwrap();
        // Port 9 (discard) is never contacted by these tests.
        let executor =
            TransferExecutor::new(&Url::parse("ws://127.0.0.1:9/ws").unwrap(), 64 * 1024)
                .unwrap();

        TestContext {
            temp_dir,
            dispatcher: CommandDispatcher::new(resolver, executor),
        }
    }

    fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn listing(dir: &Path) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        entries.sort();
        entries
    }

    #[tokio::test]
    async fn test_delete_existing_file() {
        let ctx = setup();
        let file = create_test_file(ctx.root(), "models/a.bin", b"weights");

        let raw = br#"{"action":"delete","filename":"models/a.bin","model_version_id":"42"}"#;
        let result = ctx.dispatcher.handle(raw).await;

        assert_eq!(
            result,
            Some(OutboundResult::Deleted {
                correlation_id: CorrelationId::from("42")
            })
        );
        assert_eq!(
            result.unwrap().to_json().unwrap(),
            r#"{"type":"deleted","model_version_id":"42"}"#
        );
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_delete_numeric_correlation_id() {
        let ctx = setup();
        create_test_file(ctx.root(), "a.bin", b"x");

        let raw = br#"{"action":"delete","filename":"a.bin","model_version_id":7,"client_id":"desk-1"}"#;
        let result = ctx.dispatcher.handle(raw).await.unwrap();

        assert_eq!(
            result.to_json().unwrap(),
            r#"{"type":"deleted","model_version_id":7}"#
        );
    }

    #[tokio::test]
    async fn test_delete_with_subdirectory() {
        let ctx = setup();
        let file = create_test_file(ctx.root(), "LORA/style.safetensors", b"x");

        let raw = br#"{"action":"delete","filename":"style.safetensors","subdirectory":"LORA/","model_version_id":3}"#;
        assert!(ctx.dispatcher.handle(raw).await.is_some());
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_delete_missing_file_sends_nothing() {
        let ctx = setup();

        let raw = br#"{"action":"delete","filename":"models/gone.bin","model_version_id":"1"}"#;
        assert!(ctx.dispatcher.dispatch(raw).await.unwrap().is_none());
        assert!(ctx.dispatcher.handle(raw).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_traversal_rejected() {
        let ctx = setup();
        let victim = create_test_file(&ctx.outside(), "passwd", b"root:x:0:0");

        let filenames = [
            "../../outside/passwd",
            "../../../etc/passwd",
            "%2e%2e/%2e%2e/outside/passwd",
        ];
        for filename in filenames {
            let raw = format!(
                r#"{{"action":"delete","filename":"{}","model_version_id":"9"}}"#,
                filename
            );

            let result = ctx.dispatcher.dispatch(raw.as_bytes()).await;
            assert!(
                matches!(
                    result,
                    Err(DispatchError::Path {
                        source: PathError::PathTraversal(_),
                        ..
                    })
                ),
                "{} should be rejected",
                filename
            );
            assert!(ctx.dispatcher.handle(raw.as_bytes()).await.is_none());
        }

        assert!(victim.exists());
    }

    #[tokio::test]
    async fn test_delete_traversal_through_subdirectory_rejected() {
        let ctx = setup();
        let victim = create_test_file(&ctx.outside(), "a.bin", b"x");

        let raw = br#"{"action":"delete","filename":"a.bin","subdirectory":"../../outside","model_version_id":"9"}"#;
        assert!(ctx.dispatcher.handle(raw).await.is_none());
        assert!(victim.exists());
    }

    #[tokio::test]
    async fn test_delete_directory_rejected() {
        let ctx = setup();
        create_test_file(ctx.root(), "models/a.bin", b"x");

        let raw = br#"{"action":"delete","filename":"models","model_version_id":"5"}"#;
        let result = ctx.dispatcher.dispatch(raw).await;
        assert!(matches!(
            result,
            Err(DispatchError::Transfer {
                source: TransferError::IsADirectory(_),
                ..
            })
        ));
        assert!(ctx.root().join("models/a.bin").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_delete_symlink_removes_link_only() {
        let ctx = setup();
        let real = create_test_file(ctx.root(), "Checkpoint/real.bin", b"weights");
        let alias = ctx.root().join("Checkpoint/alias.bin");
        std::os::unix::fs::symlink(&real, &alias).unwrap();

        let raw = br#"{"action":"delete","filename":"alias.bin","subdirectory":"Checkpoint","model_version_id":9}"#;
        assert_eq!(
            ctx.dispatcher.handle(raw).await,
            Some(OutboundResult::Deleted {
                correlation_id: CorrelationId::from(9u64)
            })
        );

        assert!(fs::symlink_metadata(&alias).is_err());
        assert_eq!(fs::read(&real).unwrap(), b"weights");

        // A repeated delete is the ordinary missing-file case.
        assert!(ctx.dispatcher.handle(raw).await.is_none());
    }

    #[tokio::test]
    async fn test_download_traversal_rejected_before_fetch() {
        let ctx = setup();

        let raw = br#"{"action":"download","url":"/downloads/../../outside/x.bin","model_version_id":1}"#;
        let result = ctx.dispatcher.dispatch(raw).await;
        assert!(matches!(result, Err(DispatchError::Path { action: "download", .. })));
        assert!(listing(&ctx.outside()).is_empty());
        assert!(listing(ctx.root()).is_empty());
    }

    #[tokio::test]
    async fn test_download_absolute_url_traversal_rejected() {
        let ctx = setup();

        let raw = br#"{"action":"download","url":"http://127.0.0.1:9/downloads/../../outside/x.bin","model_version_id":1}"#;
        assert!(ctx.dispatcher.handle(raw).await.is_none());
        assert!(listing(&ctx.outside()).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_is_noop() {
        let ctx = setup();
        create_test_file(ctx.root(), "models/a.bin", b"x");
        let before = listing(ctx.root());

        let raw = br#"{"action":"rename","filename":"models/a.bin","model_version_id":"1"}"#;
        assert!(ctx.dispatcher.dispatch(raw).await.unwrap().is_none());
        assert!(ctx.dispatcher.handle(raw).await.is_none());

        assert_eq!(listing(ctx.root()), before);
        assert!(ctx.root().join("models/a.bin").exists());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_ignored() {
        let ctx = setup();

        let frames: [&[u8]; 4] = [b"not json", b"{}", br#"{"action":"delete"}"#, b"42"];
        for raw in frames {
            assert!(matches!(
                ctx.dispatcher.dispatch(raw).await,
                Err(DispatchError::Decode(_))
            ));
            assert!(ctx.dispatcher.handle(raw).await.is_none());
        }
    }

    #[test]
    fn test_join_subdirectory() {
        assert_eq!(join_subdirectory(None, "a.bin"), "a.bin");
        assert_eq!(join_subdirectory(Some(""), "a.bin"), "a.bin");
        assert_eq!(join_subdirectory(Some("LORA"), "a.bin"), "LORA/a.bin");
        assert_eq!(join_subdirectory(Some("LORA\\"), "a.bin"), "LORA/a.bin");
    }
}
