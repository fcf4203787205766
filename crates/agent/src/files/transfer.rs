//! Streaming downloads into, and removals from, the agent root.
//!
//! Downloads are written to disk as the response body arrives, in slices of
//! at most `chunk_size` bytes, so memory use does not grow with the size of
//! the object. Removals are idempotent: a missing file is reported as
//! [`RemoveOutcome::NotFound`] rather than as an error.

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;
use url::Url;

use super::resolver::ResolvedPath;

/// Errors that can occur during a transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The source locator uses a scheme other than http or https.
    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),

    /// The source locator cannot be turned into a URL.
    #[error("invalid source locator {locator}: {reason}")]
    InvalidSource { locator: String, reason: String },

    /// The object store answered with a non-success status.
    #[error("fetch of {url} failed with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    /// The request could not be sent or the body could not be read.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The target is a directory, which is never removed.
    #[error("path is a directory: {0}")]
    IsADirectory(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result of a removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The file existed and is gone now.
    Removed,
    /// Nothing was at the path.
    NotFound,
}

/// Counters collected while streaming a body to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Total bytes written.
    pub bytes_written: u64,
    /// Number of write calls issued.
    pub writes: u64,
    /// Size of the largest single write.
    pub largest_write: usize,
}

impl TransferStats {
    fn record(&mut self, len: usize) {
        self.bytes_written += len as u64;
        self.writes += 1;
        self.largest_write = self.largest_write.max(len);
    }
}

/// Derive the HTTP origin that relative locators are fetched from.
///
/// `wss` maps to `https` and `ws` to `http`; host and port are kept, the path
/// is reset to `/` and query, fragment and credentials are dropped.
pub fn http_base_for(endpoint: &Url) -> Result<Url, TransferError> {
    let scheme = match endpoint.scheme() {
        "wss" | "https" => "https",
        "ws" | "http" => "http",
        other => return Err(TransferError::UnsupportedScheme(other.to_string())),
    };

    let mut base = endpoint.clone();
    base.set_scheme(scheme)
        .map_err(|_| TransferError::UnsupportedScheme(endpoint.scheme().to_string()))?;
    base.set_path("/");
    base.set_query(None);
    base.set_fragment(None);
    let _ = base.set_username("");
    let _ = base.set_password(None);

    Ok(base)
}

/// Performs the filesystem side effects of commands.
#[derive(Debug, Clone)]
pub struct TransferExecutor {
    client: reqwest::Client,
    http_base: Url,
    chunk_size: usize,
}

impl TransferExecutor {
    /// Create an executor that resolves relative locators against the
    /// origin of `endpoint`.
    pub fn new(endpoint: &Url, chunk_size: usize) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("model-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            http_base: http_base_for(endpoint)?,
            chunk_size: chunk_size.max(1),
        })
    }

    /// Origin relative locators are joined onto.
    pub fn http_base(&self) -> &Url {
        &self.http_base
    }

    /// Turn a locator into the URL to fetch.
    ///
    /// Absolute `http(s)` URLs are used as they are. Anything else is taken as
    /// a path relative to the server origin.
    pub fn source_url(&self, locator: &str) -> Result<Url, TransferError> {
        match Url::parse(locator) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
            Ok(url) => Err(TransferError::UnsupportedScheme(url.scheme().to_string())),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                self.http_base
                    .join(locator)
                    .map_err(|e| TransferError::InvalidSource {
                        locator: locator.to_string(),
                        reason: e.to_string(),
                    })
            }
            Err(e) => Err(TransferError::InvalidSource {
                locator: locator.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Fetch `source` and stream it into `destination`.
    ///
    /// Missing parent directories are created first. An existing file is
    /// truncated once the server has answered with a success status. If the
    /// body fails part way the partially written file is left in place.
    pub async fn materialize(
        &self,
        source: &Url,
        destination: &ResolvedPath,
    ) -> Result<TransferStats, TransferError> {
        let path = destination.as_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self.client.get(source.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                url: source.to_string(),
                status,
            });
        }

        debug!(
            url = %source,
            destination = %destination,
            content_length = ?response.content_length(),
            "Streaming response body"
        );

        let mut file = tokio::fs::File::create(path).await?;
        write_stream(response.bytes_stream(), &mut file, self.chunk_size).await
    }

    /// Remove the single directory entry named by `target`.
    ///
    /// A symlink is unlinked itself, whatever it points to. Real directories
    /// are refused.
    pub async fn remove(&self, target: &ResolvedPath) -> Result<RemoveOutcome, TransferError> {
        let path = target.entry();

        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RemoveOutcome::NotFound),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            return Err(TransferError::IsADirectory(path.to_path_buf()));
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(RemoveOutcome::Removed),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RemoveOutcome::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

/// Copy a stream of byte buffers into `writer`, never writing more than
/// `chunk_size` bytes at once.
pub async fn write_stream<S, E, W>(
    stream: S,
    writer: &mut W,
    chunk_size: usize,
) -> Result<TransferStats, TransferError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<TransferError>,
    W: AsyncWrite + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let mut stats = TransferStats::default();

    futures_util::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let bytes = item.map_err(Into::into)?;
        for piece in bytes.chunks(chunk_size) {
            writer.write_all(piece).await?;
            stats.record(piece.len());
        }
    }
    writer.flush().await?;

    Ok(stats)
}
