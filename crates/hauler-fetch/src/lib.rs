#![forbid(unsafe_code)]

//! Download executor for the Hauler orchestrator.
//!
//! The dispatcher hands this crate a direct URL and a target path and
//! never waits for the result; completion is observed by the progress
//! monitor through the filesystem. While a download is in flight a
//! sidecar control file (`<name>.haul`) sits next to the output,
//! carrying the running payload byte count, and is removed only on
//! clean completion. The sidecar — not the output length, which the
//! segmented path pre-allocates up front — is what the monitor reads
//! for progress.
//!
//! Large files with range support are pre-allocated and fetched in
//! parallel segments; everything else streams sequentially. Transient
//! failures retry with backoff, and an expired direct URL is refreshed
//! through the engine-supplied unlocker before the next attempt.

mod http;
mod progress;
mod segment;

pub use http::{HttpFetcher, HttpFetcherConfig};
pub use segment::{plan_ranges, ByteRange};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use hauler_core::CancelFlag;
use thiserror::Error;

/// One download handed over by the dispatcher.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Direct (already unlocked) URL.
    pub url: String,
    /// Directory the artifact lands in.
    pub dir: PathBuf,
    /// Validated safe filename.
    pub file_name: String,
    /// Expected size when known; used only for diagnostics.
    pub expected_size: Option<u64>,
    /// Range-parallelism for large files.
    pub segments: u32,
}

/// Result of a completed download.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Bytes written across all segments.
    pub bytes_written: u64,
    /// Final artifact path.
    pub path: PathBuf,
}

/// Download failures.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The cancel flag was observed at a chunk boundary.
    #[error("download canceled")]
    Canceled,
    /// Free space fell below the configured live guard.
    #[error("free space below the configured guard")]
    DiskFull,
    /// The direct URL expired mid-download.
    #[error("download link expired (http {0})")]
    ExpiredLink(u16),
    /// Temporary network or upstream failure.
    #[error("transient download failure: {0}")]
    Transient(String),
    /// Permanent upstream refusal.
    #[error("upstream returned http {0}")]
    Http(u16),
    /// Local filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::ExpiredLink(_) | Self::Io(_)
        )
    }

    /// Whether the failure indicates an expired unlock URL.
    #[must_use]
    pub const fn is_expired_link(&self) -> bool {
        matches!(self, Self::ExpiredLink(_))
    }
}

/// Callback for refreshing an expired direct URL between attempts.
#[async_trait]
pub trait UrlRefresh: Send + Sync {
    /// Produce a fresh direct URL, or `None` when re-unlocking failed.
    async fn refresh(&self) -> Option<String>;
}

/// Abstract download executor consumed by the dispatcher.
///
/// Implementations must write the artifact to `dir/file_name`, keep
/// the sidecar control file present for the whole transfer with the
/// running payload byte count recorded in it, observe the cancel flag
/// at chunk boundaries, and delete the sidecar only on clean
/// completion.
#[async_trait]
pub trait DownloadExecutor: Send + Sync {
    /// Run one download to completion or failure.
    async fn fetch(
        &self,
        request: FetchRequest,
        cancel: CancelFlag,
        refresh: Option<Arc<dyn UrlRefresh>>,
    ) -> Result<FetchOutcome, FetchError>;
}
