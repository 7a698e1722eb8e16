#![forbid(unsafe_code)]

//! Provider capability interface for the Hauler orchestrator.
//!
//! The resolver and dispatcher only ever see the [`ProviderClient`]
//! trait: upload a source, poll its status, unlock a locked URL. The
//! concrete debrid adapter normalises the provider's divergent
//! response shapes into [`ProviderPoll`] at this boundary, so the rest
//! of the system never touches raw provider payloads.

mod debrid;
mod rate_limit;

pub use debrid::{DebridClient, DebridConfig};
pub use rate_limit::RateLimiter;

use async_trait::async_trait;
use thiserror::Error;

/// One normalised manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFile {
    /// Filename as reported by the provider (not yet sanitised).
    pub name: String,
    /// Size in bytes; 0 when the provider does not report one.
    pub size: u64,
    /// Locked URL requiring an unlock round-trip, when present.
    pub locked_url: Option<String>,
}

/// Result of one status poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderPoll {
    /// Manifest entries; empty until the provider has them.
    pub files: Vec<ProviderFile>,
    /// Terminal failure reported by the provider, if any.
    pub terminal_error: Option<String>,
}

/// Provider call failures.
///
/// Anything not explicitly terminal is retriable: the resolver keeps
/// polling and the task stays in `resolving`.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network glitch, rate limit, or temporary upstream error.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// The provider reported an unrecoverable condition.
    #[error("terminal provider error: {0}")]
    Terminal(String),
}

impl ProviderError {
    /// Whether the caller may retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Opaque debrid capability consumed by the resolver and dispatcher.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Submit a magnet or link, receiving an opaque provider reference.
    ///
    /// The reference is persisted so a crashed resolver resumes
    /// without re-uploading.
    async fn upload(&self, source: &str) -> Result<String, ProviderError>;

    /// One status poll for a previously uploaded source.
    async fn status(&self, provider_ref: &str) -> Result<ProviderPoll, ProviderError>;

    /// Resolve a locked manifest entry to a time-limited direct URL.
    async fn unlock(&self, locked_url: &str) -> Result<String, ProviderError>;

    /// Opaque tag recorded on tasks handled by this provider.
    fn name(&self) -> &str {
        "debrid"
    }
}
