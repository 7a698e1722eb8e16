//! Source validation and dedup identifier derivation.
//!
//! A source is either a magnet URI or a direct HTTP(S) link. Magnets
//! yield their infohash (40-hex preferred, base32 accepted); links
//! yield a SHA-256 digest of the normalised URL. Both forms are stable
//! across resubmissions of the same source.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::task::SourceKind;

/// Upper bound on the raw source string.
pub const MAX_SOURCE_LENGTH: usize = 10_000;
/// Upper bound on a direct link.
pub const MAX_URL_LENGTH: usize = 2_048;
/// Upper bound on a task label.
pub const MAX_LABEL_LENGTH: usize = 500;

static BTIH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)btih:([0-9A-Fa-f]{40}|[A-Za-z2-7]{32})").expect("btih pattern is valid")
});

/// Why a submitted source was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Empty or whitespace-only input.
    #[error("source is required")]
    Empty,
    /// Input exceeded the configured maximum length.
    #[error("source exceeds {MAX_SOURCE_LENGTH} characters")]
    TooLong,
    /// A magnet URI without a usable `xt=urn:btih:` parameter.
    #[error("magnet link is missing a valid info hash")]
    MissingInfohash,
    /// A link exceeding the URL length bound.
    #[error("url exceeds {MAX_URL_LENGTH} characters")]
    UrlTooLong,
    /// A link carrying CR/LF/NUL, which would corrupt logs or headers.
    #[error("url contains control characters")]
    UrlControlCharacters,
    /// Neither a magnet URI nor an http(s) link.
    #[error("source must be a magnet link or an http(s) url")]
    UnsupportedScheme,
}

/// A validated source with its derived dedup identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSource {
    /// The trimmed source string as it will be stored.
    pub source: String,
    /// Magnet or link.
    pub kind: SourceKind,
    /// Stable dedup identifier.
    pub identifier: String,
}

/// Validate a raw submission and derive its identifier.
///
/// # Errors
///
/// Returns a [`SourceError`] describing the first validation failure;
/// nothing is mutated on rejection.
pub fn parse_source(raw: &str) -> Result<ParsedSource, SourceError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SourceError::Empty);
    }
    if trimmed.len() > MAX_SOURCE_LENGTH {
        return Err(SourceError::TooLong);
    }

    if trimmed.starts_with("magnet:") {
        let identifier = magnet_infohash(trimmed).ok_or(SourceError::MissingInfohash)?;
        return Ok(ParsedSource {
            source: trimmed.to_owned(),
            kind: SourceKind::Magnet,
            identifier,
        });
    }

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        if trimmed.len() > MAX_URL_LENGTH {
            return Err(SourceError::UrlTooLong);
        }
        if trimmed.chars().any(|c| c == '\r' || c == '\n' || c == '\0') {
            return Err(SourceError::UrlControlCharacters);
        }
        return Ok(ParsedSource {
            source: trimmed.to_owned(),
            kind: SourceKind::Link,
            identifier: link_identifier(trimmed),
        });
    }

    Err(SourceError::UnsupportedScheme)
}

/// Extract the BitTorrent infohash from a magnet URI, lowercased.
///
/// Accepts the 40-hex SHA-1 form and the 32-character base32 form.
#[must_use]
pub fn magnet_infohash(magnet: &str) -> Option<String> {
    let captures = BTIH_RE.captures(magnet)?;
    let hash = captures.get(1)?.as_str();
    Some(hash.to_ascii_lowercase())
}

/// Derive the stable identifier for a direct link.
///
/// The URL is trimmed and lowercased before hashing so trivially
/// different spellings of the same link dedup together.
#[must_use]
pub fn link_identifier(url: &str) -> String {
    let normalized = url.trim().to_ascii_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}

/// Derive a fresh random identifier for a direct upload.
#[must_use]
pub fn upload_identifier() -> String {
    Uuid::new_v4().simple().to_string()
}
