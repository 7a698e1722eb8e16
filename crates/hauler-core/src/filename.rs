//! Safe-filename validation for provider-reported names.
//!
//! Manifest names come from an untrusted upstream and end up joined
//! onto the storage root, so anything that could escape the task's
//! `files/` directory is rejected or rewritten here.

use thiserror::Error;

/// Filesystem limit for a single path component.
pub const MAX_FILENAME_LENGTH: usize = 255;

const RESERVED_NAMES: &[&str] = &[
    ".", "..", "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
    "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Why a filename was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    /// Empty name.
    #[error("file name is required")]
    Empty,
    /// Longer than [`MAX_FILENAME_LENGTH`].
    #[error("file name exceeds {MAX_FILENAME_LENGTH} characters")]
    TooLong,
    /// Contains `/` or `\`.
    #[error("file name cannot contain path separators")]
    PathSeparator,
    /// Contains NUL or another control character.
    #[error("file name contains control characters")]
    ControlCharacters,
    /// Matches a reserved device or traversal name.
    #[error("reserved file name")]
    Reserved,
}

/// Validate a filename, returning it unchanged when acceptable.
///
/// # Errors
///
/// Returns a [`NameError`] describing the first violation.
pub fn validate_file_name(name: &str) -> Result<&str, NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_FILENAME_LENGTH {
        return Err(NameError::TooLong);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(NameError::PathSeparator);
    }
    if name.chars().any(|c| (c as u32) < 32 || c == '\0') {
        return Err(NameError::ControlCharacters);
    }
    let upper = name.to_ascii_uppercase();
    if RESERVED_NAMES.contains(&upper.as_str()) {
        return Err(NameError::Reserved);
    }
    Ok(name)
}

/// Insert the manifest index before the extension, keeping the name
/// recognisable: `movie.mkv` at index 3 becomes `movie.3.mkv`.
///
/// Sanitising can fold two distinct manifest entries onto the same
/// name (`a/b.mkv` and `a_b.mkv` both come out as `a_b.mkv`); callers
/// tag colliding names so every manifest index keeps its own artifact
/// path.
#[must_use]
pub fn tag_file_name(name: &str, index: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{index}.{ext}"),
        _ => format!("{name}.{index}"),
    }
}

/// Rewrite an untrusted manifest name into an acceptable one.
///
/// Separators and control characters become underscores; reserved or
/// empty results fall back to `file_<index>`.
#[must_use]
pub fn sanitize_file_name(name: &str, index: u32) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || (c as u32) < 32 {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim().to_owned();
    let mut candidate = if cleaned.is_empty() {
        format!("file_{index}")
    } else {
        cleaned
    };
    if candidate.len() > MAX_FILENAME_LENGTH {
        candidate.truncate(MAX_FILENAME_LENGTH);
    }
    if validate_file_name(&candidate).is_err() {
        return format!("file_{index}");
    }
    candidate
}
