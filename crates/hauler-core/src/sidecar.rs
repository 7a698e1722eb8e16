//! Sidecar control files.
//!
//! While the executor is writing `files/<name>`, a marker
//! `files/<name>.haul` sits next to it. Its presence is the contract
//! between the executor and the progress monitor: the artifact is
//! complete only once the output exists and the marker is gone. The
//! marker also doubles as the progress channel — the executor keeps
//! the running payload byte count in it as ASCII digits, so a
//! pre-allocated output file is never mistaken for downloaded bytes.
//! The marker is removed on clean completion and deliberately left
//! behind on failure or cancellation so partials are recognisable.

use std::path::{Path, PathBuf};

/// Extension appended to an output path to form its control file.
pub const CONTROL_FILE_SUFFIX: &str = "haul";

/// The control-file path for a given output path.
#[must_use]
pub fn control_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".");
    name.push(CONTROL_FILE_SUFFIX);
    PathBuf::from(name)
}

/// Whether a directory entry is a control file rather than an artifact.
#[must_use]
pub fn is_control_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == CONTROL_FILE_SUFFIX)
}

/// Read the running byte count recorded in a control file.
///
/// Returns `None` when the file is unreadable or caught mid-rewrite;
/// callers skip that sample and pick up the next one.
#[must_use]
pub fn read_progress(control: &Path) -> Option<u64> {
    let raw = std::fs::read_to_string(control).ok()?;
    raw.trim().parse().ok()
}
