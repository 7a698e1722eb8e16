//! Storage layout and filesystem helpers for the Hauler orchestrator.
//!
//! Each task owns a directory under the storage root:
//!
//! ```text
//! <root>/<task_id>/files/<name>        artifacts (plus .haul sidecars)
//! <root>/<task_id>/metadata.json       single JSON document
//! <root>/<task_id>/logs.json           append-only JSON lines
//! ```
//!
//! `metadata.json` and `logs.json` are operator-facing artifacts,
//! deliberately separate from the live event stream. This crate also
//! hosts the disk free-space probe and the janitor sweeps.

mod disk;
mod layout;

pub use disk::{dir_writable, disk_free_bytes};
pub use layout::{
    append_log, ensure_task_dirs, purge_stale_partials, purge_task_files, sanitize_log_text,
    write_metadata, TaskDirs,
};
