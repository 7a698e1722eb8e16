#![forbid(unsafe_code)]

//! Shared domain types for the Hauler download orchestrator.
//!
//! This crate defines the task and file state machines, source parsing
//! and identifier derivation, safe-filename validation, and the small
//! primitives (cancel flags, sidecar paths) shared by the store, the
//! worker loops, and the download executor.

mod cancel;
mod filename;
mod sidecar;
mod source;
mod task;

pub use cancel::CancelFlag;
pub use filename::{sanitize_file_name, tag_file_name, validate_file_name, NameError};
pub use sidecar::{control_path, is_control_file, read_progress, CONTROL_FILE_SUFFIX};
pub use source::{
    link_identifier, magnet_infohash, parse_source, upload_identifier, ParsedSource, SourceError,
    MAX_LABEL_LENGTH, MAX_SOURCE_LENGTH, MAX_URL_LENGTH,
};
pub use task::{
    EventLevel, FileState, NewTaskFile, SourceKind, TaskDetail, TaskFileRecord, TaskMode,
    TaskRecord, TaskStatus,
};
