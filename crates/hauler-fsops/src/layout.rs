//! Task directory layout and operator artifacts.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use hauler_core::is_control_file;
use serde_json::{Map, Value};
use uuid::Uuid;

const METADATA_FILE: &str = "metadata.json";
const LOG_FILE: &str = "logs.json";
const MAX_LOGGED_VALUE: usize = 200;

/// The resolved directories for one task.
#[derive(Debug, Clone)]
pub struct TaskDirs {
    /// `<root>/<task_id>`
    pub base: PathBuf,
    /// `<root>/<task_id>/files`
    pub files: PathBuf,
}

/// Create the task's directory tree and seed the operator artifacts.
///
/// Idempotent: existing directories and artifacts are left untouched.
///
/// # Errors
///
/// Returns an error if directories or seed files cannot be created.
pub fn ensure_task_dirs(root: &Path, task_id: Uuid) -> Result<TaskDirs> {
    let base = root.join(task_id.to_string());
    let files = base.join("files");
    fs::create_dir_all(&files)
        .with_context(|| format!("failed to create task directory {}", files.display()))?;
    for name in [METADATA_FILE, LOG_FILE] {
        let path = base.join(name);
        if !path.exists() {
            fs::write(&path, "{}\n")
                .with_context(|| format!("failed to seed {}", path.display()))?;
        }
    }
    Ok(TaskDirs { base, files })
}

/// Rewrite the task's `metadata.json`.
///
/// # Errors
///
/// Returns an error if serialisation or the write fails.
pub fn write_metadata(base: &Path, data: &Value) -> Result<()> {
    let path = base.join(METADATA_FILE);
    let rendered = serde_json::to_string_pretty(data).context("failed to render metadata")?;
    fs::write(&path, rendered)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Append one entry to the task's `logs.json`.
///
/// A `ts` field is added when absent and every string value is run
/// through [`sanitize_log_text`] so upstream-controlled text cannot
/// forge extra log lines.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened or written.
pub fn append_log(base: &Path, entry: &Value) -> Result<()> {
    let mut object: Map<String, Value> = match entry {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("message".to_owned(), other.clone());
            map
        }
    };
    object
        .entry("ts".to_owned())
        .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
    for value in object.values_mut() {
        if let Value::String(text) = value {
            *text = sanitize_log_text(text);
        }
    }

    let path = base.join(LOG_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let line = serde_json::to_string(&Value::Object(object)).context("failed to render log entry")?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}

/// Strip control characters and truncate over-long values before they
/// reach a log line.
#[must_use]
pub fn sanitize_log_text(value: &str) -> String {
    let mut cleaned: String = value
        .chars()
        .map(|c| if (c as u32) < 32 { ' ' } else { c })
        .collect();
    if cleaned.len() > MAX_LOGGED_VALUE {
        let mut cut = MAX_LOGGED_VALUE;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
        cleaned.push_str("...");
    }
    cleaned
}

/// Remove a task's directory tree, artifacts included.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be removed.
pub fn purge_task_files(root: &Path, task_id: Uuid) -> Result<()> {
    let base = root.join(task_id.to_string());
    if base.exists() {
        fs::remove_dir_all(&base)
            .with_context(|| format!("failed to purge {}", base.display()))?;
    }
    Ok(())
}

/// Janitor sweep: delete partial artifacts whose sidecar is older than
/// `max_age`, together with the sidecar itself.
///
/// Returns the number of partials removed. Unreadable entries are
/// skipped, not fatal.
///
/// # Errors
///
/// Returns an error only if the storage root cannot be listed.
pub fn purge_stale_partials(root: &Path, max_age: Duration) -> Result<u64> {
    let mut removed = 0;
    let entries = fs::read_dir(root)
        .with_context(|| format!("failed to list storage root {}", root.display()))?;
    let cutoff = SystemTime::now().checked_sub(max_age);
    for entry in entries.flatten() {
        let files_dir = entry.path().join("files");
        if !files_dir.is_dir() {
            continue;
        }
        let Ok(files) = fs::read_dir(&files_dir) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if !is_control_file(&path) {
                continue;
            }
            let stale = match (file.metadata().and_then(|m| m.modified()), cutoff) {
                (Ok(modified), Some(cutoff)) => modified < cutoff,
                _ => false,
            };
            if !stale {
                continue;
            }
            let artifact = path.with_extension("");
            if fs::remove_file(&path).is_ok() {
                let _ = fs::remove_file(&artifact);
                removed += 1;
                tracing::info!(path = %artifact.display(), "removed stale partial download");
            }
        }
    }
    Ok(removed)
}
