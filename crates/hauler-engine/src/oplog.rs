//! Best-effort operator log lines.
//!
//! Worker loops mirror their lifecycle milestones into the per-task
//! `logs.json` artifact. Failures here are never allowed to disturb
//! the loops themselves.

use std::path::Path;

use tracing::debug;
use uuid::Uuid;

pub(crate) fn oplog(root: &Path, task_id: Uuid, entry: serde_json::Value) {
    let result = hauler_fsops::ensure_task_dirs(root, task_id)
        .and_then(|dirs| hauler_fsops::append_log(&dirs.base, &entry));
    if let Err(err) = result {
        debug!(task_id = %task_id, error = %err, "operator log write failed");
    }
}
