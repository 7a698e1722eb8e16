//! SQLite schema, applied at store initialisation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// Advisory mapping from a dedup identifier to a materialised share.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    /// The dedup identifier.
    pub identifier: String,
    /// Share directory name under the storage root.
    pub share_id: String,
    /// When the share was first recorded.
    pub first_seen_at: DateTime<Utc>,
}

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        label TEXT,
        mode TEXT NOT NULL,
        source_kind TEXT NOT NULL,
        source TEXT NOT NULL,
        identifier TEXT NOT NULL,
        provider TEXT NOT NULL,
        provider_ref TEXT,
        status TEXT NOT NULL DEFAULT 'queued',
        progress_pct INTEGER NOT NULL DEFAULT 0,
        owner TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_dedup ON tasks (identifier, source_kind)",
    "CREATE TABLE IF NOT EXISTS task_files (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
        file_index INTEGER NOT NULL,
        name TEXT NOT NULL,
        size_bytes INTEGER,
        state TEXT NOT NULL DEFAULT 'listed',
        bytes_downloaded INTEGER NOT NULL DEFAULT 0,
        local_path TEXT,
        locked_url TEXT,
        unlocked_url TEXT,
        UNIQUE (task_id, file_index)
    )",
    "CREATE INDEX IF NOT EXISTS idx_task_files_state ON task_files (state)",
    "CREATE TABLE IF NOT EXISTS task_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
        ts TEXT NOT NULL,
        level TEXT NOT NULL,
        event TEXT NOT NULL,
        payload TEXT
    )",
    "CREATE TABLE IF NOT EXISTS dedup_index (
        identifier TEXT PRIMARY KEY,
        share_id TEXT NOT NULL,
        first_seen_at TEXT NOT NULL
    )",
];

/// Create all tables and indexes if they do not exist yet.
pub(crate) async fn apply(pool: &SqlitePool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to apply schema statement")?;
    }
    Ok(())
}
