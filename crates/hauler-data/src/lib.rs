#![forbid(unsafe_code)]

//! Durable task store for the Hauler orchestrator.
//!
//! The store owns the relational record of tasks, files, the per-task
//! event log, and the dedup index. Every mutation is transactional at
//! the level of a single task, enforces the state machines defined in
//! `hauler-core`, and publishes the corresponding event on the bus
//! *after* the write commits. Store reads are the source of truth; the
//! stream is advisory.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hauler_core::{
    EventLevel, FileState, NewTaskFile, SourceKind, TaskDetail, TaskFileRecord, TaskMode,
    TaskRecord, TaskStatus,
};
use hauler_events::{Event, EventBus, ListedFile};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

mod schema;

pub use schema::DedupEntry;

/// Input for creating a task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Optional human label.
    pub label: Option<String>,
    /// Auto or select mode.
    pub mode: TaskMode,
    /// What kind of source this is.
    pub source_kind: SourceKind,
    /// The raw submitted source.
    pub source: String,
    /// Stable dedup identifier.
    pub identifier: String,
    /// Opaque provider tag.
    pub provider: String,
    /// Optional owner reference.
    pub owner: Option<String>,
}

/// Database-backed repository for task lifecycle state.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
    events: EventBus,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore").finish_non_exhaustive()
    }
}

impl TaskStore {
    /// Open (or create) the store at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn connect(path: &Path, events: EventBus) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open task database {}", path.display()))?;
        schema::apply(&pool).await?;
        Ok(Self { pool, events })
    }

    /// In-memory store for tests and ephemeral runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub async fn in_memory(events: EventBus) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("failed to parse in-memory sqlite url")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory task database")?;
        schema::apply(&pool).await?;
        Ok(Self { pool, events })
    }

    /// Access the event bus this store publishes on.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Insert a new task in `queued` state and publish a `hello` event.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn create_task(&self, new: NewTask) -> Result<TaskRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO tasks (id, label, mode, source_kind, source, identifier, provider, \
             provider_ref, status, progress_pct, owner, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, NULL, 'queued', 0, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&new.label)
        .bind(new.mode.as_str())
        .bind(new.source_kind.as_str())
        .bind(&new.source)
        .bind(&new.identifier)
        .bind(&new.provider)
        .bind(&new.owner)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to insert task")?;

        let record = TaskRecord {
            id,
            label: new.label,
            mode: new.mode,
            source_kind: new.source_kind,
            source: new.source,
            identifier: new.identifier,
            provider: new.provider,
            provider_ref: None,
            status: TaskStatus::Queued,
            progress_pct: 0,
            owner: new.owner,
            created_at: now,
            updated_at: now,
        };
        self.events.publish(Event::Hello {
            task_id: id,
            mode: record.mode,
            status: record.status,
        });
        Ok(record)
    }

    /// Fetch a task by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to load task")?;
        row.map(|row| task_from_row(&row)).transpose()
    }

    /// Fetch a task together with its files, ordered by index.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails or a row cannot be decoded.
    pub async fn get_detail(&self, id: Uuid) -> Result<Option<TaskDetail>> {
        let Some(task) = self.get_task(id).await? else {
            return Ok(None);
        };
        let files = self.files_for_task(id).await?;
        Ok(Some(TaskDetail { task, files }))
    }

    /// List tasks, newest first, optionally filtered by status.
    ///
    /// Returns the page plus the total row count for the filter.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails or a row cannot be decoded.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<TaskRecord>, u64)> {
        let (rows, total) = if let Some(status) = status {
            let rows = sqlx::query(
                "SELECT * FROM tasks WHERE status = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
            )
            .bind(status.as_str())
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await
            .context("failed to list tasks")?;
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .context("failed to count tasks")?;
            (rows, total)
        } else {
            let rows =
                sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC LIMIT ? OFFSET ?")
                    .bind(i64::from(limit))
                    .bind(i64::from(offset))
                    .fetch_all(&self.pool)
                    .await
                    .context("failed to list tasks")?;
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
                .fetch_one(&self.pool)
                .await
                .context("failed to count tasks")?;
            (rows, total)
        };
        let tasks = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((tasks, u64::try_from(total).unwrap_or_default()))
    }

    /// Tasks currently in any of `statuses`, oldest first (FIFO).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn tasks_in_status(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>> {
        let mut tasks = Vec::new();
        for status in statuses {
            let rows =
                sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await
                    .context("failed to load tasks by status")?;
            for row in &rows {
                tasks.push(task_from_row(row)?);
            }
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    /// Find a task matching the dedup key in one of `statuses`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn find_by_dedup_key(
        &self,
        identifier: &str,
        kind: SourceKind,
        statuses: &[TaskStatus],
    ) -> Result<Option<TaskRecord>> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM tasks WHERE identifier = ? AND source_kind = ? \
             AND status IN ({placeholders}) ORDER BY created_at DESC LIMIT 1"
        );
        let mut query = sqlx::query(&sql).bind(identifier).bind(kind.as_str());
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let row = query
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up dedup key")?;
        row.map(|row| task_from_row(&row)).transpose()
    }

    /// Transition a task to `next`, enforcing the state machine, and
    /// publish the corresponding `state` event.
    ///
    /// The update is conditional on the status read inside the same
    /// transaction, so concurrent workers cannot race a task through
    /// two conflicting transitions.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tasks, illegal transitions, or
    /// query failures.
    pub async fn update_status(
        &self,
        id: Uuid,
        next: TaskStatus,
        reason: Option<&str>,
    ) -> Result<TaskRecord> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let row = sqlx::query("SELECT status FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context("failed to read task status")?;
        let Some(row) = row else {
            bail!("task {id} not found");
        };
        let current_raw: String = row.try_get("status")?;
        let current = TaskStatus::parse(&current_raw)
            .with_context(|| format!("unknown stored status '{current_raw}'"))?;
        if current == next {
            tx.rollback().await.ok();
            return self
                .get_task(id)
                .await?
                .with_context(|| format!("task {id} disappeared"));
        }
        if !current.can_transition(next) {
            bail!(
                "illegal task transition {} -> {} for task {id}",
                current.as_str(),
                next.as_str()
            );
        }
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(now)
        .bind(id.to_string())
        .bind(current.as_str())
        .execute(&mut *tx)
        .await
        .context("failed to update task status")?;
        if updated.rows_affected() != 1 {
            bail!("task {id} was modified concurrently");
        }
        insert_event(
            &mut tx,
            id,
            EventLevel::Info,
            "status",
            &serde_json::json!({ "status": next.as_str(), "reason": reason }),
        )
        .await?;
        tx.commit().await.context("failed to commit status update")?;

        self.events.publish(Event::State {
            task_id: id,
            status: next,
            reason: reason.map(str::to_owned),
        });
        self.get_task(id)
            .await?
            .with_context(|| format!("task {id} disappeared"))
    }

    /// Persist the provider-side reference after a successful upload.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_provider_ref(&self, id: Uuid, provider_ref: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET provider_ref = ?, updated_at = ? WHERE id = ?")
            .bind(provider_ref)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to persist provider ref")?;
        Ok(())
    }

    /// Delete a task row (files and events cascade).
    ///
    /// Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_task(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to delete task")?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Insert manifest entries as task files in `listed` state and
    /// publish `files.listed`.
    ///
    /// Idempotent on `(task_id, index)`: re-resolving a task after a
    /// crash does not duplicate rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn insert_files(
        &self,
        task_id: Uuid,
        files: &[NewTaskFile],
    ) -> Result<Vec<TaskFileRecord>> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        for file in files {
            sqlx::query(
                "INSERT INTO task_files (id, task_id, file_index, name, size_bytes, state, \
                 bytes_downloaded, locked_url) VALUES (?, ?, ?, ?, ?, 'listed', 0, ?) \
                 ON CONFLICT(task_id, file_index) DO NOTHING",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(task_id.to_string())
            .bind(i64::from(file.index))
            .bind(&file.name)
            .bind(file.size_bytes.map(clamp_i64))
            .bind(&file.locked_url)
            .execute(&mut *tx)
            .await
            .context("failed to insert task file")?;
        }
        insert_event(
            &mut tx,
            task_id,
            EventLevel::Info,
            "files_listed",
            &serde_json::json!({ "count": files.len() }),
        )
        .await?;
        tx.commit().await.context("failed to commit file manifest")?;

        let records = self.files_for_task(task_id).await?;
        self.events.publish(Event::FilesListed {
            task_id,
            files: records
                .iter()
                .map(|f| ListedFile {
                    file_id: f.id,
                    index: f.index,
                    name: f.name.clone(),
                    size: f.size_bytes,
                    state: f.state,
                })
                .collect(),
        });
        Ok(records)
    }

    /// Insert a single already-materialised file (direct uploads
    /// bypass the provider entirely) and publish the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_completed_file(
        &self,
        task_id: Uuid,
        name: &str,
        size_bytes: u64,
        local_path: &str,
    ) -> Result<TaskFileRecord> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO task_files (id, task_id, file_index, name, size_bytes, state, \
             bytes_downloaded, local_path) VALUES (?, ?, 0, ?, ?, 'done', ?, ?)",
        )
        .bind(id.to_string())
        .bind(task_id.to_string())
        .bind(name)
        .bind(clamp_i64(size_bytes))
        .bind(clamp_i64(size_bytes))
        .bind(local_path)
        .execute(&self.pool)
        .await
        .context("failed to insert uploaded file")?;
        self.recompute_progress(task_id).await?;

        let record = TaskFileRecord {
            id,
            task_id,
            index: 0,
            name: name.to_owned(),
            size_bytes: Some(size_bytes),
            state: FileState::Done,
            bytes_downloaded: size_bytes,
            local_path: Some(local_path.to_owned()),
            locked_url: None,
            unlocked_url: None,
        };
        self.events.publish(Event::FilesListed {
            task_id,
            files: vec![ListedFile {
                file_id: record.id,
                index: 0,
                name: record.name.clone(),
                size: record.size_bytes,
                state: record.state,
            }],
        });
        Ok(record)
    }

    /// All files of a task, ordered by manifest index.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn files_for_task(&self, task_id: Uuid) -> Result<Vec<TaskFileRecord>> {
        let rows = sqlx::query("SELECT * FROM task_files WHERE task_id = ? ORDER BY file_index")
            .bind(task_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("failed to load task files")?;
        rows.iter().map(file_from_row).collect()
    }

    /// Every file currently in `downloading` state, across all tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn files_downloading(&self) -> Result<Vec<TaskFileRecord>> {
        let rows = sqlx::query("SELECT * FROM task_files WHERE state = 'downloading'")
            .fetch_all(&self.pool)
            .await
            .context("failed to load downloading files")?;
        rows.iter().map(file_from_row).collect()
    }

    /// Count of files in `downloading` state across all tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn global_downloading_count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM task_files WHERE state = 'downloading'")
                .fetch_one(&self.pool)
                .await
                .context("failed to count downloading files")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Flip every `listed` file of a task to `selected` (auto mode).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn select_all_files(&self, task_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE task_files SET state = 'selected' WHERE task_id = ? AND state = 'listed'")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to select files")?;
        Ok(())
    }

    /// Apply an explicit selection: chosen files become `selected`,
    /// unchosen `listed` rows are dropped, and the task moves
    /// `waiting_selection -> downloading`.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is not waiting for selection, no
    /// chosen id matches, or the transaction fails.
    pub async fn apply_selection(&self, task_id: Uuid, file_ids: &[Uuid]) -> Result<TaskStatus> {
        let chosen: HashSet<Uuid> = file_ids.iter().copied().collect();
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        let row = sqlx::query("SELECT status FROM tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context("failed to read task status")?;
        let Some(row) = row else {
            bail!("task {task_id} not found");
        };
        let status_raw: String = row.try_get("status")?;
        if TaskStatus::parse(&status_raw) != Some(TaskStatus::WaitingSelection) {
            bail!("task {task_id} is not waiting for selection");
        }

        let rows = sqlx::query("SELECT id FROM task_files WHERE task_id = ? AND state = 'listed'")
            .bind(task_id.to_string())
            .fetch_all(&mut *tx)
            .await
            .context("failed to load listed files")?;
        let mut matched = 0_usize;
        for row in &rows {
            let raw: String = row.try_get("id")?;
            let file_id = Uuid::parse_str(&raw).context("malformed file id in store")?;
            if chosen.contains(&file_id) {
                sqlx::query("UPDATE task_files SET state = 'selected' WHERE id = ?")
                    .bind(raw)
                    .execute(&mut *tx)
                    .await
                    .context("failed to mark file selected")?;
                matched += 1;
            } else {
                sqlx::query("DELETE FROM task_files WHERE id = ?")
                    .bind(raw)
                    .execute(&mut *tx)
                    .await
                    .context("failed to drop unselected file")?;
            }
        }
        if matched == 0 {
            bail!("selection for task {task_id} matched no listed files");
        }

        let now = Utc::now();
        sqlx::query("UPDATE tasks SET status = 'downloading', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await
            .context("failed to mark task downloading")?;
        insert_event(
            &mut tx,
            task_id,
            EventLevel::Info,
            "selection_made",
            &serde_json::json!({ "count": matched }),
        )
        .await?;
        tx.commit().await.context("failed to commit selection")?;

        self.events.publish(Event::State {
            task_id,
            status: TaskStatus::Downloading,
            reason: None,
        });
        Ok(TaskStatus::Downloading)
    }

    /// Transition a file `selected -> downloading` and persist the
    /// unlocked URL; publishes `file.state`.
    ///
    /// # Errors
    ///
    /// Returns an error for illegal transitions or query failures.
    pub async fn start_file(&self, file: &TaskFileRecord, unlocked_url: &str) -> Result<()> {
        self.transition_file(file, FileState::Downloading, Some(unlocked_url), None)
            .await?;
        self.events.publish(Event::FileState {
            task_id: file.task_id,
            file_id: file.id,
            state: FileState::Downloading,
        });
        Ok(())
    }

    /// Mark a file failed with a reason; publishes `file.failed`.
    ///
    /// # Errors
    ///
    /// Returns an error for illegal transitions or query failures.
    pub async fn fail_file(&self, file: &TaskFileRecord, reason: &str) -> Result<()> {
        self.transition_file(file, FileState::Failed, None, None).await?;
        self.append_event(
            file.task_id,
            EventLevel::Error,
            "file_failed",
            &serde_json::json!({ "fileId": file.id, "reason": reason }),
        )
        .await?;
        self.events.publish(Event::FileFailed {
            task_id: file.task_id,
            file_id: file.id,
            reason: reason.to_owned(),
        });
        Ok(())
    }

    /// Mark a file done with its final path and observed size;
    /// publishes `file.done`. Only the progress monitor calls this.
    ///
    /// # Errors
    ///
    /// Returns an error for illegal transitions or query failures.
    pub async fn complete_file(
        &self,
        file: &TaskFileRecord,
        local_path: &str,
        bytes: u64,
    ) -> Result<()> {
        self.transition_file(file, FileState::Done, None, Some((local_path, bytes)))
            .await?;
        self.recompute_progress(file.task_id).await?;
        self.events.publish(Event::FileDone {
            task_id: file.task_id,
            file_id: file.id,
            local_path: local_path.to_owned(),
        });
        Ok(())
    }

    /// Record an observed byte count for an in-flight file and publish
    /// `file.progress`.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub async fn update_file_progress(&self, file: &TaskFileRecord, bytes: u64) -> Result<()> {
        sqlx::query("UPDATE task_files SET bytes_downloaded = ? WHERE id = ?")
            .bind(clamp_i64(bytes))
            .bind(file.id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to update file progress")?;
        self.recompute_progress(file.task_id).await?;
        self.events.publish(Event::FileProgress {
            task_id: file.task_id,
            file_id: file.id,
            bytes_downloaded: bytes,
            total: file.size_bytes.unwrap_or(0),
        });
        Ok(())
    }

    async fn transition_file(
        &self,
        file: &TaskFileRecord,
        next: FileState,
        unlocked_url: Option<&str>,
        done: Option<(&str, u64)>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let row = sqlx::query("SELECT state FROM task_files WHERE id = ?")
            .bind(file.id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context("failed to read file state")?;
        let Some(row) = row else {
            bail!("file {} not found", file.id);
        };
        let current_raw: String = row.try_get("state")?;
        let current = FileState::parse(&current_raw)
            .with_context(|| format!("unknown stored file state '{current_raw}'"))?;
        if !current.can_transition(next) {
            bail!(
                "illegal file transition {} -> {} for file {}",
                current.as_str(),
                next.as_str(),
                file.id
            );
        }
        if let Some(url) = unlocked_url {
            sqlx::query("UPDATE task_files SET state = ?, unlocked_url = ? WHERE id = ?")
                .bind(next.as_str())
                .bind(url)
                .bind(file.id.to_string())
                .execute(&mut *tx)
                .await
                .context("failed to transition file")?;
        } else if let Some((path, bytes)) = done {
            sqlx::query(
                "UPDATE task_files SET state = ?, local_path = ?, bytes_downloaded = ? WHERE id = ?",
            )
            .bind(next.as_str())
            .bind(path)
            .bind(clamp_i64(bytes))
            .bind(file.id.to_string())
            .execute(&mut *tx)
            .await
            .context("failed to transition file")?;
        } else {
            sqlx::query("UPDATE task_files SET state = ? WHERE id = ?")
                .bind(next.as_str())
                .bind(file.id.to_string())
                .execute(&mut *tx)
                .await
                .context("failed to transition file")?;
        }
        sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(file.task_id.to_string())
            .execute(&mut *tx)
            .await
            .context("failed to touch task")?;
        tx.commit().await.context("failed to commit file transition")
    }

    async fn recompute_progress(&self, task_id: Uuid) -> Result<()> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(bytes_downloaded), 0) AS have, \
             COALESCE(SUM(size_bytes), 0) AS want \
             FROM task_files WHERE task_id = ?",
        )
        .bind(task_id.to_string())
        .fetch_one(&self.pool)
        .await
        .context("failed to aggregate task progress")?;
        let have: i64 = row.try_get("have")?;
        let want: i64 = row.try_get("want")?;
        let pct = if want > 0 {
            ((have.saturating_mul(100)) / want).clamp(0, 100)
        } else {
            0
        };
        sqlx::query("UPDATE tasks SET progress_pct = ? WHERE id = ?")
            .bind(pct)
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to store task progress")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reservation queries
    // ------------------------------------------------------------------

    /// Bytes still to download for one task's reserving files.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn reserved_bytes_for(&self, task_id: Uuid) -> Result<u64> {
        let sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(MAX(size_bytes - bytes_downloaded, 0)), 0) FROM task_files \
             WHERE task_id = ? AND size_bytes IS NOT NULL \
             AND state IN ('listed', 'selected', 'downloading')",
        )
        .bind(task_id.to_string())
        .fetch_one(&self.pool)
        .await
        .context("failed to sum reserved bytes")?;
        Ok(u64::try_from(sum).unwrap_or_default())
    }

    /// Bytes still to download across every other task.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn reserved_bytes_excluding(&self, task_id: Uuid) -> Result<u64> {
        let sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(MAX(size_bytes - bytes_downloaded, 0)), 0) FROM task_files \
             WHERE task_id != ? AND size_bytes IS NOT NULL \
             AND state IN ('listed', 'selected', 'downloading')",
        )
        .bind(task_id.to_string())
        .fetch_one(&self.pool)
        .await
        .context("failed to sum global reserved bytes")?;
        Ok(u64::try_from(sum).unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // Event log and dedup index
    // ------------------------------------------------------------------

    /// Append a diagnostic record to the task's event log.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn append_event(
        &self,
        task_id: Uuid,
        level: EventLevel,
        event: &str,
        payload: &Value,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        insert_event(&mut tx, task_id, level, event, payload).await?;
        tx.commit().await.context("failed to commit event")
    }

    /// Recent event-log records for a task, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn events_for_task(&self, task_id: Uuid, limit: u32) -> Result<Vec<Value>> {
        let rows = sqlx::query(
            "SELECT ts, level, event, payload FROM task_events WHERE task_id = ? \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(task_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("failed to load task events")?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let ts: DateTime<Utc> = row.try_get("ts")?;
            let level: String = row.try_get("level")?;
            let event: String = row.try_get("event")?;
            let payload: Option<String> = row.try_get("payload")?;
            let payload = payload
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null);
            out.push(serde_json::json!({
                "ts": ts.to_rfc3339(),
                "level": level,
                "event": event,
                "payload": payload,
            }));
        }
        Ok(out)
    }

    /// Look up the dedup index.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn dedup_lookup(&self, identifier: &str) -> Result<Option<DedupEntry>> {
        let row = sqlx::query("SELECT * FROM dedup_index WHERE identifier = ?")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await
            .context("failed to query dedup index")?;
        row.map(|row| {
            Ok(DedupEntry {
                identifier: row.try_get("identifier")?,
                share_id: row.try_get("share_id")?,
                first_seen_at: row.try_get("first_seen_at")?,
            })
        })
        .transpose()
    }

    /// Record (or refresh) a dedup entry for a materialised share.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn dedup_record(&self, identifier: &str, share_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO dedup_index (identifier, share_id, first_seen_at) VALUES (?, ?, ?) \
             ON CONFLICT(identifier) DO UPDATE SET share_id = excluded.share_id",
        )
        .bind(identifier)
        .bind(share_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to record dedup entry")?;
        Ok(())
    }
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    task_id: Uuid,
    level: EventLevel,
    event: &str,
    payload: &Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_events (task_id, ts, level, event, payload) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(task_id.to_string())
    .bind(Utc::now())
    .bind(level.as_str())
    .bind(event)
    .bind(payload.to_string())
    .execute(&mut **tx)
    .await
    .context("failed to append task event")?;
    Ok(())
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord> {
    let id: String = row.try_get("id")?;
    let mode: String = row.try_get("mode")?;
    let source_kind: String = row.try_get("source_kind")?;
    let status: String = row.try_get("status")?;
    let progress: i64 = row.try_get("progress_pct")?;
    Ok(TaskRecord {
        id: Uuid::parse_str(&id).context("malformed task id in store")?,
        label: row.try_get("label")?,
        mode: TaskMode::parse(&mode).with_context(|| format!("unknown stored mode '{mode}'"))?,
        source_kind: SourceKind::parse(&source_kind)
            .with_context(|| format!("unknown stored source kind '{source_kind}'"))?,
        source: row.try_get("source")?,
        identifier: row.try_get("identifier")?,
        provider: row.try_get("provider")?,
        provider_ref: row.try_get("provider_ref")?,
        status: TaskStatus::parse(&status)
            .with_context(|| format!("unknown stored status '{status}'"))?,
        progress_pct: u8::try_from(progress.clamp(0, 100)).unwrap_or(100),
        owner: row.try_get("owner")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn file_from_row(row: &SqliteRow) -> Result<TaskFileRecord> {
    let id: String = row.try_get("id")?;
    let task_id: String = row.try_get("task_id")?;
    let index: i64 = row.try_get("file_index")?;
    let state: String = row.try_get("state")?;
    let size: Option<i64> = row.try_get("size_bytes")?;
    let bytes: i64 = row.try_get("bytes_downloaded")?;
    Ok(TaskFileRecord {
        id: Uuid::parse_str(&id).context("malformed file id in store")?,
        task_id: Uuid::parse_str(&task_id).context("malformed task id in store")?,
        index: u32::try_from(index).unwrap_or(u32::MAX),
        name: row.try_get("name")?,
        size_bytes: size.map(|s| u64::try_from(s).unwrap_or_default()),
        state: FileState::parse(&state)
            .with_context(|| format!("unknown stored file state '{state}'"))?,
        bytes_downloaded: u64::try_from(bytes).unwrap_or_default(),
        local_path: row.try_get("local_path")?,
        locked_url: row.try_get("locked_url")?,
        unlocked_url: row.try_get("unlocked_url")?,
    })
}
