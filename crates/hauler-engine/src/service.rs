//! Task service facade: the surface consumed by the HTTP layer.

use std::sync::Arc;

use hauler_config::Settings;
use hauler_core::{
    parse_source, SourceError, TaskDetail, TaskMode, TaskRecord, TaskStatus, MAX_LABEL_LENGTH,
};
use hauler_data::{NewTask, TaskStore};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::cancel::CancelRegistry;
use crate::feed::TaskFeed;

/// Statuses that make an existing task reusable for a matching
/// submission. Failed and canceled tasks are resubmittable.
const REUSABLE_STATUSES: &[TaskStatus] = &[
    TaskStatus::Queued,
    TaskStatus::Resolving,
    TaskStatus::WaitingSelection,
    TaskStatus::Downloading,
    TaskStatus::Ready,
];

/// Largest page a list call will return.
const MAX_LIST_LIMIT: u32 = 500;

/// Failures surfaced to API consumers.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The submitted source was rejected before any state change.
    #[error(transparent)]
    InvalidSource(#[from] SourceError),
    /// The referenced task does not exist.
    #[error("task not found")]
    NotFound,
    /// The task exists but is in the wrong state for the operation.
    #[error("{0}")]
    InvalidState(String),
    /// A request parameter was rejected.
    #[error("invalid request: {0}")]
    InvalidInput(String),
    /// An unexpected internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// One submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Magnet link or direct HTTP(S) URL.
    pub source: String,
    /// Auto or select mode.
    pub mode: TaskMode,
    /// Optional human label.
    pub label: Option<String>,
    /// Optional owner reference.
    pub owner: Option<String>,
}

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// The created (or reused) task.
    pub task_id: Uuid,
    /// Its status at submission time.
    pub status: TaskStatus,
    /// Whether an existing task was reused instead of creating one.
    pub reused: bool,
}

/// Facade over the store, cancel registry, and storage layout.
#[derive(Clone)]
pub struct TaskService {
    store: TaskStore,
    cancels: CancelRegistry,
    settings: Arc<Settings>,
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService").finish_non_exhaustive()
    }
}

impl TaskService {
    /// Construct the facade over shared dependencies.
    #[must_use]
    pub fn new(store: TaskStore, cancels: CancelRegistry, settings: Arc<Settings>) -> Self {
        Self {
            store,
            cancels,
            settings,
        }
    }

    /// Submit a source, reusing a matching task when one is live.
    ///
    /// Validation happens before any state change. A new task enters
    /// `queued`, gets its storage directories, and announces itself
    /// with a `hello` event.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidSource`] or
    /// [`ServiceError::InvalidInput`] on rejection, or
    /// [`ServiceError::Internal`] on store failures.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, ServiceError> {
        let parsed = parse_source(&request.source)?;
        let label = validate_label(request.label)?;

        if let Some(existing) = self
            .store
            .find_by_dedup_key(&parsed.identifier, parsed.kind, REUSABLE_STATUSES)
            .await?
        {
            info!(task_id = %existing.id, "reusing existing task for matching source");
            return Ok(SubmitOutcome {
                task_id: existing.id,
                status: existing.status,
                reused: true,
            });
        }

        let record = self
            .store
            .create_task(NewTask {
                label: label.clone(),
                mode: request.mode,
                source_kind: parsed.kind,
                source: parsed.source,
                identifier: parsed.identifier,
                provider: "debrid".to_owned(),
                owner: request.owner,
            })
            .await?;

        let dirs = hauler_fsops::ensure_task_dirs(&self.settings.storage.root, record.id)?;
        hauler_fsops::write_metadata(
            &dirs.base,
            &serde_json::json!({
                "taskId": record.id,
                "mode": record.mode,
                "label": label,
                "identifier": record.identifier,
                "sourceKind": record.source_kind,
                "status": record.status,
            }),
        )?;
        hauler_fsops::append_log(
            &dirs.base,
            &serde_json::json!({
                "level": "info",
                "event": "task_created",
                "taskId": record.id,
                "sourceKind": record.source_kind,
            }),
        )?;
        self.store
            .append_event(
                record.id,
                hauler_core::EventLevel::Info,
                "task_created",
                &serde_json::json!({ "sourceKind": record.source_kind }),
            )
            .await?;

        Ok(SubmitOutcome {
            task_id: record.id,
            status: record.status,
            reused: false,
        })
    }

    /// Register a file the HTTP layer already staged on local disk as
    /// a completed task, bypassing the provider entirely.
    ///
    /// The staged file is moved into the task's `files/` directory and
    /// the task lands in `ready` within the same call.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidInput`] when the staged path is
    /// missing, or [`ServiceError::Internal`] on store or filesystem
    /// failures.
    pub async fn submit_upload(
        &self,
        staged: &std::path::Path,
        original_name: &str,
        label: Option<String>,
        owner: Option<String>,
    ) -> Result<SubmitOutcome, ServiceError> {
        if !staged.is_file() {
            return Err(ServiceError::InvalidInput(
                "staged upload file does not exist".to_owned(),
            ));
        }
        let label = validate_label(label)?;
        let name = hauler_core::sanitize_file_name(original_name, 0);

        let record = self
            .store
            .create_task(NewTask {
                label: label.or_else(|| Some(original_name.to_owned())),
                mode: TaskMode::Auto,
                source_kind: hauler_core::SourceKind::Upload,
                source: format!("upload://{original_name}"),
                identifier: hauler_core::upload_identifier(),
                provider: "upload".to_owned(),
                owner,
            })
            .await?;

        let dirs = hauler_fsops::ensure_task_dirs(&self.settings.storage.root, record.id)?;
        let dest = dirs.files.join(&name);
        if std::fs::rename(staged, &dest).is_err() {
            // staging area may sit on another filesystem
            std::fs::copy(staged, &dest)
                .map_err(|err| anyhow::anyhow!("failed to store upload: {err}"))?;
            let _ = std::fs::remove_file(staged);
        }
        let size = std::fs::metadata(&dest)
            .map_err(|err| anyhow::anyhow!("failed to stat upload: {err}"))?
            .len();

        self.store
            .insert_completed_file(record.id, &name, size, &dest.to_string_lossy())
            .await?;
        let updated = self
            .store
            .update_status(record.id, TaskStatus::Ready, Some("upload"))
            .await?;
        hauler_fsops::write_metadata(
            &dirs.base,
            &serde_json::json!({
                "taskId": record.id,
                "mode": record.mode,
                "identifier": record.identifier,
                "sourceKind": record.source_kind,
                "status": updated.status,
                "originalFilename": original_name,
                "savedFilename": name,
            }),
        )?;
        hauler_fsops::append_log(
            &dirs.base,
            &serde_json::json!({
                "level": "info",
                "event": "upload_completed",
                "taskId": record.id,
                "filename": name,
                "size": size,
            }),
        )?;

        Ok(SubmitOutcome {
            task_id: record.id,
            status: updated.status,
            reused: false,
        })
    }

    /// Fetch a task snapshot with its files.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] for unknown ids.
    pub async fn get(&self, task_id: Uuid) -> Result<TaskDetail, ServiceError> {
        self.store
            .get_detail(task_id)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    /// List tasks with an optional status filter.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidInput`] for out-of-range paging.
    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<TaskRecord>, u64), ServiceError> {
        if limit == 0 || limit > MAX_LIST_LIMIT {
            return Err(ServiceError::InvalidInput(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }
        Ok(self.store.list_tasks(status, limit, offset).await?)
    }

    /// Apply a file selection to a task in `waiting_selection`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`], [`ServiceError::InvalidState`]
    /// when the task is not waiting, or [`ServiceError::InvalidInput`]
    /// for an empty selection.
    pub async fn select(
        &self,
        task_id: Uuid,
        file_ids: &[Uuid],
    ) -> Result<TaskStatus, ServiceError> {
        if file_ids.is_empty() {
            return Err(ServiceError::InvalidInput(
                "at least one file must be selected".to_owned(),
            ));
        }
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(ServiceError::NotFound)?;
        if task.status != TaskStatus::WaitingSelection {
            return Err(ServiceError::InvalidState(
                "task is not waiting for selection".to_owned(),
            ));
        }
        let status = self.store.apply_selection(task_id, file_ids).await?;
        Ok(status)
    }

    /// Cancel a task. Terminal tasks are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] for unknown ids.
    pub async fn cancel(&self, task_id: Uuid) -> Result<TaskStatus, ServiceError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(ServiceError::NotFound)?;
        if task.status.is_terminal() {
            return Ok(task.status);
        }
        self.cancels.cancel(task_id);
        let updated = self
            .store
            .update_status(task_id, TaskStatus::Canceled, Some("user_cancel"))
            .await?;
        info!(task_id = %task_id, "task canceled");
        Ok(updated.status)
    }

    /// Delete a task, optionally purging its on-disk artifacts.
    ///
    /// Idempotent: deleting an unknown task succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Internal`] on store or filesystem
    /// failures.
    pub async fn delete(&self, task_id: Uuid, purge_files: bool) -> Result<(), ServiceError> {
        // stop in-flight i/o before the row disappears
        self.cancels.cancel(task_id);
        let existed = self.store.delete_task(task_id).await?;
        self.store.events().retire(task_id);
        self.cancels.remove(task_id);
        if purge_files {
            hauler_fsops::purge_task_files(&self.settings.storage.root, task_id)?;
        }
        if existed {
            info!(task_id = %task_id, purge_files, "task deleted");
        }
        Ok(())
    }

    /// Open a live feed for a task.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] for unknown ids.
    pub async fn subscribe(&self, task_id: Uuid) -> Result<TaskFeed, ServiceError> {
        let detail = self
            .store
            .get_detail(task_id)
            .await?
            .ok_or(ServiceError::NotFound)?;
        Ok(TaskFeed::open(
            self.store.clone(),
            detail,
            &self.settings.timing,
        ))
    }
}

fn validate_label(label: Option<String>) -> Result<Option<String>, ServiceError> {
    let Some(label) = label else {
        return Ok(None);
    };
    if label.len() > MAX_LABEL_LENGTH {
        return Err(ServiceError::InvalidInput(format!(
            "label exceeds {MAX_LABEL_LENGTH} characters"
        )));
    }
    let cleaned: String = label.chars().filter(|c| (*c as u32) >= 32).collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_owned()))
    }
}
