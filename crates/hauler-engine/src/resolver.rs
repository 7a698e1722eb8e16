//! Resolver loop: drives tasks from `queued` to a known manifest.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use hauler_config::Settings;
use hauler_core::{sanitize_file_name, tag_file_name, NewTaskFile, TaskMode, TaskRecord, TaskStatus};
use hauler_data::TaskStore;
use hauler_provider::{ProviderClient, ProviderError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelRegistry;
use crate::oplog::oplog;

/// Drives one task at a time from `queued` through manifest discovery
/// to `waiting_selection` or `downloading`.
pub struct Resolver {
    store: TaskStore,
    provider: Arc<dyn ProviderClient>,
    cancels: CancelRegistry,
    settings: Arc<Settings>,
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

struct ActiveGuard {
    active: Arc<Mutex<HashSet<Uuid>>>,
    task_id: Uuid,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.task_id);
        }
    }
}

impl Resolver {
    /// Construct a resolver over shared dependencies.
    #[must_use]
    pub fn new(
        store: TaskStore,
        provider: Arc<dyn ProviderClient>,
        cancels: CancelRegistry,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            provider,
            cancels,
            settings,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Spawn the periodic resolver loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            let interval = resolver.settings.timing.worker_loop_interval();
            loop {
                if let Err(err) = resolver.tick().await {
                    error!(error = %err, "resolver tick failed");
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// One scheduling pass: sweep selection timeouts, then pick up
    /// every claimable `queued`/`resolving` task.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried; individual
    /// task resolutions run detached and log their own failures.
    pub async fn tick(self: &Arc<Self>) -> Result<()> {
        self.sweep_selection_timeouts().await?;
        let tasks = self
            .store
            .tasks_in_status(&[TaskStatus::Queued, TaskStatus::Resolving])
            .await?;
        for task in tasks {
            let Some(guard) = self.claim(task.id) else {
                continue;
            };
            let resolver = Arc::clone(self);
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(err) = resolver.resolve_task(&task).await {
                    error!(task_id = %task.id, error = %err, "task resolution failed");
                }
            });
        }
        Ok(())
    }

    fn claim(&self, task_id: Uuid) -> Option<ActiveGuard> {
        let mut active = self.active.lock().ok()?;
        if !active.insert(task_id) {
            return None;
        }
        Some(ActiveGuard {
            active: Arc::clone(&self.active),
            task_id,
        })
    }

    /// Cancel `waiting_selection` tasks whose selection window expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub async fn sweep_selection_timeouts(&self) -> Result<()> {
        let timeout = self.settings.timing.selection_timeout();
        let cutoff = Utc::now()
            - chrono::Duration::seconds(i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX));
        let waiting = self
            .store
            .tasks_in_status(&[TaskStatus::WaitingSelection])
            .await?;
        for task in waiting {
            if task.updated_at <= cutoff {
                info!(task_id = %task.id, "selection window expired; canceling");
                self.cancels.cancel(task.id);
                self.store
                    .update_status(task.id, TaskStatus::Canceled, Some("selection_timeout"))
                    .await?;
            }
        }
        Ok(())
    }

    /// Run one full resolution cycle for a task.
    ///
    /// Safe to re-enter after a crash: an existing `provider_ref`
    /// skips the upload, and manifest insertion is idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error on store failures; provider failures are
    /// classified and handled per the error taxonomy.
    pub async fn resolve_task(&self, task: &TaskRecord) -> Result<()> {
        let root = &self.settings.storage.root;
        let dirs = hauler_fsops::ensure_task_dirs(root, task.id)?;

        if task.status == TaskStatus::Queued && self.try_dedup_shortcut(task, &dirs).await? {
            return Ok(());
        }

        let provider_ref = match &task.provider_ref {
            Some(existing) => existing.clone(),
            None => {
                self.store
                    .append_event(
                        task.id,
                        hauler_core::EventLevel::Info,
                        "provider_upload_begin",
                        &serde_json::json!({}),
                    )
                    .await?;
                match self.provider.upload(&task.source).await {
                    Ok(provider_ref) => {
                        self.store.set_provider_ref(task.id, &provider_ref).await?;
                        info!(task_id = %task.id, "provider upload complete");
                        provider_ref
                    }
                    Err(ProviderError::Terminal(reason)) => {
                        self.store
                            .update_status(task.id, TaskStatus::Failed, Some(&reason))
                            .await?;
                        return Ok(());
                    }
                    Err(ProviderError::Transient(reason)) => {
                        // stays queued; the next tick retries the upload
                        warn!(task_id = %task.id, reason, "provider upload failed; will retry");
                        return Ok(());
                    }
                }
            }
        };

        if task.status == TaskStatus::Queued {
            self.store
                .update_status(task.id, TaskStatus::Resolving, None)
                .await?;
        }

        if !self.poll_until_listed(task, &provider_ref).await? {
            return Ok(());
        }

        match task.mode {
            TaskMode::Select => {
                self.store
                    .update_status(task.id, TaskStatus::WaitingSelection, None)
                    .await?;
            }
            TaskMode::Auto => {
                self.store.select_all_files(task.id).await?;
                self.store
                    .update_status(task.id, TaskStatus::Downloading, None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Poll the provider until the manifest appears.
    ///
    /// Returns `true` when files were listed, `false` when the task
    /// reached a terminal state instead (failed or canceled).
    async fn poll_until_listed(&self, task: &TaskRecord, provider_ref: &str) -> Result<bool> {
        let attempts = self.settings.timing.max_resolve_attempts;
        let delay = self.settings.timing.resolve_poll_delay();
        for attempt in 0..attempts {
            if self.halted(task.id).await? {
                return Ok(false);
            }
            match self.provider.status(provider_ref).await {
                Ok(poll) => {
                    if let Some(reason) = poll.terminal_error {
                        self.store
                            .update_status(task.id, TaskStatus::Failed, Some(&reason))
                            .await?;
                        return Ok(false);
                    }
                    if !poll.files.is_empty() {
                        let manifest = manifest_from_poll(&poll.files);
                        self.store.insert_files(task.id, &manifest).await?;
                        info!(task_id = %task.id, count = manifest.len(), "manifest listed");
                        oplog(
                            &self.settings.storage.root,
                            task.id,
                            serde_json::json!({
                                "level": "info",
                                "event": "files_listed",
                                "count": manifest.len(),
                            }),
                        );
                        return Ok(true);
                    }
                }
                Err(ProviderError::Terminal(reason)) => {
                    self.store
                        .update_status(task.id, TaskStatus::Failed, Some(&reason))
                        .await?;
                    return Ok(false);
                }
                Err(ProviderError::Transient(reason)) => {
                    warn!(task_id = %task.id, attempt, reason, "status poll failed");
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        self.store
            .update_status(task.id, TaskStatus::Failed, Some("timeout_no_files"))
            .await?;
        oplog(
            &self.settings.storage.root,
            task.id,
            serde_json::json!({
                "level": "error",
                "event": "resolve_timeout_no_files",
            }),
        );
        Ok(false)
    }

    /// Complete a task straight from the dedup index when its share is
    /// still on disk. No provider calls are made on this path.
    async fn try_dedup_shortcut(
        &self,
        task: &TaskRecord,
        dirs: &hauler_fsops::TaskDirs,
    ) -> Result<bool> {
        let Some(entry) = self.store.dedup_lookup(&task.identifier).await? else {
            return Ok(false);
        };
        let share_dir = self.settings.storage.root.join(&entry.share_id);
        if !share_dir.is_dir() {
            // stale index entry; fall through to a normal resolve
            return Ok(false);
        }
        info!(task_id = %task.id, share = %entry.share_id, "dedup hit; reusing existing share");
        hauler_fsops::write_metadata(
            &dirs.base,
            &serde_json::json!({
                "taskId": task.id,
                "identifier": task.identifier,
                "reusedShare": entry.share_id,
            }),
        )?;
        self.store
            .append_event(
                task.id,
                hauler_core::EventLevel::Info,
                "dedup_hit",
                &serde_json::json!({ "shareId": entry.share_id }),
            )
            .await?;
        self.store
            .update_status(task.id, TaskStatus::Ready, Some("already_materialized"))
            .await?;
        Ok(true)
    }

    /// Whether the task was canceled or otherwise left the resolve
    /// path while we were polling.
    async fn halted(&self, task_id: Uuid) -> Result<bool> {
        if self.cancels.is_canceled(task_id) {
            return Ok(true);
        }
        let Some(current) = self.store.get_task(task_id).await? else {
            return Ok(true);
        };
        Ok(current.status.is_terminal())
    }
}

/// Turn provider manifest entries into task-file inputs with sanitised,
/// per-task-unique names.
///
/// Sanitising can fold two manifest entries onto the same name; the
/// `files/` directory is flat, so a collision would make two files
/// share one artifact path. Colliding names are tagged with their
/// manifest index, and anything still taken after that grows an index
/// prefix until it is free.
fn manifest_from_poll(files: &[hauler_provider::ProviderFile]) -> Vec<NewTaskFile> {
    let mut used = HashSet::new();
    files
        .iter()
        .enumerate()
        .map(|(index, file)| {
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            let mut name = sanitize_file_name(&file.name, index);
            if used.contains(&name) {
                name = tag_file_name(&name, index);
            }
            while !used.insert(name.clone()) {
                name = format!("{index}_{name}");
            }
            NewTaskFile {
                index,
                name,
                size_bytes: (file.size > 0).then_some(file.size),
                locked_url: file.locked_url.clone(),
            }
        })
        .collect()
}
