//! Dispatcher loop: starts per-file downloads under concurrency caps.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use hauler_config::Settings;
use hauler_core::{FileState, TaskFileRecord, TaskRecord, TaskStatus};
use hauler_data::TaskStore;
use hauler_fetch::{DownloadExecutor, FetchError, FetchRequest, UrlRefresh};
use hauler_provider::ProviderClient;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::cancel::CancelRegistry;
use crate::oplog::oplog;

/// Starts file downloads for admitted tasks and performs the per-cycle
/// completion check. Never blocks on a download and never marks a file
/// done; that is the monitor's job.
pub struct Dispatcher {
    store: TaskStore,
    provider: Arc<dyn ProviderClient>,
    executor: Arc<dyn DownloadExecutor>,
    admission: AdmissionController,
    cancels: CancelRegistry,
    settings: Arc<Settings>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

/// Re-unlocks a locked URL when the direct URL expires mid-download.
struct ReUnlock {
    provider: Arc<dyn ProviderClient>,
    locked_url: String,
}

#[async_trait]
impl UrlRefresh for ReUnlock {
    async fn refresh(&self) -> Option<String> {
        match self.provider.unlock(&self.locked_url).await {
            Ok(fresh) => Some(fresh),
            Err(err) => {
                warn!(error = %err, "re-unlock of expired url failed");
                None
            }
        }
    }
}

impl Dispatcher {
    /// Construct a dispatcher over shared dependencies.
    #[must_use]
    pub fn new(
        store: TaskStore,
        provider: Arc<dyn ProviderClient>,
        executor: Arc<dyn DownloadExecutor>,
        admission: AdmissionController,
        cancels: CancelRegistry,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            provider,
            executor,
            admission,
            cancels,
            settings,
        }
    }

    /// Spawn the periodic dispatcher loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let interval = dispatcher.settings.timing.worker_loop_interval();
            loop {
                if let Err(err) = dispatcher.tick().await {
                    error!(error = %err, "dispatcher tick failed");
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// One scheduling pass over every `downloading` task, in FIFO
    /// order by creation time.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried; per-task
    /// failures are contained and logged.
    pub async fn tick(&self) -> Result<()> {
        let tasks = self.store.tasks_in_status(&[TaskStatus::Downloading]).await?;
        let global_active = self.store.global_downloading_count().await?;
        let mut budget = u64::from(self.settings.concurrency.global_queue_limit)
            .saturating_sub(global_active);

        for task in tasks {
            if self.cancels.is_canceled(task.id) {
                continue;
            }
            let files = self.store.files_for_task(task.id).await?;
            if self.completion_check(&task, &files).await? {
                continue;
            }
            let has_pending = files.iter().any(|f| f.state == FileState::Selected);
            if !has_pending || budget == 0 {
                continue;
            }
            if !self.admission.admit(&self.store, task.id).await? {
                continue;
            }
            let started = self.start_files(&task, &files, budget).await?;
            budget = budget.saturating_sub(started);
        }
        Ok(())
    }

    /// Start up to the per-task budget of `selected` files, in
    /// ascending index order.
    async fn start_files(
        &self,
        task: &TaskRecord,
        files: &[TaskFileRecord],
        global_budget: u64,
    ) -> Result<u64> {
        let caps = &self.settings.concurrency;
        let active = files
            .iter()
            .filter(|f| f.state == FileState::Downloading)
            .count() as u64;
        let to_start = u64::from(caps.per_task_max_active)
            .saturating_sub(active)
            .min(u64::from(caps.per_task_max_queued))
            .min(global_budget);
        if to_start == 0 {
            return Ok(0);
        }

        let files_dir = self
            .settings
            .storage
            .root
            .join(task.id.to_string())
            .join("files");
        if !hauler_fsops::dir_writable(&files_dir) {
            error!(task_id = %task.id, dir = %files_dir.display(), "storage not writable");
            self.store
                .update_status(task.id, TaskStatus::Failed, Some("storage_not_writable"))
                .await?;
            oplog(
                &self.settings.storage.root,
                task.id,
                serde_json::json!({
                    "level": "error",
                    "event": "storage_not_writable",
                    "dir": files_dir.display().to_string(),
                }),
            );
            return Ok(0);
        }

        let mut started = 0_u64;
        for file in files.iter().filter(|f| f.state == FileState::Selected) {
            if started >= to_start {
                break;
            }
            if self.cancels.is_canceled(task.id) {
                break;
            }
            let Some(locked_url) = file.locked_url.clone() else {
                self.store
                    .fail_file(file, "manifest entry has no locked url")
                    .await?;
                continue;
            };
            let direct_url = match self.provider.unlock(&locked_url).await {
                Ok(url) => url,
                Err(err) => {
                    self.store
                        .fail_file(file, &format!("unlock_failed: {err}"))
                        .await?;
                    continue;
                }
            };
            self.store.start_file(file, &direct_url).await?;
            self.spawn_download(task, file, direct_url, locked_url, files_dir.clone());
            started += 1;
        }
        Ok(started)
    }

    /// Hand one file to the executor without waiting for completion.
    fn spawn_download(
        &self,
        task: &TaskRecord,
        file: &TaskFileRecord,
        direct_url: String,
        locked_url: String,
        files_dir: std::path::PathBuf,
    ) {
        let request = FetchRequest {
            url: direct_url,
            dir: files_dir,
            file_name: file.name.clone(),
            expected_size: file.size_bytes,
            segments: self.settings.concurrency.segments,
        };
        let refresh: Arc<dyn UrlRefresh> = Arc::new(ReUnlock {
            provider: Arc::clone(&self.provider),
            locked_url,
        });
        let executor = Arc::clone(&self.executor);
        let store = self.store.clone();
        let flag = self.cancels.flag(task.id);
        let file = file.clone();
        tokio::spawn(async move {
            match executor.fetch(request, flag, Some(refresh)).await {
                Ok(outcome) => {
                    // the monitor observes the finished artifact and
                    // performs the downloading -> done transition
                    debug!(
                        file_id = %file.id,
                        bytes = outcome.bytes_written,
                        "executor finished"
                    );
                }
                Err(FetchError::Canceled) => {
                    debug!(file_id = %file.id, "download canceled");
                }
                Err(err) => {
                    warn!(file_id = %file.id, error = %err, "download failed");
                    if let Err(store_err) = store.fail_file(&file, &err.to_string()).await {
                        error!(file_id = %file.id, error = %store_err, "failed to record file failure");
                    }
                }
            }
        });
    }

    /// Terminal-state check for one task; returns whether the task
    /// left `downloading`.
    async fn completion_check(
        &self,
        task: &TaskRecord,
        files: &[TaskFileRecord],
    ) -> Result<bool> {
        if files.is_empty() {
            return Ok(false);
        }
        if files.iter().all(|f| f.state == FileState::Done) {
            info!(task_id = %task.id, files = files.len(), "all files done; task ready");
            self.store
                .update_status(task.id, TaskStatus::Ready, None)
                .await?;
            // future submissions of the same source can shortcut here
            self.store
                .dedup_record(&task.identifier, &task.id.to_string())
                .await?;
            let base = self.settings.storage.root.join(task.id.to_string());
            if let Err(err) = hauler_fsops::write_metadata(
                &base,
                &serde_json::json!({
                    "taskId": task.id,
                    "identifier": task.identifier,
                    "status": TaskStatus::Ready,
                    "files": files.iter().map(|f| &f.name).collect::<Vec<_>>(),
                }),
            ) {
                warn!(task_id = %task.id, error = %err, "failed to write completion metadata");
            }
            oplog(
                &self.settings.storage.root,
                task.id,
                serde_json::json!({
                    "level": "info",
                    "event": "task_ready_all_done",
                    "total": files.len(),
                }),
            );
            return Ok(true);
        }
        let any_failed = files.iter().any(|f| f.state == FileState::Failed);
        let any_live = files.iter().any(|f| {
            matches!(
                f.state,
                FileState::Listed | FileState::Selected | FileState::Downloading
            )
        });
        if any_failed && !any_live {
            self.store
                .update_status(task.id, TaskStatus::Failed, Some("file_failures"))
                .await?;
            return Ok(true);
        }
        Ok(false)
    }
}
