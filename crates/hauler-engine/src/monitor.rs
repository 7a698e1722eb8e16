//! Progress monitor loop: the filesystem is the progress channel.
//!
//! The executor (possibly out-of-process) writes artifacts and keeps a
//! sidecar control file alive for the duration of the transfer, with
//! the running payload byte count recorded inside it. While the
//! sidecar exists, that count is the progress signal — the output
//! length is not trusted, because the segmented path pre-allocates the
//! whole file before any payload lands. Once the sidecar is gone the
//! artifact length itself closes the loop. The monitor is the sole
//! authority for the `downloading -> done` transition.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use hauler_config::Settings;
use hauler_core::{control_path, read_progress};
use hauler_data::TaskStore;
use tokio::task::JoinHandle;
use tracing::error;

/// Background observer reconciling on-disk bytes into the store.
pub struct ProgressMonitor {
    store: TaskStore,
    settings: Arc<Settings>,
}

impl std::fmt::Debug for ProgressMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMonitor").finish_non_exhaustive()
    }
}

impl ProgressMonitor {
    /// Construct a monitor over shared dependencies.
    #[must_use]
    pub fn new(store: TaskStore, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    /// Spawn the periodic monitor loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let interval = monitor.settings.timing.progress_monitor_interval();
            loop {
                if let Err(err) = monitor.tick().await {
                    error!(error = %err, "progress monitor tick failed");
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// One sampling pass over every in-flight file.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub async fn tick(&self) -> Result<()> {
        let files = self.store.files_downloading().await?;
        for file in files {
            let output = self
                .settings
                .storage
                .root
                .join(file.task_id.to_string())
                .join("files")
                .join(&file.name);
            let ctrl = control_path(&output);

            let total = file.size_bytes.unwrap_or(0);
            let ctrl_present = ctrl.exists();
            let raw = if ctrl_present {
                // a count caught mid-rewrite is skipped; the next tick
                // picks it up
                match read_progress(&ctrl) {
                    Some(count) => count,
                    None => continue,
                }
            } else {
                file_size(&output).unwrap_or(0)
            };
            let observed = if total > 0 { raw.min(total) } else { raw };
            if observed != file.bytes_downloaded {
                self.store.update_file_progress(&file, observed).await?;
            }

            let complete =
                !ctrl_present && output.exists() && (total == 0 || observed >= total);
            if complete {
                let local_path = output.to_string_lossy().into_owned();
                self.store.complete_file(&file, &local_path, observed).await?;
            }
        }
        Ok(())
    }
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|meta| meta.len())
}
