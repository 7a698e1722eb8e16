//! Disk reservation admission control.
//!
//! A task in `downloading` may only start new file downloads when the
//! free space at the storage root covers both its own remaining bytes
//! and the reservation held by every other non-terminal task, with a
//! strict low-space floor underneath.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use hauler_data::TaskStore;
use tracing::debug;
use uuid::Uuid;

/// Free-space probe, injectable for tests.
pub trait DiskProbe: Send + Sync {
    /// Bytes available at `root`.
    fn free_bytes(&self, root: &Path) -> u64;
}

/// Production probe backed by `statvfs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    fn free_bytes(&self, root: &Path) -> u64 {
        hauler_fsops::disk_free_bytes(root)
    }
}

/// Decides whether the dispatcher may launch new downloads for a task.
#[derive(Clone)]
pub struct AdmissionController {
    probe: Arc<dyn DiskProbe>,
    root: PathBuf,
    floor_bytes: u64,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("root", &self.root)
            .field("floor_bytes", &self.floor_bytes)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    /// Construct a controller over `root` with the given floor.
    #[must_use]
    pub fn new(probe: Arc<dyn DiskProbe>, root: PathBuf, floor_bytes: u64) -> Self {
        Self {
            probe,
            root,
            floor_bytes,
        }
    }

    /// Admission rule: `free - global_reserved >= need` and
    /// `free > floor`. Non-admission is not an error; the task simply
    /// waits for a later cycle.
    ///
    /// Files with unknown sizes count as zero here; the executor
    /// enforces the live free-space guard while streaming.
    ///
    /// # Errors
    ///
    /// Returns an error if the reservation queries fail.
    pub async fn admit(&self, store: &TaskStore, task_id: Uuid) -> Result<bool> {
        let free = self.probe.free_bytes(&self.root);
        if free <= self.floor_bytes {
            debug!(task_id = %task_id, free, floor = self.floor_bytes, "below low-space floor");
            return Ok(false);
        }
        let need = store.reserved_bytes_for(task_id).await?;
        let global_reserved = store.reserved_bytes_excluding(task_id).await?;
        let admitted = free.saturating_sub(global_reserved) >= need;
        if !admitted {
            debug!(
                task_id = %task_id,
                free,
                need,
                global_reserved,
                "admission denied by reservation"
            );
        }
        Ok(admitted)
    }
}
