//! Per-task cancel flag registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use hauler_core::CancelFlag;
use tracing::error;
use uuid::Uuid;

/// Process-wide registry of per-task cancel flags.
///
/// The store's status column is authoritative; these flags exist so
/// in-flight I/O (provider polls, download chunks) can observe a
/// cancellation without a database round-trip.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<Uuid, CancelFlag>>>,
}

impl CancelRegistry {
    /// A fresh, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag for a task, created unset on first use.
    #[must_use]
    pub fn flag(&self, task_id: Uuid) -> CancelFlag {
        let mut inner = self.lock();
        inner.entry(task_id).or_default().clone()
    }

    /// Request cancellation of a task.
    pub fn cancel(&self, task_id: Uuid) {
        let mut inner = self.lock();
        inner.entry(task_id).or_default().set();
    }

    /// Whether cancellation has been requested for a task.
    #[must_use]
    pub fn is_canceled(&self, task_id: Uuid) -> bool {
        let inner = self.lock();
        inner.get(&task_id).is_some_and(CancelFlag::is_set)
    }

    /// Drop a task's flag once the task row is gone.
    pub fn remove(&self, task_id: Uuid) {
        let mut inner = self.lock();
        inner.remove(&task_id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, CancelFlag>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("cancel registry mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}
