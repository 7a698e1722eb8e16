//! Byte-count ledger kept in the sidecar control file.
//!
//! Segmented downloads pre-allocate the output before any payload
//! lands, so the output length says nothing about progress. The
//! executor instead accumulates payload bytes here and periodically
//! rewrites the sidecar with the running total; the progress monitor
//! reads that count for as long as the sidecar exists.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

/// Bytes accumulated between sidecar rewrites.
const FLUSH_STEP: u64 = 1024 * 1024;

/// Shared payload counter backed by the sidecar control file.
pub(crate) struct ProgressLedger {
    path: PathBuf,
    written: AtomicU64,
    flushed: AtomicU64,
    flush_lock: Mutex<()>,
}

impl std::fmt::Debug for ProgressLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ProgressLedger {
    /// Create the sidecar seeded with a zero count.
    pub(crate) async fn create(path: PathBuf) -> io::Result<Self> {
        tokio::fs::write(&path, b"0").await?;
        Ok(Self {
            path,
            written: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
        })
    }

    /// Record payload bytes, rewriting the sidecar once enough have
    /// accumulated since the last flush.
    pub(crate) async fn add(&self, bytes: u64) {
        let total = self.written.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if total.saturating_sub(self.flushed.load(Ordering::SeqCst)) >= FLUSH_STEP {
            self.flush(total).await;
        }
    }

    /// Rewrite the sidecar with the current total regardless of the
    /// flush step. Called when an attempt ends so frozen progress is
    /// accurate.
    pub(crate) async fn flush_now(&self) {
        let total = self.written.load(Ordering::SeqCst);
        self.flush(total).await;
    }

    /// Restart the count for a fresh attempt (retries truncate the
    /// output and start over).
    pub(crate) async fn reset(&self) {
        self.written.store(0, Ordering::SeqCst);
        self.flushed.store(0, Ordering::SeqCst);
        let _guard = self.flush_lock.lock().await;
        let _ = tokio::fs::write(&self.path, b"0").await;
    }

    async fn flush(&self, total: u64) {
        let _guard = self.flush_lock.lock().await;
        // a concurrent segment worker may already have flushed further
        if total <= self.flushed.load(Ordering::SeqCst) && total != 0 {
            return;
        }
        if tokio::fs::write(&self.path, total.to_string()).await.is_ok() {
            self.flushed.store(total, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hauler_core::read_progress;

    #[tokio::test]
    async fn create_seeds_a_zero_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin.haul");
        let _ledger = ProgressLedger::create(path.clone()).await.unwrap();
        assert_eq!(read_progress(&path), Some(0));
    }

    #[tokio::test]
    async fn small_additions_batch_until_the_flush_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin.haul");
        let ledger = ProgressLedger::create(path.clone()).await.unwrap();

        ledger.add(512).await;
        assert_eq!(read_progress(&path), Some(0), "below the step, not yet flushed");

        ledger.add(FLUSH_STEP).await;
        assert_eq!(read_progress(&path), Some(FLUSH_STEP + 512));
    }

    #[tokio::test]
    async fn flush_now_records_the_exact_total() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin.haul");
        let ledger = ProgressLedger::create(path.clone()).await.unwrap();
        ledger.add(10).await;
        ledger.add(32).await;
        ledger.flush_now().await;
        assert_eq!(read_progress(&path), Some(42));
    }

    #[tokio::test]
    async fn reset_returns_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin.haul");
        let ledger = ProgressLedger::create(path.clone()).await.unwrap();
        ledger.add(FLUSH_STEP * 2).await;
        ledger.reset().await;
        assert_eq!(read_progress(&path), Some(0));
        ledger.add(7).await;
        ledger.flush_now().await;
        assert_eq!(read_progress(&path), Some(7));
    }

    #[tokio::test]
    async fn concurrent_writers_sum_their_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin.haul");
        let ledger = std::sync::Arc::new(ProgressLedger::create(path.clone()).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ledger = std::sync::Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    ledger.add(1024).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        ledger.flush_now().await;
        assert_eq!(read_progress(&path), Some(4 * 100 * 1024));
    }
}
