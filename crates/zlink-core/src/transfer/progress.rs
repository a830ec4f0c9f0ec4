//! Throttled progress persistence.
//!
//! Progress is written through the store only at checkpoints. Updates that
//! fall between checkpoints are buffered and written by a periodic flush.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::store::{Store, StoreError};

/// When a progress update is written immediately.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    /// Time since the last write after which the next update is written
    pub min_save_interval: Duration,
    /// Chunks completed since the last write that force a write
    pub checkpoint_chunks: u32,
    /// Bytes transferred since the last write that force a write
    pub checkpoint_bytes: u64,
    /// Period of the batch flush of buffered updates
    pub batch_flush_interval: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            min_save_interval: Duration::from_secs(2),
            checkpoint_chunks: 32,
            checkpoint_bytes: 4 * 1024 * 1024,
            batch_flush_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    last_saved_at: Instant,
    chunks: u32,
    bytes: u64,
}

pub struct ProgressTracker {
    store: Arc<dyn Store>,
    policy: CheckpointPolicy,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    pending: Mutex<HashMap<String, (u32, u64)>>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn Store>, policy: CheckpointPolicy) -> Self {
        Self {
            store,
            policy,
            checkpoints: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &CheckpointPolicy {
        &self.policy
    }

    /// Start tracking a transfer whose persisted progress is
    /// `completed`/`bytes`.
    pub fn begin(&self, transfer_id: &str, completed: u32, bytes: u64) {
        self.checkpoints.lock().insert(
            transfer_id.to_string(),
            Checkpoint {
                last_saved_at: Instant::now(),
                chunks: completed,
                bytes,
            },
        );
        self.pending.lock().remove(transfer_id);
    }

    /// Report progress. Returns true if the update was written now, false
    /// if it was buffered.
    pub async fn update(&self, transfer_id: &str, completed: u32, total: u32, bytes: u64) -> Result<bool, StoreError> {
        let now = Instant::now();
        let force = {
            let mut checkpoints = self.checkpoints.lock();
            let checkpoint = checkpoints.entry(transfer_id.to_string()).or_insert(Checkpoint {
                last_saved_at: now,
                chunks: 0,
                bytes: 0,
            });
            let force = now.duration_since(checkpoint.last_saved_at) >= self.policy.min_save_interval
                || completed.saturating_sub(checkpoint.chunks) >= self.policy.checkpoint_chunks
                || bytes.saturating_sub(checkpoint.bytes) >= self.policy.checkpoint_bytes
                || completed >= total;
            if force {
                *checkpoint = Checkpoint {
                    last_saved_at: now,
                    chunks: completed,
                    bytes,
                };
            }
            force
        };

        if !force {
            self.pending.lock().insert(transfer_id.to_string(), (completed, bytes));
            return Ok(false);
        }

        self.pending.lock().remove(transfer_id);
        self.store.upsert_transfer_progress(transfer_id, completed, bytes).await?;
        debug!(transfer_id = %transfer_id, completed, total, bytes, "progress checkpoint");
        Ok(true)
    }

    /// Write every buffered update. Returns how many were written.
    pub async fn flush_pending(&self) -> usize {
        let drained: Vec<(String, (u32, u64))> = self.pending.lock().drain().collect();
        let mut written = 0;
        for (transfer_id, (completed, bytes)) in drained {
            if self.write(&transfer_id, completed, bytes).await {
                written += 1;
            }
        }
        written
    }

    /// Write the buffered update for one transfer, if any.
    pub async fn flush(&self, transfer_id: &str) -> bool {
        let buffered = self.pending.lock().remove(transfer_id);
        match buffered {
            Some((completed, bytes)) => self.write(transfer_id, completed, bytes).await,
            None => false,
        }
    }

    pub fn forget(&self, transfer_id: &str) {
        self.checkpoints.lock().remove(transfer_id);
        self.pending.lock().remove(transfer_id);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Write a buffered update unless newer progress has been checkpointed
    /// since it was buffered. The checkpoint is claimed before the write.
    async fn write(&self, transfer_id: &str, completed: u32, bytes: u64) -> bool {
        let previous = {
            let mut checkpoints = self.checkpoints.lock();
            let Some(checkpoint) = checkpoints.get_mut(transfer_id) else { return false };
            if completed <= checkpoint.chunks {
                debug!(transfer_id = %transfer_id, completed, saved = checkpoint.chunks, "buffered progress superseded");
                return false;
            }
            std::mem::replace(
                checkpoint,
                Checkpoint {
                    last_saved_at: Instant::now(),
                    chunks: completed,
                    bytes,
                },
            )
        };

        match self.store.upsert_transfer_progress(transfer_id, completed, bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(transfer_id = %transfer_id, error = %e, "failed to flush progress");
                if let Some(checkpoint) = self.checkpoints.lock().get_mut(transfer_id) {
                    if checkpoint.chunks == completed {
                        *checkpoint = previous;
                    }
                }
                self.pending
                    .lock()
                    .entry(transfer_id.to_string())
                    .or_insert((completed, bytes));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::transfer::record::sample_record;
    use crate::transfer::{TransferDirection, TransferStatus};

    async fn tracker(policy: CheckpointPolicy) -> (ProgressTracker, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let mut record = sample_record("t", TransferStatus::Transferring, TransferDirection::Inbound);
        record.total_chunks = 100;
        store.save_transfer(&record).await.unwrap();
        let tracker = ProgressTracker::new(store.clone(), policy);
        tracker.begin("t", 0, 0);
        (tracker, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_updates_are_throttled() {
        let (tracker, store) = tracker(CheckpointPolicy::default()).await;

        let n = 20;
        for i in 1..=n {
            tokio::time::advance(Duration::from_millis(10)).await;
            tracker.update("t", i, 100, i as u64 * 100).await.unwrap();
        }
        let writes = store.write_counts().progress_writes;
        assert!(writes < n as u64, "{} writes for {} updates", writes, n);
        assert_eq!(tracker.pending_len(), 1);

        assert!(tracker.update("t", 100, 100, 10_000).await.unwrap());
        assert_eq!(tracker.pending_len(), 0);
        let loaded = store.load_transfer("t").await.unwrap().unwrap();
        assert_eq!(loaded.completed_chunks, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_thresholds_force_write() {
        let policy = CheckpointPolicy {
            checkpoint_chunks: 5,
            checkpoint_bytes: 1_000,
            ..CheckpointPolicy::default()
        };
        let (tracker, _) = tracker(policy).await;

        assert!(!tracker.update("t", 4, 100, 400).await.unwrap());
        assert!(tracker.update("t", 5, 100, 500).await.unwrap());
        assert!(tracker.update("t", 6, 100, 1_500).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.update("t", 7, 100, 1_600).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_flush_writes_buffered() {
        let (tracker, store) = tracker(CheckpointPolicy::default()).await;
        tracker.update("t", 3, 100, 300).await.unwrap();
        assert_eq!(store.write_counts().progress_writes, 0);

        assert_eq!(tracker.flush_pending().await, 1);
        let loaded = store.load_transfer("t").await.unwrap().unwrap();
        assert_eq!(loaded.completed_chunks, 3);
        assert!(!tracker.flush("t").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_buffered_update_does_not_overwrite_checkpoint() {
        let policy = CheckpointPolicy {
            checkpoint_chunks: 10,
            ..CheckpointPolicy::default()
        };
        let (tracker, store) = tracker(policy).await;
        assert!(!tracker.update("t", 3, 100, 300).await.unwrap());

        // A flush has taken the buffered value when a forced update lands.
        let drained: Vec<_> = tracker.pending.lock().drain().collect();
        assert!(tracker.update("t", 12, 100, 1_200).await.unwrap());
        for (id, (completed, bytes)) in drained {
            assert!(!tracker.write(&id, completed, bytes).await);
        }

        let loaded = store.load_transfer("t").await.unwrap().unwrap();
        assert_eq!(loaded.completed_chunks, 12);
        assert_eq!(loaded.bytes_transferred, 1_200);
        assert_eq!(store.write_counts().progress_writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_skips_forgotten_transfers() {
        let (tracker, store) = tracker(CheckpointPolicy::default()).await;
        tracker.update("t", 3, 100, 300).await.unwrap();
        tracker.checkpoints.lock().remove("t");

        assert_eq!(tracker.flush_pending().await, 0);
        assert_eq!(store.write_counts().progress_writes, 0);
        assert_eq!(tracker.pending_len(), 0);
    }
}
