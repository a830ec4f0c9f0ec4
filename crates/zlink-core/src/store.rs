//! Storage abstraction for transfers, devices and the audit trail.
//!
//! This module defines the `Store` trait and provides an in-memory
//! implementation for tests and ephemeral nodes. The SQLite implementation
//! lives in `sqlite_store` behind the `sqlite` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;

use zlink_security::AuditEntry;

use crate::devices::DeviceRecord;
use crate::transfer::TransferRecord;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Store Trait
// ============================================================================

/// Persistence consumed by the runtime.
#[async_trait]
pub trait Store: Send + Sync {
    // -------------------------------------------------------------------------
    // Transfers
    // -------------------------------------------------------------------------

    /// Insert or replace a whole transfer record.
    async fn save_transfer(&self, record: &TransferRecord) -> Result<(), StoreError>;

    /// Update only the progress counters of an existing transfer.
    ///
    /// # Returns
    /// * `Err(StoreError::NotFound)` if no record exists for `transfer_id`
    async fn upsert_transfer_progress(
        &self,
        transfer_id: &str,
        completed_chunks: u32,
        bytes_transferred: u64,
    ) -> Result<(), StoreError>;

    async fn load_transfer(&self, transfer_id: &str) -> Result<Option<TransferRecord>, StoreError>;

    /// Transfers whose status is not terminal.
    async fn load_active_transfers(&self) -> Result<Vec<TransferRecord>, StoreError>;

    /// Every transfer, newest first.
    async fn list_transfers(&self) -> Result<Vec<TransferRecord>, StoreError>;

    // -------------------------------------------------------------------------
    // Audit
    // -------------------------------------------------------------------------

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    /// The newest `limit` audit entries, oldest first.
    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError>;

    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    async fn save_device(&self, record: &DeviceRecord) -> Result<(), StoreError>;

    async fn load_devices(&self) -> Result<Vec<DeviceRecord>, StoreError>;

    /// Delete a device. Succeeds even if it did not exist.
    async fn remove_device(&self, device_id: &str) -> Result<(), StoreError>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Counters of write calls, used to check write throttling.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteCounts {
    pub transfer_saves: u64,
    pub progress_writes: u64,
    pub audit_appends: u64,
    pub device_saves: u64,
}

/// In-memory store. Data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStore {
    transfers: RwLock<HashMap<String, TransferRecord>>,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    audit: RwLock<Vec<AuditEntry>>,
    transfer_saves: AtomicU64,
    progress_writes: AtomicU64,
    audit_appends: AtomicU64,
    device_saves: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_counts(&self) -> WriteCounts {
        WriteCounts {
            transfer_saves: self.transfer_saves.load(Ordering::Relaxed),
            progress_writes: self.progress_writes.load(Ordering::Relaxed),
            audit_appends: self.audit_appends.load(Ordering::Relaxed),
            device_saves: self.device_saves.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_transfer(&self, record: &TransferRecord) -> Result<(), StoreError> {
        self.transfer_saves.fetch_add(1, Ordering::Relaxed);
        self.transfers
            .write()
            .await
            .insert(record.transfer_id.clone(), record.clone());
        Ok(())
    }

    async fn upsert_transfer_progress(
        &self,
        transfer_id: &str,
        completed_chunks: u32,
        bytes_transferred: u64,
    ) -> Result<(), StoreError> {
        self.progress_writes.fetch_add(1, Ordering::Relaxed);
        let mut transfers = self.transfers.write().await;
        let record = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| StoreError::NotFound(transfer_id.to_string()))?;
        record.completed_chunks = completed_chunks;
        record.bytes_transferred = bytes_transferred;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn load_transfer(&self, transfer_id: &str) -> Result<Option<TransferRecord>, StoreError> {
        Ok(self.transfers.read().await.get(transfer_id).cloned())
    }

    async fn load_active_transfers(&self) -> Result<Vec<TransferRecord>, StoreError> {
        let mut active: Vec<_> = self
            .transfers
            .read()
            .await
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    async fn list_transfers(&self) -> Result<Vec<TransferRecord>, StoreError> {
        let mut all: Vec<_> = self.transfers.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.audit_appends.fetch_add(1, Ordering::Relaxed);
        self.audit.write().await.push(entry.clone());
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        let audit = self.audit.read().await;
        let skip = audit.len().saturating_sub(limit);
        Ok(audit[skip..].to_vec())
    }

    async fn save_device(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        self.device_saves.fetch_add(1, Ordering::Relaxed);
        self.devices
            .write()
            .await
            .insert(record.device_id.clone(), record.clone());
        Ok(())
    }

    async fn load_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.devices.read().await.values().cloned().collect())
    }

    async fn remove_device(&self, device_id: &str) -> Result<(), StoreError> {
        self.devices.write().await.remove(device_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::record::sample_record;
    use crate::transfer::{TransferDirection, TransferStatus};
    use zlink_security::AuditKind;

    #[tokio::test]
    async fn test_progress_requires_record() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.upsert_transfer_progress("missing", 1, 10).await,
            Err(StoreError::NotFound(_))
        ));

        let record = sample_record("t1", TransferStatus::Transferring, TransferDirection::Outbound);
        store.save_transfer(&record).await.unwrap();
        store.upsert_transfer_progress("t1", 4, 400).await.unwrap();

        let loaded = store.load_transfer("t1").await.unwrap().unwrap();
        assert_eq!(loaded.completed_chunks, 4);
        assert_eq!(loaded.bytes_transferred, 400);
        assert_eq!(store.write_counts().progress_writes, 2);
    }

    #[tokio::test]
    async fn test_active_excludes_terminal() {
        let store = InMemoryStore::new();
        for (id, status) in [
            ("a", TransferStatus::Paused),
            ("b", TransferStatus::Completed),
            ("c", TransferStatus::Requesting),
            ("d", TransferStatus::Cancelled),
        ] {
            store
                .save_transfer(&sample_record(id, status, TransferDirection::Inbound))
                .await
                .unwrap();
        }
        let mut ids: Vec<_> = store
            .load_active_transfers()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.transfer_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(store.list_transfers().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_audit_append_and_recent() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            let entry = AuditEntry::new(AuditKind::Dispatched, format!("m{}", i), None, "");
            store.append_audit(&entry).await.unwrap();
        }
        let recent = store.recent_audit(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].method, "m4");
    }
}
