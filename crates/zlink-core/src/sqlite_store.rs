//! SQLite-based persistent storage.
//!
//! Uses WAL mode and versioned migrations. The connection sits behind an
//! async mutex; each call runs one short statement.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use zlink_security::{AuditEntry, AuditKind, PermissionLevel};

use crate::devices::{DeviceRecord, DeviceStatus};
use crate::store::{Store, StoreError};
use crate::transfer::{TransferDirection, TransferRecord, TransferStatus};

// ============================================================================
// Schema Version
// ============================================================================

/// Current schema version. Increment when adding a migration.
const SCHEMA_VERSION: i32 = 1;

const TRANSFER_COLUMNS: &str = "transfer_id, peer_id, file_name, file_size, chunk_size, total_chunks, \
     completed_chunks, bytes_transferred, status, checksum, direction, local_path, temp_path, \
     retry_count, retryable, error, created_at, updated_at";

// ============================================================================
// SQLite Store Implementation
// ============================================================================

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::OperationFailed(format!("failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::OperationFailed(format!("failed to set pragmas: {}", e)))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::OperationFailed(format!("failed to open in-memory database: {}", e)))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to create schema_version: {}", e)))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
            .map_err(|e| StoreError::OperationFailed(format!("failed to read schema version: {}", e)))?;

        if current_version > SCHEMA_VERSION {
            return Err(StoreError::DataCorruption(format!(
                "database schema v{} is newer than supported v{}",
                current_version, SCHEMA_VERSION
            )));
        }
        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }

        Ok(())
    }

    /// Migration to schema version 1 - initial schema.
    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                transfer_id TEXT PRIMARY KEY,
                peer_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                chunk_size INTEGER NOT NULL,
                total_chunks INTEGER NOT NULL,
                completed_chunks INTEGER NOT NULL,
                bytes_transferred INTEGER NOT NULL,
                status TEXT NOT NULL,
                checksum TEXT NOT NULL,
                direction TEXT NOT NULL,
                local_path TEXT,
                temp_path TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retryable INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers(status);

            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                identity TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                permission_level TEXT NOT NULL,
                trusted INTEGER NOT NULL,
                first_seen_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                kind TEXT NOT NULL,
                method TEXT NOT NULL,
                identity TEXT,
                detail TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);

            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| StoreError::OperationFailed(format!("migration v1 failed: {}", e)))?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Row mapping
    // -------------------------------------------------------------------------

    fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| StoreError::DataCorruption(format!("bad timestamp {}", ms)))
    }

    fn transfer_from_row(row: &Row<'_>) -> rusqlite::Result<Result<TransferRecord, StoreError>> {
        let status: String = row.get(8)?;
        let direction: String = row.get(10)?;
        let local_path: Option<String> = row.get(11)?;
        let temp_path: Option<String> = row.get(12)?;
        let created_at: i64 = row.get(16)?;
        let updated_at: i64 = row.get(17)?;

        let build = || -> Result<TransferRecord, StoreError> {
            Ok(TransferRecord {
                transfer_id: row.get(0).map_err(sql_err)?,
                peer_id: row.get(1).map_err(sql_err)?,
                file_name: row.get(2).map_err(sql_err)?,
                file_size: row.get::<_, i64>(3).map_err(sql_err)? as u64,
                chunk_size: row.get::<_, i64>(4).map_err(sql_err)? as u32,
                total_chunks: row.get::<_, i64>(5).map_err(sql_err)? as u32,
                completed_chunks: row.get::<_, i64>(6).map_err(sql_err)? as u32,
                bytes_transferred: row.get::<_, i64>(7).map_err(sql_err)? as u64,
                status: TransferStatus::parse(&status)
                    .ok_or_else(|| StoreError::DataCorruption(format!("unknown transfer status {}", status)))?,
                checksum: row.get(9).map_err(sql_err)?,
                direction: TransferDirection::parse(&direction)
                    .ok_or_else(|| StoreError::DataCorruption(format!("unknown direction {}", direction)))?,
                local_path: local_path.map(PathBuf::from),
                temp_path: temp_path.map(PathBuf::from),
                retry_count: row.get::<_, i64>(13).map_err(sql_err)? as u32,
                retryable: row.get::<_, i64>(14).map_err(sql_err)? != 0,
                error: row.get(15).map_err(sql_err)?,
                created_at: Self::from_millis(created_at)?,
                updated_at: Self::from_millis(updated_at)?,
            })
        };
        Ok(build())
    }

    fn query_transfers(conn: &Connection, sql: &str) -> Result<Vec<TransferRecord>, StoreError> {
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        let rows = stmt
            .query_map([], Self::transfer_from_row)
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sql_err)??);
        }
        Ok(out)
    }
}

fn sql_err(e: rusqlite::Error) -> StoreError {
    StoreError::OperationFailed(e.to_string())
}

fn path_str(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

// ============================================================================
// Store Trait Implementation
// ============================================================================

#[async_trait]
impl Store for SqliteStore {
    // -------------------------------------------------------------------------
    // Transfers
    // -------------------------------------------------------------------------

    async fn save_transfer(&self, r: &TransferRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO transfers ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                TRANSFER_COLUMNS
            ),
            params![
                r.transfer_id,
                r.peer_id,
                r.file_name,
                r.file_size as i64,
                r.chunk_size as i64,
                r.total_chunks as i64,
                r.completed_chunks as i64,
                r.bytes_transferred as i64,
                r.status.as_str(),
                r.checksum,
                r.direction.as_str(),
                path_str(&r.local_path),
                path_str(&r.temp_path),
                r.retry_count as i64,
                r.retryable as i64,
                r.error,
                r.created_at.timestamp_millis(),
                r.updated_at.timestamp_millis(),
            ],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to save transfer: {}", e)))?;
        Ok(())
    }

    async fn upsert_transfer_progress(
        &self,
        transfer_id: &str,
        completed_chunks: u32,
        bytes_transferred: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE transfers SET completed_chunks = ?2, bytes_transferred = ?3, updated_at = ?4
                 WHERE transfer_id = ?1",
                params![
                    transfer_id,
                    completed_chunks as i64,
                    bytes_transferred as i64,
                    Utc::now().timestamp_millis()
                ],
            )
            .map_err(|e| StoreError::OperationFailed(format!("failed to update progress: {}", e)))?;
        if updated == 0 {
            return Err(StoreError::NotFound(transfer_id.to_string()));
        }
        Ok(())
    }

    async fn load_transfer(&self, transfer_id: &str) -> Result<Option<TransferRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM transfers WHERE transfer_id = ?1", TRANSFER_COLUMNS),
                params![transfer_id],
                Self::transfer_from_row,
            )
            .optional()
            .map_err(|e| StoreError::OperationFailed(format!("failed to load transfer: {}", e)))?;
        row.transpose()
    }

    async fn load_active_transfers(&self) -> Result<Vec<TransferRecord>, StoreError> {
        let conn = self.conn.lock().await;
        Self::query_transfers(
            &conn,
            &format!(
                "SELECT {} FROM transfers
                 WHERE status NOT IN ('completed', 'failed', 'cancelled', 'rejected')
                 ORDER BY created_at ASC",
                TRANSFER_COLUMNS
            ),
        )
    }

    async fn list_transfers(&self) -> Result<Vec<TransferRecord>, StoreError> {
        let conn = self.conn.lock().await;
        Self::query_transfers(
            &conn,
            &format!("SELECT {} FROM transfers ORDER BY created_at DESC", TRANSFER_COLUMNS),
        )
    }

    // -------------------------------------------------------------------------
    // Audit
    // -------------------------------------------------------------------------

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_log (id, kind, method, identity, detail, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id.to_string(),
                entry.kind.as_str(),
                entry.method,
                entry.identity,
                entry.detail,
                entry.timestamp.timestamp_millis(),
            ],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to append audit entry: {}", e)))?;
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, kind, method, identity, detail, timestamp FROM audit_log
                 ORDER BY seq DESC LIMIT ?1",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(sql_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, kind, method, identity, detail, timestamp) = row.map_err(sql_err)?;
            entries.push(AuditEntry {
                id: Uuid::parse_str(&id).map_err(|e| StoreError::DataCorruption(e.to_string()))?,
                kind: AuditKind::parse(&kind)
                    .ok_or_else(|| StoreError::DataCorruption(format!("unknown audit kind {}", kind)))?,
                method,
                identity,
                detail,
                timestamp: Self::from_millis(timestamp)?,
            });
        }
        entries.reverse();
        Ok(entries)
    }

    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    async fn save_device(&self, d: &DeviceRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO devices
                (device_id, identity, status, permission_level, trusted, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                d.device_id,
                d.identity,
                d.status.as_str(),
                d.permission_level.as_str(),
                d.trusted as i64,
                d.first_seen_at.timestamp_millis(),
                d.last_seen_at.timestamp_millis(),
            ],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to save device: {}", e)))?;
        Ok(())
    }

    async fn load_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT device_id, identity, status, permission_level, trusted, first_seen_at, last_seen_at
                 FROM devices ORDER BY first_seen_at ASC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })
            .map_err(sql_err)?;

        let mut devices = Vec::new();
        for row in rows {
            let (device_id, identity, status, level, trusted, first_seen, last_seen) = row.map_err(sql_err)?;
            devices.push(DeviceRecord {
                device_id,
                identity,
                status: DeviceStatus::parse(&status)
                    .ok_or_else(|| StoreError::DataCorruption(format!("unknown device status {}", status)))?,
                permission_level: PermissionLevel::parse(&level)
                    .ok_or_else(|| StoreError::DataCorruption(format!("unknown permission level {}", level)))?,
                trusted: trusted != 0,
                first_seen_at: Self::from_millis(first_seen)?,
                last_seen_at: Self::from_millis(last_seen)?,
            });
        }
        Ok(devices)
    }

    async fn remove_device(&self, device_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM devices WHERE device_id = ?1", params![device_id])
            .map_err(|e| StoreError::OperationFailed(format!("failed to delete device: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::record::sample_record;

    #[tokio::test]
    async fn test_transfer_persistence() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut record = sample_record("t1", TransferStatus::Transferring, TransferDirection::Inbound);
        record.temp_path = Some(PathBuf::from("/tmp/t1.part"));
        record.retryable = true;
        store.save_transfer(&record).await.unwrap();

        store.upsert_transfer_progress("t1", 5, 500).await.unwrap();
        let loaded = store.load_transfer("t1").await.unwrap().unwrap();
        assert_eq!(loaded.completed_chunks, 5);
        assert_eq!(loaded.bytes_transferred, 500);
        assert_eq!(loaded.temp_path, record.temp_path);
        assert!(loaded.retryable);
        assert_eq!(loaded.status, TransferStatus::Transferring);

        assert!(matches!(
            store.upsert_transfer_progress("nope", 1, 1).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.load_transfer("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_transfers_filter() {
        let store = SqliteStore::new_in_memory().unwrap();
        store
            .save_transfer(&sample_record("a", TransferStatus::Paused, TransferDirection::Outbound))
            .await
            .unwrap();
        store
            .save_transfer(&sample_record("b", TransferStatus::Completed, TransferDirection::Outbound))
            .await
            .unwrap();

        let active = store.load_active_transfers().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].transfer_id, "a");
    }

    #[tokio::test]
    async fn test_devices_and_audit() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();
        let device = DeviceRecord {
            device_id: "d1".into(),
            identity: "ed25519:00".into(),
            status: DeviceStatus::Approved,
            permission_level: PermissionLevel::Admin,
            trusted: true,
            first_seen_at: now,
            last_seen_at: now,
        };
        store.save_device(&device).await.unwrap();
        let loaded = store.load_devices().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].permission_level, PermissionLevel::Admin);
        store.remove_device("d1").await.unwrap();
        assert!(store.load_devices().await.unwrap().is_empty());

        for i in 0..3 {
            store
                .append_audit(&AuditEntry::new(AuditKind::PermissionDenied, format!("m{}", i), None, "x"))
                .await
                .unwrap();
        }
        let recent = store.recent_audit(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].method, "m1");
        assert_eq!(recent[1].kind, AuditKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zlink.db");
        {
            let store = SqliteStore::new(&path).unwrap();
            store
                .save_transfer(&sample_record("keep", TransferStatus::Paused, TransferDirection::Outbound))
                .await
                .unwrap();
        }
        let store = SqliteStore::new(&path).unwrap();
        assert!(store.load_transfer("keep").await.unwrap().is_some());
    }
}
