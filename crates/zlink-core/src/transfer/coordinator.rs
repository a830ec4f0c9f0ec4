//! Transfer coordinator.
//!
//! Drives both sides of the transfer protocol over the command channel:
//!
//! ```text
//! sender                                   receiver
//!   transfer:request {meta}          ->      record Requesting
//!                                    <-      transfer:accept {completedChunks}
//!   chunk 0..n (raw chunk messages)  ->      written to <temp_dir>/<id>.part
//!   transfer:complete {checksum}     ->      verify, move into download_dir
//! ```
//!
//! `transfer:pause`, `transfer:resume`, `transfer:cancel` and
//! `transfer:reject` keep the two records in step. A sender that gives up
//! sends `transfer:fail {reason}` so the receiver drops its partial file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::messages::{ChunkMessage, WireMessage};
use crate::rpc::RpcCorrelator;
use crate::store::Store;

use super::chunker::{self, bytes_for_chunks, chunk_len, total_chunks};
use super::progress::{CheckpointPolicy, ProgressTracker};
use super::record::{TransferDirection, TransferProgress, TransferRecord, TransferStatus};

const PROGRESS_CHANNEL_CAPACITY: usize = 256;
const CHUNK_RETRY_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Size of every chunk but the last
    pub chunk_size: u32,
    /// Failed chunk sends tolerated per transfer before it fails
    pub max_chunk_retries: u32,
    /// Where completed inbound files land
    pub download_dir: PathBuf,
    /// Where partial inbound files live
    pub temp_dir: PathBuf,
    /// Accept inbound requests without a local decision
    pub auto_accept: bool,
    pub max_file_size: u64,
    pub checkpoint: CheckpointPolicy,
    /// Timeout for transfer control commands
    pub command_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("zlink");
        Self {
            chunk_size: 64 * 1024,
            max_chunk_retries: 3,
            download_dir: base.join("downloads"),
            temp_dir: base.join("partial"),
            auto_accept: false,
            max_file_size: 4 * 1024 * 1024 * 1024,
            checkpoint: CheckpointPolicy::default(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Control parameters
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestParams {
    transfer_id: String,
    file_name: String,
    file_size: u64,
    checksum: String,
    chunk_size: u32,
    total_chunks: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdParams {
    transfer_id: String,
    #[serde(default)]
    completed_chunks: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailParams {
    transfer_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteParams {
    transfer_id: String,
    checksum: String,
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, CoreError> {
    serde_json::from_value(params).map_err(|e| CoreError::InvalidParams(e.to_string()))
}

/// Reduce a peer-supplied file name to its final component.
fn safe_file_name(name: &str) -> Result<String, CoreError> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if last.is_empty() || last == "." || last == ".." || last.contains('\0') {
        return Err(CoreError::InvalidParams(format!("bad file name {:?}", name)));
    }
    Ok(last.to_string())
}

/// First path in `dir` for `name` that does not exist yet.
async fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if tokio::fs::metadata(&candidate).await.is_err() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 1u32;
    loop {
        let file = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(file);
        if tokio::fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
        n += 1;
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct TransferCoordinator {
    config: TransferConfig,
    store: Arc<dyn Store>,
    rpc: Arc<RpcCorrelator>,
    records: Mutex<HashMap<String, TransferRecord>>,
    tasks: DashMap<String, (u64, CancellationToken)>,
    task_seq: AtomicU64,
    progress: ProgressTracker,
    progress_tx: broadcast::Sender<TransferProgress>,
    root: CancellationToken,
}

impl TransferCoordinator {
    pub fn new(config: TransferConfig, store: Arc<dyn Store>, rpc: Arc<RpcCorrelator>) -> Arc<Self> {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Arc::new(Self {
            progress: ProgressTracker::new(store.clone(), config.checkpoint.clone()),
            config,
            store,
            rpc,
            records: Mutex::new(HashMap::new()),
            tasks: DashMap::new(),
            task_seq: AtomicU64::new(0),
            progress_tx,
            root: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn get(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.records.lock().get(transfer_id).cloned()
    }

    /// Transfers known to this process, newest first.
    pub fn list(&self) -> Vec<TransferRecord> {
        let mut list: Vec<_> = self.records.lock().values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub fn progress_stream(&self) -> broadcast::Receiver<TransferProgress> {
        self.progress_tx.subscribe()
    }

    /// Number of running send tasks.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Write buffered progress updates.
    pub async fn flush_progress(&self) -> usize {
        self.progress.flush_pending().await
    }

    /// Stop every send task. The coordinator is unusable afterwards.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.tasks.clear();
    }

    // ------------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------------

    /// Offer `path` to the peer. Returns the new transfer id.
    pub async fn request_upload(self: &Arc<Self>, path: &Path) -> Result<String, CoreError> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(CoreError::InvalidParams(format!("{} is not a file", path.display())));
        }
        if meta.len() > self.config.max_file_size {
            return Err(CoreError::InvalidParams(format!(
                "file size {} exceeds limit {}",
                meta.len(),
                self.config.max_file_size
            )));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CoreError::InvalidParams(format!("{} has no file name", path.display())))?;
        let checksum = chunker::sha256_file(path).await?;

        let now = Utc::now();
        let record = TransferRecord {
            transfer_id: Uuid::new_v4().to_string(),
            peer_id: self.peer_id(),
            file_name,
            file_size: meta.len(),
            chunk_size: self.config.chunk_size,
            total_chunks: total_chunks(meta.len(), self.config.chunk_size),
            completed_chunks: 0,
            bytes_transferred: 0,
            status: TransferStatus::Requesting,
            checksum,
            direction: TransferDirection::Outbound,
            local_path: Some(path.to_path_buf()),
            temp_path: None,
            retry_count: 0,
            retryable: true,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let transfer_id = record.transfer_id.clone();
        self.records.lock().insert(transfer_id.clone(), record.clone());
        self.persist(&record).await?;

        info!(
            transfer_id = %transfer_id,
            file = %record.file_name,
            size = record.file_size,
            chunks = record.total_chunks,
            "requesting upload"
        );
        self.send_request(&record).await?;
        Ok(transfer_id)
    }

    /// Accept an inbound request and ask the sender to start.
    pub async fn accept_transfer(self: &Arc<Self>, transfer_id: &str) -> Result<(), CoreError> {
        let record = self.require(transfer_id, TransferDirection::Inbound)?;
        if record.status != TransferStatus::Requesting {
            return Err(CoreError::InvalidState(format!("transfer {} is {}", transfer_id, record.status)));
        }

        tokio::fs::create_dir_all(&self.config.temp_dir).await?;
        let temp_path = self.config.temp_dir.join(format!("{}.part", transfer_id));
        tokio::fs::File::create(&temp_path).await?;

        let record = self.transition(transfer_id, TransferStatus::Transferring, |r| {
            r.temp_path = Some(temp_path.clone());
            r.completed_chunks = 0;
            r.bytes_transferred = 0;
        })?;
        self.progress.begin(transfer_id, 0, 0);
        self.persist(&record).await?;

        let params = json!({ "transferId": transfer_id, "completedChunks": 0 });
        if let Err(e) = self.control("transfer:accept", params).await {
            warn!(transfer_id = %transfer_id, error = %e, "accept not delivered");
            self.pause_locally(transfer_id).await;
            return Err(e);
        }
        info!(transfer_id = %transfer_id, "transfer accepted");
        Ok(())
    }

    pub async fn reject_transfer(&self, transfer_id: &str) -> Result<(), CoreError> {
        let record = self.require(transfer_id, TransferDirection::Inbound)?;
        if record.status != TransferStatus::Requesting {
            return Err(CoreError::InvalidState(format!("transfer {} is {}", transfer_id, record.status)));
        }
        let record = self.transition(transfer_id, TransferStatus::Rejected, |_| {})?;
        self.persist(&record).await?;
        self.notify("transfer:reject", transfer_id).await;
        Ok(())
    }

    pub async fn pause_transfer(&self, transfer_id: &str) -> Result<(), CoreError> {
        let record = self.get(transfer_id).ok_or_else(|| not_found(transfer_id))?;
        if record.status != TransferStatus::Transferring {
            return Err(CoreError::InvalidState(format!("transfer {} is {}", transfer_id, record.status)));
        }
        self.pause_locally(transfer_id).await;
        self.notify("transfer:pause", transfer_id).await;
        Ok(())
    }

    /// Continue a paused transfer from the last chunk the receiver holds.
    pub async fn resume_transfer(self: &Arc<Self>, transfer_id: &str) -> Result<(), CoreError> {
        let record = self.get(transfer_id).ok_or_else(|| not_found(transfer_id))?;
        if record.status != TransferStatus::Paused {
            return Err(CoreError::InvalidState(format!("transfer {} is {}", transfer_id, record.status)));
        }
        if !record.can_resume() {
            return Err(CoreError::InvalidState(format!("transfer {} cannot be resumed", transfer_id)));
        }

        match record.direction {
            TransferDirection::Outbound => {
                let reply = self
                    .control("transfer:resume", json!({ "transferId": transfer_id }))
                    .await?;
                let from = resume_point(&reply)?;
                self.start_sending(transfer_id, from).await
            }
            TransferDirection::Inbound => {
                let record = self.transition(transfer_id, TransferStatus::Transferring, |_| {})?;
                self.progress
                    .begin(transfer_id, record.completed_chunks, record.bytes_transferred);
                self.persist(&record).await?;
                let params = json!({
                    "transferId": transfer_id,
                    "completedChunks": record.completed_chunks,
                });
                if let Err(e) = self.control("transfer:resume", params).await {
                    self.pause_locally(transfer_id).await;
                    return Err(e);
                }
                info!(transfer_id = %transfer_id, from = record.completed_chunks, "transfer resumed");
                Ok(())
            }
        }
    }

    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<(), CoreError> {
        self.cancel_locally(transfer_id, "cancelled locally").await?;
        self.notify("transfer:cancel", transfer_id).await;
        Ok(())
    }

    /// Re-offer a failed or cancelled outbound transfer from scratch.
    pub async fn retry_transfer(self: &Arc<Self>, transfer_id: &str) -> Result<(), CoreError> {
        let record = self.require(transfer_id, TransferDirection::Outbound)?;
        if !record.is_retry_eligible() {
            return Err(CoreError::InvalidState(format!(
                "transfer {} is {} and not retryable",
                transfer_id, record.status
            )));
        }
        let record = {
            let mut records = self.records.lock();
            let r = records.get_mut(transfer_id).ok_or_else(|| not_found(transfer_id))?;
            r.status = TransferStatus::Requesting;
            r.retry_count = 0;
            r.completed_chunks = 0;
            r.bytes_transferred = 0;
            r.error = None;
            r.updated_at = Utc::now();
            r.clone()
        };
        self.persist(&record).await?;
        info!(transfer_id = %transfer_id, "retrying transfer");
        self.send_request(&record).await
    }

    /// Reload unfinished transfers after a restart.
    ///
    /// Requests still awaiting acceptance are skipped. Transfers that were
    /// moving are marked Paused. Returns the candidates; callers check
    /// `can_resume()` before resuming.
    pub async fn recover(&self) -> Result<Vec<TransferRecord>, CoreError> {
        let active = self.store.load_active_transfers().await?;
        let mut candidates = Vec::new();
        for mut record in active {
            if record.status == TransferStatus::Requesting {
                continue;
            }
            if record.status == TransferStatus::Transferring {
                record.status = TransferStatus::Paused;
                record.updated_at = Utc::now();
                self.store.save_transfer(&record).await?;
            }
            self.records.lock().insert(record.transfer_id.clone(), record.clone());
            candidates.push(record);
        }
        info!(count = candidates.len(), "recovered transfers");
        Ok(candidates)
    }

    /// Stop all sending and park moving transfers as Paused.
    pub async fn on_connection_lost(&self) {
        for entry in self.tasks.iter() {
            entry.value().1.cancel();
        }
        self.tasks.clear();

        let paused: Vec<TransferRecord> = {
            let mut records = self.records.lock();
            records
                .values_mut()
                .filter(|r| r.status == TransferStatus::Transferring)
                .map(|r| {
                    r.status = TransferStatus::Paused;
                    r.updated_at = Utc::now();
                    r.clone()
                })
                .collect()
        };
        for record in &paused {
            self.progress.forget(&record.transfer_id);
            if let Err(e) = self.persist(record).await {
                warn!(transfer_id = %record.transfer_id, error = %e, "failed to persist paused transfer");
            }
        }
        if !paused.is_empty() {
            info!(count = paused.len(), "transfers paused after connection loss");
        }
    }

    // ------------------------------------------------------------------------
    // Peer commands
    // ------------------------------------------------------------------------

    /// Handle a `transfer:*` command from the peer.
    pub async fn handle_command(self: &Arc<Self>, method: &str, params: Value) -> Result<Value, CoreError> {
        match method {
            "transfer:request" => self.on_request(parse(params)?).await,
            "transfer:accept" => {
                let p: IdParams = parse(params)?;
                self.require(&p.transfer_id, TransferDirection::Outbound)?;
                self.start_sending(&p.transfer_id, p.completed_chunks.unwrap_or(0)).await?;
                Ok(json!({ "status": "transferring" }))
            }
            "transfer:reject" => {
                let p: IdParams = parse(params)?;
                self.require(&p.transfer_id, TransferDirection::Outbound)?;
                let record = self.transition(&p.transfer_id, TransferStatus::Rejected, |_| {})?;
                self.persist(&record).await?;
                info!(transfer_id = %p.transfer_id, "transfer rejected by peer");
                Ok(json!({ "status": "rejected" }))
            }
            "transfer:pause" => {
                let p: IdParams = parse(params)?;
                self.pause_locally(&p.transfer_id).await;
                Ok(json!({ "status": "paused" }))
            }
            "transfer:resume" => self.on_resume(parse(params)?).await,
            "transfer:cancel" => {
                let p: IdParams = parse(params)?;
                self.cancel_locally(&p.transfer_id, "cancelled by peer").await?;
                Ok(json!({ "status": "cancelled" }))
            }
            "transfer:complete" => self.on_complete(parse(params)?).await,
            "transfer:fail" => {
                let p: FailParams = parse(params)?;
                self.require(&p.transfer_id, TransferDirection::Inbound)?;
                self.stop_task(&p.transfer_id);
                let reason = p.reason.unwrap_or_else(|| "sender failed".into());
                self.fail(&p.transfer_id, &format!("peer: {}", reason)).await;
                let status = self.get(&p.transfer_id).map(|r| r.status).unwrap_or(TransferStatus::Failed);
                Ok(json!({ "status": status.as_str() }))
            }
            other => Err(CoreError::NotFound(format!("method {}", other))),
        }
    }

    /// Apply one chunk from the sender. Chunks must arrive in order;
    /// duplicates and gaps are dropped.
    pub async fn handle_chunk(&self, chunk: ChunkMessage) -> Result<(), CoreError> {
        let record = match self.get(&chunk.transfer_id) {
            Some(r) if r.direction == TransferDirection::Inbound && r.status == TransferStatus::Transferring => r,
            _ => {
                debug!(transfer_id = %chunk.transfer_id, index = chunk.chunk_index, "chunk ignored");
                return Ok(());
            }
        };
        if chunk.chunk_index != record.completed_chunks {
            debug!(
                transfer_id = %chunk.transfer_id,
                index = chunk.chunk_index,
                expected = record.completed_chunks,
                "out of order chunk dropped"
            );
            return Ok(());
        }
        let expected = chunk_len(record.file_size, record.chunk_size, chunk.chunk_index);
        if chunk.data.len() as u64 != expected {
            return Err(CoreError::InvalidParams(format!(
                "chunk {} of {} has {} bytes, expected {}",
                chunk.chunk_index,
                chunk.transfer_id,
                chunk.data.len(),
                expected
            )));
        }
        let temp_path = record
            .temp_path
            .clone()
            .ok_or_else(|| CoreError::InvalidState(format!("transfer {} has no temp file", record.transfer_id)))?;

        chunker::write_chunk(&temp_path, chunk.chunk_index, record.chunk_size, &chunk.data).await?;
        self.advance(&record.transfer_id, chunk.chunk_index + 1).await;
        Ok(())
    }

    async fn on_request(self: &Arc<Self>, p: RequestParams) -> Result<Value, CoreError> {
        let file_name = safe_file_name(&p.file_name)?;
        if p.chunk_size == 0 || p.total_chunks != total_chunks(p.file_size, p.chunk_size) {
            return Err(CoreError::InvalidParams("inconsistent chunk layout".into()));
        }
        if p.file_size > self.config.max_file_size {
            return Err(CoreError::InvalidParams(format!(
                "file size {} exceeds limit {}",
                p.file_size, self.config.max_file_size
            )));
        }

        let now = Utc::now();
        let record = TransferRecord {
            transfer_id: p.transfer_id.clone(),
            peer_id: self.peer_id(),
            file_name,
            file_size: p.file_size,
            chunk_size: p.chunk_size,
            total_chunks: p.total_chunks,
            completed_chunks: 0,
            bytes_transferred: 0,
            status: TransferStatus::Requesting,
            checksum: p.checksum,
            direction: TransferDirection::Inbound,
            local_path: None,
            temp_path: None,
            retry_count: 0,
            retryable: false,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let replaced = {
            let mut records = self.records.lock();
            let stale = match records.get(&p.transfer_id) {
                Some(existing) if existing.direction == TransferDirection::Outbound => {
                    return Err(CoreError::InvalidState(format!("transfer {} is one of ours", p.transfer_id)));
                }
                // A re-sent request supersedes whatever the sender left behind.
                Some(existing) if !existing.status.is_terminal() => Some(existing.temp_path.clone()),
                _ => None,
            };
            records.insert(p.transfer_id.clone(), record.clone());
            stale
        };
        if let Some(temp) = replaced {
            self.stop_task(&p.transfer_id);
            self.progress.forget(&p.transfer_id);
            if let Some(temp) = temp {
                let _ = tokio::fs::remove_file(&temp).await;
            }
            info!(transfer_id = %p.transfer_id, "unfinished inbound transfer replaced by a new request");
        }
        self.persist(&record).await?;
        info!(
            transfer_id = %record.transfer_id,
            file = %record.file_name,
            size = record.file_size,
            "inbound transfer requested"
        );

        if self.config.auto_accept {
            let this = self.clone();
            let id = record.transfer_id.clone();
            tokio::spawn(async move {
                if let Err(e) = this.accept_transfer(&id).await {
                    warn!(transfer_id = %id, error = %e, "auto-accept failed");
                }
            });
        }
        Ok(json!({ "status": "pending" }))
    }

    async fn on_resume(self: &Arc<Self>, p: IdParams) -> Result<Value, CoreError> {
        let record = self.get(&p.transfer_id).ok_or_else(|| not_found(&p.transfer_id))?;
        match record.direction {
            TransferDirection::Outbound => {
                let from = p
                    .completed_chunks
                    .ok_or_else(|| CoreError::InvalidParams("completedChunks required".into()))?;
                self.start_sending(&p.transfer_id, from).await?;
                Ok(json!({ "status": "transferring" }))
            }
            TransferDirection::Inbound => {
                if !record.can_resume() {
                    return Err(CoreError::InvalidState(format!("transfer {} cannot be resumed", p.transfer_id)));
                }
                let record = self.transition(&p.transfer_id, TransferStatus::Transferring, |_| {})?;
                self.progress
                    .begin(&p.transfer_id, record.completed_chunks, record.bytes_transferred);
                self.persist(&record).await?;
                info!(transfer_id = %p.transfer_id, from = record.completed_chunks, "sender resumed transfer");
                Ok(json!({ "completedChunks": record.completed_chunks }))
            }
        }
    }

    async fn on_complete(&self, p: CompleteParams) -> Result<Value, CoreError> {
        let record = self.require(&p.transfer_id, TransferDirection::Inbound)?;
        if record.status != TransferStatus::Transferring {
            return Err(CoreError::InvalidState(format!("transfer {} is {}", p.transfer_id, record.status)));
        }
        let temp_path = record
            .temp_path
            .clone()
            .ok_or_else(|| CoreError::InvalidState(format!("transfer {} has no temp file", p.transfer_id)))?;

        if !record.is_complete() {
            let reason = format!("{} of {} chunks received", record.completed_chunks, record.total_chunks);
            self.fail(&p.transfer_id, &reason).await;
            return Err(CoreError::InvalidState(reason));
        }
        let actual = chunker::sha256_file(&temp_path).await?;
        if actual != record.checksum || p.checksum != record.checksum {
            let _ = tokio::fs::remove_file(&temp_path).await;
            self.fail(&p.transfer_id, "checksum mismatch").await;
            return Err(CoreError::InvalidState("checksum mismatch".into()));
        }

        tokio::fs::create_dir_all(&self.config.download_dir).await?;
        let destination = unique_destination(&self.config.download_dir, &record.file_name).await;
        if tokio::fs::rename(&temp_path, &destination).await.is_err() {
            tokio::fs::copy(&temp_path, &destination).await?;
            tokio::fs::remove_file(&temp_path).await?;
        }

        let record = self.transition(&p.transfer_id, TransferStatus::Completed, |r| {
            r.local_path = Some(destination.clone());
            r.temp_path = None;
        })?;
        self.progress.forget(&p.transfer_id);
        self.persist(&record).await?;
        info!(transfer_id = %p.transfer_id, path = %destination.display(), "transfer completed");
        Ok(json!({ "status": "completed" }))
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    async fn send_request(&self, record: &TransferRecord) -> Result<(), CoreError> {
        let params = RequestParams {
            transfer_id: record.transfer_id.clone(),
            file_name: record.file_name.clone(),
            file_size: record.file_size,
            checksum: record.checksum.clone(),
            chunk_size: record.chunk_size,
            total_chunks: record.total_chunks,
        };
        let params = serde_json::to_value(params).map_err(|e| CoreError::Internal(e.to_string()))?;
        if let Err(e) = self.control("transfer:request", params).await {
            self.fail(&record.transfer_id, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    async fn start_sending(self: &Arc<Self>, transfer_id: &str, from: u32) -> Result<(), CoreError> {
        let record = self.require(transfer_id, TransferDirection::Outbound)?;
        if from > record.total_chunks {
            return Err(CoreError::InvalidParams(format!(
                "resume point {} beyond {} chunks",
                from, record.total_chunks
            )));
        }
        let record = self.transition(transfer_id, TransferStatus::Transferring, |r| {
            r.completed_chunks = from;
            r.bytes_transferred = bytes_for_chunks(r.file_size, r.chunk_size, from);
        })?;
        self.progress
            .begin(transfer_id, record.completed_chunks, record.bytes_transferred);
        self.persist(&record).await?;

        let token = self.root.child_token();
        let seq = self.task_seq.fetch_add(1, Ordering::Relaxed);
        if let Some((_, (_, previous))) = self.tasks.remove(transfer_id) {
            previous.cancel();
        }
        self.tasks.insert(transfer_id.to_string(), (seq, token.clone()));

        let this = self.clone();
        let id = transfer_id.to_string();
        tokio::spawn(async move {
            this.send_loop(&id, from, token).await;
            this.tasks.remove_if(&id, |_, (s, _)| *s == seq);
        });
        Ok(())
    }

    async fn send_loop(&self, transfer_id: &str, from: u32, token: CancellationToken) {
        let Some(record) = self.get(transfer_id) else { return };
        let Some(path) = record.local_path.clone() else {
            self.abort_outbound(transfer_id, "missing source file").await;
            return;
        };
        debug!(transfer_id = %transfer_id, from, total = record.total_chunks, "send task started");

        for index in from..record.total_chunks {
            if token.is_cancelled() {
                return;
            }
            let data = match chunker::read_chunk(&path, index, record.chunk_size).await {
                Ok(data) => data,
                Err(e) => {
                    self.abort_outbound(transfer_id, &format!("read chunk {}: {}", index, e)).await;
                    return;
                }
            };
            let message = WireMessage::Chunk(ChunkMessage {
                transfer_id: transfer_id.to_string(),
                chunk_index: index,
                data,
            });

            loop {
                let sent = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    sent = self.rpc.connection().send_message(&message) => sent,
                };
                match sent {
                    Ok(()) => break,
                    Err(e) => {
                        if token.is_cancelled() || !self.rpc.connection().is_connected() {
                            return;
                        }
                        let retries = self.bump_retries(transfer_id);
                        if retries > self.config.max_chunk_retries {
                            self.abort_outbound(transfer_id, &format!("chunk {}: {}", index, e)).await;
                            return;
                        }
                        warn!(transfer_id = %transfer_id, index, retries, error = %e, "chunk send failed, retrying");
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(CHUNK_RETRY_DELAY * retries) => {}
                        }
                    }
                }
            }
            self.advance(transfer_id, index + 1).await;
        }

        if token.is_cancelled() {
            return;
        }
        let params = json!({ "transferId": transfer_id, "checksum": record.checksum });
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            result = self.control("transfer:complete", params) => result,
        };
        match result {
            Ok(_) => match self.transition(transfer_id, TransferStatus::Completed, |_| {}) {
                Ok(record) => {
                    self.progress.forget(transfer_id);
                    if let Err(e) = self.persist(&record).await {
                        warn!(transfer_id = %transfer_id, error = %e, "failed to persist completion");
                    }
                    info!(transfer_id = %transfer_id, "upload completed");
                }
                Err(e) => debug!(transfer_id = %transfer_id, error = %e, "completion after state change"),
            },
            Err(e) => {
                if token.is_cancelled() {
                    return;
                }
                self.abort_outbound(transfer_id, &e.to_string()).await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Record helpers
    // ------------------------------------------------------------------------

    fn peer_id(&self) -> String {
        self.rpc
            .connection()
            .peer_info()
            .map(|p| p.peer_id.to_string())
            .unwrap_or_default()
    }

    fn require(&self, transfer_id: &str, direction: TransferDirection) -> Result<TransferRecord, CoreError> {
        let record = self.get(transfer_id).ok_or_else(|| not_found(transfer_id))?;
        if record.direction != direction {
            return Err(CoreError::InvalidState(format!(
                "transfer {} is {}",
                transfer_id,
                record.direction.as_str()
            )));
        }
        Ok(record)
    }

    /// Move a transfer to `next` if the state machine allows it.
    fn transition<F>(&self, transfer_id: &str, next: TransferStatus, mutate: F) -> Result<TransferRecord, CoreError>
    where
        F: FnOnce(&mut TransferRecord),
    {
        let mut records = self.records.lock();
        let record = records.get_mut(transfer_id).ok_or_else(|| not_found(transfer_id))?;
        if record.status.is_terminal() || (record.status != next && !record.status.can_transition_to(next)) {
            return Err(CoreError::InvalidState(format!(
                "transfer {} cannot go from {} to {}",
                transfer_id, record.status, next
            )));
        }
        record.status = next;
        mutate(record);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn persist(&self, record: &TransferRecord) -> Result<(), CoreError> {
        self.store.save_transfer(record).await?;
        let _ = self.progress_tx.send(TransferProgress::from(record));
        Ok(())
    }

    /// Record `completed` chunks and checkpoint progress.
    async fn advance(&self, transfer_id: &str, completed: u32) {
        let record = {
            let mut records = self.records.lock();
            let Some(r) = records.get_mut(transfer_id) else { return };
            if r.status.is_terminal() {
                return;
            }
            r.completed_chunks = completed;
            r.bytes_transferred = bytes_for_chunks(r.file_size, r.chunk_size, completed);
            r.updated_at = Utc::now();
            r.clone()
        };
        if let Err(e) = self
            .progress
            .update(transfer_id, record.completed_chunks, record.total_chunks, record.bytes_transferred)
            .await
        {
            warn!(transfer_id = %transfer_id, error = %e, "progress write failed");
        }
        let _ = self.progress_tx.send(TransferProgress::from(&record));
    }

    fn bump_retries(&self, transfer_id: &str) -> u32 {
        let mut records = self.records.lock();
        match records.get_mut(transfer_id) {
            Some(r) => {
                r.retry_count += 1;
                r.retry_count
            }
            None => u32::MAX,
        }
    }

    async fn fail(&self, transfer_id: &str, reason: &str) {
        let retryable = self.get(transfer_id).map(|r| r.direction == TransferDirection::Outbound);
        match self.transition(transfer_id, TransferStatus::Failed, |r| {
            r.error = Some(reason.to_string());
            r.retryable = retryable.unwrap_or(false);
        }) {
            Ok(record) => {
                warn!(transfer_id = %transfer_id, reason = %reason, "transfer failed");
                self.progress.forget(transfer_id);
                if record.direction == TransferDirection::Inbound {
                    if let Some(temp) = &record.temp_path {
                        let _ = tokio::fs::remove_file(temp).await;
                    }
                }
                if let Err(e) = self.persist(&record).await {
                    warn!(transfer_id = %transfer_id, error = %e, "failed to persist failure");
                }
            }
            Err(e) => debug!(transfer_id = %transfer_id, error = %e, "failure not recorded"),
        }
    }

    /// Fail an upload and tell the receiver, so it does not sit on a
    /// partial file waiting for chunks that will never come.
    async fn abort_outbound(&self, transfer_id: &str, reason: &str) {
        self.fail(transfer_id, reason).await;
        let params = json!({ "transferId": transfer_id, "reason": reason });
        if let Err(e) = self.control("transfer:fail", params).await {
            debug!(transfer_id = %transfer_id, error = %e, "peer not told about failure");
        }
    }

    async fn pause_locally(&self, transfer_id: &str) {
        self.stop_task(transfer_id);
        self.progress.flush(transfer_id).await;
        match self.transition(transfer_id, TransferStatus::Paused, |_| {}) {
            Ok(record) => {
                if let Err(e) = self.persist(&record).await {
                    warn!(transfer_id = %transfer_id, error = %e, "failed to persist pause");
                }
                info!(transfer_id = %transfer_id, completed = record.completed_chunks, "transfer paused");
            }
            Err(e) => debug!(transfer_id = %transfer_id, error = %e, "pause ignored"),
        }
    }

    async fn cancel_locally(&self, transfer_id: &str, reason: &str) -> Result<(), CoreError> {
        self.stop_task(transfer_id);
        let record = self.transition(transfer_id, TransferStatus::Cancelled, |r| {
            r.error = Some(reason.to_string());
        })?;
        self.progress.forget(transfer_id);
        if let Some(temp) = &record.temp_path {
            let _ = tokio::fs::remove_file(temp).await;
        }
        self.persist(&record).await?;
        info!(transfer_id = %transfer_id, reason = %reason, "transfer cancelled");
        Ok(())
    }

    fn stop_task(&self, transfer_id: &str) {
        if let Some((_, (_, token))) = self.tasks.remove(transfer_id) {
            token.cancel();
        }
    }

    async fn control(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        self.rpc
            .send_command_raw(method, params, Some(self.config.command_timeout))
            .await
    }

    /// Tell the peer about a local decision. Failures are logged only.
    async fn notify(&self, method: &str, transfer_id: &str) {
        if let Err(e) = self.control(method, json!({ "transferId": transfer_id })).await {
            debug!(transfer_id = %transfer_id, method = %method, error = %e, "peer not notified");
        }
    }
}

fn not_found(transfer_id: &str) -> CoreError {
    CoreError::NotFound(format!("transfer {}", transfer_id))
}

/// Chunk index the receiver wants next, from its `transfer:resume` reply.
fn resume_point(reply: &Value) -> Result<u32, CoreError> {
    let completed = reply
        .get("completedChunks")
        .and_then(Value::as_u64)
        .ok_or_else(|| CoreError::Decode("resume reply without completedChunks".into()))?;
    u32::try_from(completed).map_err(|_| CoreError::Decode(format!("resume point {} out of range", completed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionManager};
    use crate::store::InMemoryStore;
    use crate::transfer::record::sample_record;
    use zlink_security::Ed25519Signer;
    use zlink_transport::testing::MockTransport;

    fn coordinator(config: TransferConfig) -> (Arc<TransferCoordinator>, Arc<InMemoryStore>) {
        let transport = Arc::new(MockTransport::new());
        let connection = ConnectionManager::new(transport, ConnectionConfig::default());
        let rpc = Arc::new(RpcCorrelator::new(connection, Arc::new(Ed25519Signer::generate())));
        let store = Arc::new(InMemoryStore::new());
        (TransferCoordinator::new(config, store.clone(), rpc), store)
    }

    fn request(id: &str, name: &str, size: u64) -> Value {
        json!({
            "transferId": id,
            "fileName": name,
            "fileSize": size,
            "checksum": "00",
            "chunkSize": 100,
            "totalChunks": total_chunks(size, 100),
        })
    }

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("report.pdf").unwrap(), "report.pdf");
        assert_eq!(safe_file_name("a/b/c.txt").unwrap(), "c.txt");
        assert_eq!(safe_file_name("C:\\x\\y.bin").unwrap(), "y.bin");
        assert!(safe_file_name("dir/").is_err());
        assert!(safe_file_name("..").is_err());
    }

    #[tokio::test]
    async fn test_unique_destination() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_destination(dir.path(), "a.txt").await, dir.path().join("a.txt"));
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a (1).txt"), b"x").unwrap();
        assert_eq!(unique_destination(dir.path(), "a.txt").await, dir.path().join("a (2).txt"));
    }

    #[tokio::test]
    async fn test_inbound_request_and_validation() {
        let (coord, store) = coordinator(TransferConfig {
            max_file_size: 1_000,
            ..TransferConfig::default()
        });

        let reply = coord
            .handle_command("transfer:request", request("t1", "../../etc/x.bin", 250))
            .await
            .unwrap();
        assert_eq!(reply["status"], "pending");
        let record = coord.get("t1").unwrap();
        assert_eq!(record.file_name, "x.bin");
        assert_eq!(record.status, TransferStatus::Requesting);
        assert_eq!(record.direction, TransferDirection::Inbound);
        assert!(store.load_transfer("t1").await.unwrap().is_some());

        coord
            .records
            .lock()
            .insert("mine".into(), sample_record("mine", TransferStatus::Failed, TransferDirection::Outbound));
        assert!(matches!(
            coord.handle_command("transfer:request", request("mine", "x.bin", 250)).await,
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(
            coord.handle_command("transfer:request", request("t2", "big.bin", 5_000)).await,
            Err(CoreError::InvalidParams(_))
        ));
        let mut bad = request("t3", "x.bin", 250);
        bad["totalChunks"] = json!(7);
        assert!(matches!(
            coord.handle_command("transfer:request", bad).await,
            Err(CoreError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_repeated_request_replaces_unfinished_inbound() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, store) = coordinator(TransferConfig {
            temp_dir: dir.path().to_path_buf(),
            ..TransferConfig::default()
        });
        let temp = dir.path().join("t1.part");
        std::fs::write(&temp, b"stale").unwrap();
        let mut record = sample_record("t1", TransferStatus::Paused, TransferDirection::Inbound);
        record.completed_chunks = 1;
        record.temp_path = Some(temp.clone());
        coord.records.lock().insert("t1".into(), record);

        let reply = coord
            .handle_command("transfer:request", request("t1", "x.bin", 250))
            .await
            .unwrap();
        assert_eq!(reply["status"], "pending");
        let record = coord.get("t1").unwrap();
        assert_eq!(record.status, TransferStatus::Requesting);
        assert_eq!(record.completed_chunks, 0);
        assert!(record.temp_path.is_none());
        assert!(!temp.exists());
        assert_eq!(
            store.load_transfer("t1").await.unwrap().unwrap().status,
            TransferStatus::Requesting
        );
    }

    #[tokio::test]
    async fn test_sender_failure_fails_inbound_and_drops_partial() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, store) = coordinator(TransferConfig {
            temp_dir: dir.path().to_path_buf(),
            ..TransferConfig::default()
        });
        let temp = dir.path().join("t.part");
        std::fs::write(&temp, vec![0u8; 100]).unwrap();
        let mut record = sample_record("t", TransferStatus::Transferring, TransferDirection::Inbound);
        record.temp_path = Some(temp.clone());
        coord.records.lock().insert("t".into(), record);

        let reply = coord
            .handle_command("transfer:fail", json!({ "transferId": "t", "reason": "read chunk 1: gone" }))
            .await
            .unwrap();
        assert_eq!(reply["status"], "failed");

        let record = coord.get("t").unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
        assert!(!record.retryable);
        assert!(record.error.as_deref().unwrap().contains("read chunk 1: gone"));
        assert!(!temp.exists());
        assert_eq!(
            store.load_transfer("t").await.unwrap().unwrap().status,
            TransferStatus::Failed
        );

        coord
            .records
            .lock()
            .insert("up".into(), sample_record("up", TransferStatus::Transferring, TransferDirection::Outbound));
        assert!(coord
            .handle_command("transfer:fail", json!({ "transferId": "up" }))
            .await
            .is_err());
        assert_eq!(coord.get("up").unwrap().status, TransferStatus::Transferring);
    }

    #[test]
    fn test_resume_point() {
        assert_eq!(resume_point(&json!({ "completedChunks": 7 })).unwrap(), 7);
        assert!(matches!(resume_point(&json!({})), Err(CoreError::Decode(_))));
        assert!(matches!(
            resume_point(&json!({ "completedChunks": u64::from(u32::MAX) + 1 })),
            Err(CoreError::Decode(_))
        ));
        assert!(matches!(
            resume_point(&json!({ "completedChunks": -1 })),
            Err(CoreError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_in_order_chunks_only() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _) = coordinator(TransferConfig {
            temp_dir: dir.path().to_path_buf(),
            ..TransferConfig::default()
        });
        let temp = dir.path().join("t.part");
        std::fs::write(&temp, b"").unwrap();
        let mut record = sample_record("t", TransferStatus::Transferring, TransferDirection::Inbound);
        record.file_size = 250;
        record.total_chunks = 3;
        record.temp_path = Some(temp.clone());
        coord.records.lock().insert("t".into(), record);

        let chunk = |i: u32, len: usize| ChunkMessage {
            transfer_id: "t".into(),
            chunk_index: i,
            data: vec![i as u8; len],
        };
        coord.handle_chunk(chunk(1, 100)).await.unwrap();
        assert_eq!(coord.get("t").unwrap().completed_chunks, 0);
        coord.handle_chunk(chunk(0, 100)).await.unwrap();
        coord.handle_chunk(chunk(0, 100)).await.unwrap();
        coord.handle_chunk(chunk(1, 100)).await.unwrap();
        assert!(coord.handle_chunk(chunk(2, 10)).await.is_err());
        coord.handle_chunk(chunk(2, 50)).await.unwrap();

        let record = coord.get("t").unwrap();
        assert_eq!(record.completed_chunks, 3);
        assert_eq!(record.bytes_transferred, 250);
        assert_eq!(std::fs::read(&temp).unwrap().len(), 250);
    }

    #[tokio::test]
    async fn test_recover_pauses_and_skips_requesting() {
        let (coord, store) = coordinator(TransferConfig::default());
        for (id, status) in [
            ("moving", TransferStatus::Transferring),
            ("waiting", TransferStatus::Requesting),
            ("paused", TransferStatus::Paused),
            ("done", TransferStatus::Completed),
        ] {
            store
                .save_transfer(&sample_record(id, status, TransferDirection::Outbound))
                .await
                .unwrap();
        }

        let mut ids: Vec<_> = coord.recover().await.unwrap().into_iter().map(|r| r.transfer_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["moving", "paused"]);
        assert_eq!(coord.get("moving").unwrap().status, TransferStatus::Paused);
        assert_eq!(
            store.load_transfer("moving").await.unwrap().unwrap().status,
            TransferStatus::Paused
        );
        assert!(coord.get("waiting").is_none());
    }

    #[tokio::test]
    async fn test_retry_requires_eligible_outbound() {
        let (coord, _) = coordinator(TransferConfig::default());
        let mut record = sample_record("t", TransferStatus::Completed, TransferDirection::Outbound);
        record.retryable = true;
        coord.records.lock().insert("t".into(), record);
        assert!(matches!(coord.retry_transfer("t").await, Err(CoreError::InvalidState(_))));

        let mut inbound = sample_record("u", TransferStatus::Failed, TransferDirection::Inbound);
        inbound.retryable = true;
        coord.records.lock().insert("u".into(), inbound);
        assert!(matches!(coord.retry_transfer("u").await, Err(CoreError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_retry_resets_counter_and_requests_again() {
        let (coord, _) = coordinator(TransferConfig::default());
        let mut record = sample_record("t", TransferStatus::Failed, TransferDirection::Outbound);
        record.retryable = true;
        record.retry_count = 4;
        record.completed_chunks = 6;
        coord.records.lock().insert("t".into(), record);

        // Not connected, so the re-request fails and the transfer fails again.
        assert!(matches!(coord.retry_transfer("t").await, Err(CoreError::NotConnected)));
        let record = coord.get("t").unwrap();
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.completed_chunks, 0);
        assert_eq!(record.status, TransferStatus::Failed);
        assert!(record.is_retry_eligible());
    }

    #[tokio::test]
    async fn test_connection_lost_pauses_transferring() {
        let (coord, store) = coordinator(TransferConfig::default());
        let record = sample_record("t", TransferStatus::Transferring, TransferDirection::Inbound);
        store.save_transfer(&record).await.unwrap();
        coord.records.lock().insert("t".into(), record);
        let mut progress = coord.progress_stream();

        coord.on_connection_lost().await;
        assert_eq!(coord.get("t").unwrap().status, TransferStatus::Paused);
        assert_eq!(progress.recv().await.unwrap().status, TransferStatus::Paused);
        assert_eq!(store.load_transfer("t").await.unwrap().unwrap().status, TransferStatus::Paused);
    }

    #[tokio::test]
    async fn test_terminal_records_are_immutable() {
        let (coord, _) = coordinator(TransferConfig::default());
        coord.records.lock().insert(
            "t".into(),
            sample_record("t", TransferStatus::Rejected, TransferDirection::Inbound),
        );
        assert!(coord.transition("t", TransferStatus::Transferring, |_| {}).is_err());
        assert!(matches!(coord.cancel_transfer("t").await, Err(CoreError::InvalidState(_))));
        assert!(matches!(coord.pause_transfer("t").await, Err(CoreError::InvalidState(_))));
    }
}
