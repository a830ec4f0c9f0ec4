//! Transfer records and their state machine.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-transfer status.
///
/// `Requesting` is the initial state on both sides until the receiver
/// accepts; `Completed`, `Failed`, `Cancelled` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Requesting,
    Transferring,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled | TransferStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Requesting => "requesting",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "requesting" => TransferStatus::Requesting,
            "transferring" => TransferStatus::Transferring,
            "paused" => TransferStatus::Paused,
            "completed" => TransferStatus::Completed,
            "failed" => TransferStatus::Failed,
            "cancelled" => TransferStatus::Cancelled,
            "rejected" => TransferStatus::Rejected,
            _ => return None,
        })
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Requesting, Transferring | Cancelled | Rejected | Failed) => true,
            (Transferring, Paused | Completed | Failed | Cancelled) => true,
            (Paused, Transferring | Cancelled | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the transfer this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Outbound => "outbound",
            TransferDirection::Inbound => "inbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outbound" => Some(TransferDirection::Outbound),
            "inbound" => Some(TransferDirection::Inbound),
            _ => None,
        }
    }
}

/// Persisted state of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub peer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    /// SHA-256 of the whole file, hex
    pub checksum: String,
    pub direction: TransferDirection,
    /// Source file (outbound) or final destination once completed (inbound)
    pub local_path: Option<PathBuf>,
    /// Partial data being received (inbound)
    pub temp_path: Option<PathBuf>,
    pub retry_count: u32,
    pub retryable: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn is_complete(&self) -> bool {
        self.completed_chunks >= self.total_chunks
    }

    /// True if the transfer can pick up where it left off: the file handle
    /// for this side still exists and chunks remain.
    pub fn can_resume(&self) -> bool {
        if self.status.is_terminal() || self.status == TransferStatus::Requesting {
            return false;
        }
        let handle = match self.direction {
            TransferDirection::Outbound => self.local_path.as_ref(),
            TransferDirection::Inbound => self.temp_path.as_ref(),
        };
        let handle_ok = handle.map(|p| p.is_file()).unwrap_or(false);
        handle_ok && self.completed_chunks < self.total_chunks
    }

    /// Terminal Failed/Cancelled transfers flagged retryable.
    pub fn is_retry_eligible(&self) -> bool {
        self.retryable && matches!(self.status, TransferStatus::Failed | TransferStatus::Cancelled)
    }

    pub fn progress_fraction(&self) -> f64 {
        if self.total_chunks == 0 {
            return if self.status == TransferStatus::Completed { 1.0 } else { 0.0 };
        }
        self.completed_chunks as f64 / self.total_chunks as f64
    }
}

/// Progress notification for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub transfer_id: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub bytes_transferred: u64,
    pub file_size: u64,
}

impl From<&TransferRecord> for TransferProgress {
    fn from(record: &TransferRecord) -> Self {
        Self {
            transfer_id: record.transfer_id.clone(),
            direction: record.direction,
            status: record.status,
            completed_chunks: record.completed_chunks,
            total_chunks: record.total_chunks,
            bytes_transferred: record.bytes_transferred,
            file_size: record.file_size,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_record(id: &str, status: TransferStatus, direction: TransferDirection) -> TransferRecord {
    let now = Utc::now();
    TransferRecord {
        transfer_id: id.to_string(),
        peer_id: "peer".to_string(),
        file_name: "file.bin".to_string(),
        file_size: 1000,
        chunk_size: 100,
        total_chunks: 10,
        completed_chunks: 0,
        bytes_transferred: 0,
        status,
        checksum: String::new(),
        direction,
        local_path: None,
        temp_path: None,
        retry_count: 0,
        retryable: false,
        error: None,
        created_at: now,
        updated_at: now,
    }
}
