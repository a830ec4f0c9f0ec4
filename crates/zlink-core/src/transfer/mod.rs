//! Resumable chunked file transfer.
//!
//! - `record`: transfer records and the per-transfer state machine
//! - `chunker`: chunk arithmetic, chunk file IO and checksums
//! - `progress`: throttled progress checkpointing
//! - `coordinator`: the control protocol and transfer tasks

pub mod chunker;
pub mod coordinator;
pub mod progress;
pub mod record;

pub use coordinator::{TransferConfig, TransferCoordinator};
pub use progress::{CheckpointPolicy, ProgressTracker};
pub use record::{TransferDirection, TransferProgress, TransferRecord, TransferStatus};
