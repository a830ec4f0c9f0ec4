//! zippy-link core runtime.
//!
//! This crate implements:
//! - Connection lifecycle with backoff reconnection and heartbeat liveness
//! - Request/response correlation with per-request timeouts
//! - Gated command dispatch (auth, permissions, rate limits, audit)
//! - Device registry
//! - Resumable chunked file transfer with checkpointed progress
//! - Persistent storage abstraction
//! - `PeerNode`, which wires all of the above together

#![forbid(unsafe_code)]

// Channel
pub mod messages;
pub mod connection;
pub mod rpc;

// Receiving side
pub mod dispatch;
pub mod devices;

// Transfers
pub mod transfer;

// Infrastructure
pub mod store;
pub mod errors;

// Composition
pub mod node;
pub mod harness;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, PeerInfo, ReconnectEvent};
pub use devices::{DeviceRecord, DeviceRegistry, DeviceStatus};
pub use dispatch::{CommandContext, CommandHandler, Dispatcher, GatewayConfig, HandlerError};
pub use errors::{CoreError, ErrorCode};
pub use messages::{ChunkMessage, CommandEnvelope, CommandResponse, ErrorBody, PeerEvent, WireMessage};
pub use node::{NodeConfig, PeerNode};
pub use rpc::{PendingRequests, RpcCorrelator};
pub use store::{InMemoryStore, Store, StoreError};
pub use transfer::{TransferConfig, TransferCoordinator, TransferDirection, TransferProgress, TransferRecord, TransferStatus};
