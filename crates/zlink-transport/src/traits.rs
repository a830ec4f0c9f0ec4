//! Transport trait for the single logical command channel between two peers.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

use crate::framing::FramingError;

/// Stable identifier of a peer on the channel (its identity string).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Event delivered by a live link.
///
/// Replaces the `on_message` / `on_disconnect` callbacks of callback-style
/// transports: the receiver returned from [`Transport::connect`] yields these
/// until the link goes away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete inbound message
    Message(Bytes),
    /// The link was lost; no further events follow
    Disconnected { reason: String },
}

/// Receiving half of a connected link.
pub type LinkReceiver = mpsc::Receiver<TransportEvent>;

/// Opaque bidirectional byte-message channel to exactly one peer.
///
/// Implementations own NAT traversal, signaling and framing. A second
/// `connect` replaces any previous link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a link to `target`, announcing ourselves as `local`.
    async fn connect(&self, target: &PeerId, local: &PeerId) -> Result<LinkReceiver, TransportError>;

    /// Send one message on the current link
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Tear down the current link. Idempotent.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Whether a link is currently up
    fn is_connected(&self) -> bool;
}

/// Common transport error type
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("unexpected peer: expected {expected}, got {actual}")]
    UnexpectedPeer { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("other error: {0}")]
    Other(String),
}

impl Clone for TransportError {
    fn clone(&self) -> Self {
        match self {
            TransportError::Disconnected => TransportError::Disconnected,
            TransportError::ConnectionClosed => TransportError::ConnectionClosed,
            TransportError::ConnectFailed(s) => TransportError::ConnectFailed(s.clone()),
            TransportError::Timeout => TransportError::Timeout,
            TransportError::UnexpectedPeer { expected, actual } => TransportError::UnexpectedPeer {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            TransportError::Io(e) => TransportError::Other(format!("IO error: {}", e)),
            TransportError::Framing(e) => TransportError::Other(format!("framing error: {}", e)),
            TransportError::Other(s) => TransportError::Other(s.clone()),
        }
    }
}
