//! Wire messages exchanged over the command channel.
//!
//! Messages are JSON objects tagged by `"type"`. Chunk payloads are
//! base64 encoded.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use zlink_security::AuthEnvelope;

use crate::errors::CoreError;

/// Every message that travels on the link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Command(CommandEnvelope),
    Response(CommandResponse),
    Heartbeat { timestamp: i64 },
    HeartbeatAck { timestamp: i64 },
    Event(PeerEvent),
    Chunk(ChunkMessage),
}

impl WireMessage {
    pub fn encode(&self) -> Result<Bytes, CoreError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Heartbeats and their acknowledgments reset the liveness timer.
    pub fn is_heartbeat_class(&self) -> bool {
        matches!(self, WireMessage::Heartbeat { .. } | WireMessage::HeartbeatAck { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Command(_) => "command",
            WireMessage::Response(_) => "response",
            WireMessage::Heartbeat { .. } => "heartbeat",
            WireMessage::HeartbeatAck { .. } => "heartbeat_ack",
            WireMessage::Event(_) => "event",
            WireMessage::Chunk(_) => "chunk",
        }
    }
}

/// Authenticated command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthEnvelope>,
}

/// `{id, result}` or `{id, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl CommandResponse {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: &CoreError) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.to_wire()),
        }
    }

    /// Application-level outcome. An embedded error becomes `CoreError::Remote`.
    pub fn into_result(self) -> Result<Value, CoreError> {
        match self.error {
            Some(body) => Err(CoreError::from_wire(&body)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Application event pushed by the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

/// One slice of a file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMessage {
    pub transfer_id: String,
    pub chunk_index: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
