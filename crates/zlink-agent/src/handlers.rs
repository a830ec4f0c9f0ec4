//! Built-in command handlers.
//!
//! | Method              | Level         |
//! |---------------------|---------------|
//! | `system:ping`       | Public        |
//! | `system:status`     | Public        |
//! | `system:echo`       | Authenticated |
//! | `device:list`       | Admin         |
//! | `device:approve`    | Admin         |
//! | `device:set_level`  | Admin         |

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use zlink_core::{CommandContext, CommandHandler, HandlerError, PeerNode};
use zlink_security::PermissionLevel;

/// Register every built-in handler on `node`.
pub async fn register_builtin(node: &Arc<PeerNode>) {
    let dispatcher = node.dispatcher();

    dispatcher
        .register_fn("system:ping", |_, _| async {
            Ok::<_, HandlerError>(json!({ "pong": true, "timestamp": Utc::now().timestamp_millis() }))
        })
        .await;
    dispatcher
        .register_fn("system:echo", |_, params| async move { Ok::<_, HandlerError>(params) })
        .await;

    // Handlers reach the node weakly; the node owns the dispatcher.
    let weak = Arc::downgrade(node);
    dispatcher
        .register_handler("system:status", Arc::new(StatusHandler { node: weak.clone() }))
        .await;
    dispatcher
        .register_handler("device:list", Arc::new(DeviceList { node: weak.clone() }))
        .await;
    dispatcher
        .register_handler("device:approve", Arc::new(DeviceApprove { node: weak.clone() }))
        .await;
    dispatcher
        .register_handler("device:set_level", Arc::new(DeviceSetLevel { node: weak }))
        .await;
}

fn upgrade(node: &Weak<PeerNode>) -> Result<Arc<PeerNode>, HandlerError> {
    node.upgrade()
        .ok_or_else(|| HandlerError::InvalidState("node is shutting down".into()))
}

// ============================================================================
// system:status
// ============================================================================

struct StatusHandler {
    node: Weak<PeerNode>,
}

#[async_trait]
impl CommandHandler for StatusHandler {
    async fn handle(&self, _ctx: CommandContext, _params: Value) -> Result<Value, HandlerError> {
        let node = upgrade(&self.node)?;
        let connection = node.connection();
        let stats = connection.stats();
        let dispatch = node.dispatcher().stats().snapshot();

        Ok(json!({
            "identity": node.identity(),
            "state": connection.state().as_str(),
            "peer": connection.peer_info().map(|p| p.peer_id.to_string()),
            "connectedForMs": stats.connected_for.map(|d| d.as_millis() as u64),
            "messagesSent": stats.messages_sent,
            "messagesReceived": stats.messages_received,
            "bytesSent": stats.bytes_sent,
            "bytesReceived": stats.bytes_received,
            "reconnects": stats.reconnects,
            "dispatch": serde_json::to_value(dispatch)?,
            "activeTransfers": node.transfers().active_tasks(),
        }))
    }
}

// ============================================================================
// device:*
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceParams {
    /// Device id or identity
    device_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetLevelParams {
    device_id: String,
    level: String,
}

struct DeviceList {
    node: Weak<PeerNode>,
}

#[async_trait]
impl CommandHandler for DeviceList {
    async fn handle(&self, _ctx: CommandContext, _params: Value) -> Result<Value, HandlerError> {
        let node = upgrade(&self.node)?;
        let devices = node.devices().list().await;
        Ok(serde_json::to_value(devices)?)
    }
}

struct DeviceApprove {
    node: Weak<PeerNode>,
}

#[async_trait]
impl CommandHandler for DeviceApprove {
    async fn handle(&self, _ctx: CommandContext, params: Value) -> Result<Value, HandlerError> {
        let node = upgrade(&self.node)?;
        let p: DeviceParams = serde_json::from_value(params)?;
        let device = node.devices().approve(&p.device_id).await?;
        Ok(serde_json::to_value(device)?)
    }
}

struct DeviceSetLevel {
    node: Weak<PeerNode>,
}

#[async_trait]
impl CommandHandler for DeviceSetLevel {
    async fn handle(&self, ctx: CommandContext, params: Value) -> Result<Value, HandlerError> {
        let node = upgrade(&self.node)?;
        let p: SetLevelParams = serde_json::from_value(params)?;
        let level = PermissionLevel::parse(&p.level)
            .ok_or_else(|| HandlerError::InvalidParams(format!("unknown level {}", p.level)))?;
        // Callers cannot grant more than they hold.
        if level > ctx.level {
            return Err(HandlerError::InvalidParams(format!(
                "cannot grant {} with {}",
                level, ctx.level
            )));
        }
        let device = node.devices().set_permission_level(&p.device_id, level).await?;
        Ok(serde_json::to_value(device)?)
    }
}
