//! Request/response correlation over the command channel.
//!
//! Each command gets a fresh id and a pending entry holding a oneshot
//! sender. The caller races the oneshot against a timer; whichever side
//! removes the entry from the map first owns the completion, so every
//! request completes exactly once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use zlink_security::{AuthEnvelope, Signer};

use crate::connection::ConnectionManager;
use crate::errors::CoreError;
use crate::messages::{CommandEnvelope, CommandResponse, PeerEvent, WireMessage};

/// Default per-request timeout
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

type Completion = oneshot::Sender<Result<CommandResponse, CoreError>>;

struct PendingRequest {
    method: String,
    issued_at: Instant,
    completion: Completion,
}

/// Outstanding requests keyed by request id.
#[derive(Default)]
pub struct PendingRequests {
    map: DashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiving half of its completion.
    pub fn register(&self, id: &str, method: &str) -> oneshot::Receiver<Result<CommandResponse, CoreError>> {
        let (tx, rx) = oneshot::channel();
        self.map.insert(
            id.to_string(),
            PendingRequest {
                method: method.to_string(),
                issued_at: Instant::now(),
                completion: tx,
            },
        );
        rx
    }

    /// Complete the request matching `response.id`. Returns false if no
    /// request is waiting (already completed or timed out).
    pub fn complete(&self, response: CommandResponse) -> bool {
        match self.map.remove(&response.id) {
            Some((id, pending)) => {
                debug!(
                    request_id = %id,
                    method = %pending.method,
                    elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                    "response matched"
                );
                let _ = pending.completion.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Wait up to `limit` for the completion of `id`.
    ///
    /// If the timer fires after `complete` or `fail_all` has already taken
    /// the entry, that side owns the completion and the outcome it delivers
    /// is returned instead of a timeout.
    pub async fn wait(
        &self,
        id: &str,
        method: &str,
        mut completion: oneshot::Receiver<Result<CommandResponse, CoreError>>,
        limit: Duration,
    ) -> Result<CommandResponse, CoreError> {
        let delivered = match timeout(limit, &mut completion).await {
            Ok(delivered) => delivered,
            Err(_) if !self.remove(id) => completion.await,
            Err(_) => {
                warn!(request_id = %id, method = %method, timeout_ms = limit.as_millis() as u64, "command timed out");
                return Err(CoreError::Timeout {
                    method: method.to_string(),
                    after: limit,
                });
            }
        };
        // Sender dropped without completing
        delivered.map_err(|_| CoreError::Cancelled)?
    }

    /// Drop a request without completing it.
    pub fn remove(&self, id: &str) -> bool {
        self.map.remove(id).is_some()
    }

    /// Fail every outstanding request with `error` and clear the map.
    pub fn fail_all(&self, error: CoreError) -> usize {
        let ids: Vec<String> = self.map.iter().map(|entry| entry.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.map.remove(&id) {
                let _ = pending.completion.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }
}

/// Sends signed commands and waits for their responses.
pub struct RpcCorrelator {
    connection: Arc<ConnectionManager>,
    signer: Arc<dyn Signer>,
    default_timeout: Duration,
}

impl RpcCorrelator {
    pub fn new(connection: Arc<ConnectionManager>, signer: Arc<dyn Signer>) -> Self {
        Self {
            connection,
            signer,
            default_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Send `method` and deserialize the result into `T`.
    pub async fn send_command<T, P>(&self, method: &str, params: P, timeout: Option<Duration>) -> Result<T, CoreError>
    where
        T: DeserializeOwned,
        P: Serialize,
    {
        let params = serde_json::to_value(params)?;
        let value = self.send_command_raw(method, params, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send `method` and return the raw JSON result.
    pub async fn send_command_raw(
        &self,
        method: &str,
        params: Value,
        request_timeout: Option<Duration>,
    ) -> Result<Value, CoreError> {
        if !self.connection.is_connected() {
            return Err(CoreError::NotConnected);
        }

        let limit = request_timeout.unwrap_or(self.default_timeout);
        let id = Uuid::new_v4().to_string();
        let envelope = CommandEnvelope {
            id: id.clone(),
            method: method.to_string(),
            params,
            auth: Some(AuthEnvelope::create(self.signer.as_ref(), method)),
        };

        let pending = self.connection.pending();
        let completion = pending.register(&id, method);

        if let Err(e) = self.connection.send_message(&WireMessage::Command(envelope)).await {
            pending.remove(&id);
            return Err(e);
        }
        debug!(request_id = %id, method = %method, "command sent");

        pending.wait(&id, method, completion, limit).await?.into_result()
    }

    /// Push an application event to the peer. Events are not acknowledged.
    pub async fn send_event(&self, name: &str, payload: Value) -> Result<(), CoreError> {
        self.connection
            .send_message(&WireMessage::Event(PeerEvent {
                name: name.to_string(),
                payload,
            }))
            .await
    }
}
