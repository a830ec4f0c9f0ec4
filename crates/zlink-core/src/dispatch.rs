//! Command dispatch for the receiving side of the channel.
//!
//! Every inbound command passes the same gate before a handler runs:
//!
//! 1. Auth envelope verification (signature, freshness, replay)
//! 2. Device lookup; blocked devices are refused
//! 3. Permission level check
//! 4. Sliding-window rate limit
//! 5. Parameter sanitization
//! 6. Contact recorded on the device (`last_seen_at`, first-contact record)
//! 7. Handler lookup and execution in its own task
//!
//! Every outcome is appended to the audit trail. Denials short-circuit
//! with no side effect beyond the audit entry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use zlink_security::{
    sanitize_params, AuditEntry, AuditKind, AuditTrail, AuthConfig, AuthError, AuthVerifier, PermissionLevel,
    PermissionMap, RateLimitConfig, RateLimiter, SignatureVerifier,
};

use crate::devices::{DeviceRecord, DeviceRegistry};
use crate::errors::CoreError;
use crate::messages::{CommandEnvelope, CommandResponse};
use crate::store::Store;

// ============================================================================
// Handler Error Type
// ============================================================================

/// Errors returned by command handlers.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::InvalidParams(e.to_string())
    }
}

impl From<HandlerError> for CoreError {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::InvalidParams(msg) => CoreError::InvalidParams(msg),
            HandlerError::NotFound(msg) => CoreError::NotFound(msg),
            HandlerError::InvalidState(msg) => CoreError::InvalidState(msg),
            HandlerError::Internal(msg) => CoreError::Internal(msg),
            HandlerError::Core(e) => e,
        }
    }
}

// ============================================================================
// Command Handler Trait
// ============================================================================

/// Who sent a command and what they may do.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub request_id: String,
    pub method: String,
    /// Verified identity, absent for unauthenticated public calls
    pub identity: Option<String>,
    pub device: Option<DeviceRecord>,
    pub level: PermissionLevel,
}

/// Handles one method.
///
/// Handlers only run after the caller passed the gate. A returned error
/// becomes an error response; a panic becomes `INTERNAL`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: CommandContext, params: Value) -> Result<Value, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(CommandContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: CommandContext, params: Value) -> Result<Value, HandlerError> {
        (self.0)(ctx, params).await
    }
}

// ============================================================================
// Dispatch Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct DispatchStats {
    pub received: AtomicU64,
    pub dispatched: AtomicU64,
    /// Permission denials, including blocked devices
    pub denied: AtomicU64,
    pub rate_limited: AtomicU64,
    pub auth_failures: AtomicU64,
    pub invalid_params: AtomicU64,
    pub unknown_method: AtomicU64,
    pub handler_errors: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            invalid_params: self.invalid_params.load(Ordering::Relaxed),
            unknown_method: self.unknown_method.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub denied: u64,
    pub rate_limited: u64,
    pub auth_failures: u64,
    pub invalid_params: u64,
    pub unknown_method: u64,
    pub handler_errors: u64,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub permissions: PermissionMap,
    pub rate_limits: RateLimitConfig,
    pub audit_capacity: usize,
    pub audit_flush_interval: Duration,
    /// Level given to a device on first contact
    pub first_contact_level: PermissionLevel,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            permissions: PermissionMap::default(),
            rate_limits: RateLimitConfig::default(),
            audit_capacity: 1000,
            audit_flush_interval: Duration::from_secs(5),
            first_contact_level: PermissionLevel::Authenticated,
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Gate plus router for inbound commands.
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    auth: AuthVerifier,
    permissions: PermissionMap,
    rate_limiter: RateLimiter,
    devices: Arc<DeviceRegistry>,
    audit: AuditTrail,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(
        verifier: Arc<dyn SignatureVerifier>,
        auth: AuthConfig,
        config: GatewayConfig,
        devices: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            auth: AuthVerifier::new(verifier, auth),
            permissions: config.permissions,
            rate_limiter: RateLimiter::new(config.rate_limits),
            devices,
            audit: AuditTrail::new(config.audit_capacity),
            stats: Arc::new(DispatchStats::new()),
        }
    }

    /// Register a handler for `method`, replacing any previous one.
    pub async fn register_handler(&self, method: &str, handler: Arc<dyn CommandHandler>) {
        self.handlers.write().await.insert(method.to_string(), handler);
        debug!(method = %method, "registered handler");
    }

    /// Register an async closure as the handler for `method`.
    pub async fn register_fn<F, Fut>(&self, method: &str, f: F)
    where
        F: Fn(CommandContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register_handler(method, Arc::new(FnHandler(f))).await;
    }

    pub async fn unregister_handler(&self, method: &str) -> bool {
        let removed = self.handlers.write().await.remove(method).is_some();
        debug!(method = %method, removed, "unregistered handler");
        removed
    }

    pub async fn has_handler(&self, method: &str) -> bool {
        self.handlers.read().await.contains_key(method)
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn permissions(&self) -> &PermissionMap {
        &self.permissions
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    /// Run one command through the gate and its handler.
    pub async fn dispatch(&self, command: CommandEnvelope) -> CommandResponse {
        DispatchStats::inc(&self.stats.received);
        let CommandEnvelope { id, method, params, auth } = command;

        let ctx = match self.admit(&id, &method, auth.as_ref(), &params).await {
            Ok(ctx) => ctx,
            Err(e) => return CommandResponse::err(id, &e),
        };

        let handler = self.handlers.read().await.get(&method).cloned();
        let Some(handler) = handler else {
            DispatchStats::inc(&self.stats.unknown_method);
            self.record(AuditKind::NotFound, &method, ctx.identity.clone(), "no handler");
            return CommandResponse::err(id, &CoreError::NotFound(format!("method {}", method)));
        };

        let identity = ctx.identity.clone();
        let task = tokio::spawn(async move { handler.handle(ctx, params).await });
        let outcome = match task.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CoreError::from(e)),
            Err(join) => {
                warn!(method = %method, request_id = %id, "handler panicked: {}", join);
                Err(CoreError::Internal(format!("handler for {} panicked", method)))
            }
        };

        match outcome {
            Ok(value) => {
                DispatchStats::inc(&self.stats.dispatched);
                self.record(AuditKind::Dispatched, &method, identity, "ok");
                debug!(method = %method, request_id = %id, "dispatched");
                CommandResponse::ok(id, value)
            }
            Err(e) => {
                DispatchStats::inc(&self.stats.handler_errors);
                self.record(AuditKind::HandlerError, &method, identity, &e.to_string());
                warn!(method = %method, request_id = %id, error = %e, "handler error");
                CommandResponse::err(id, &e)
            }
        }
    }

    /// Write audit entries recorded since the last flush to `store`.
    pub async fn flush_audit(&self, store: &dyn Store) -> usize {
        let entries = self.audit.drain_unflushed();
        let mut written = 0;
        for entry in &entries {
            if let Err(e) = store.append_audit(entry).await {
                let pending = entries.len() - written;
                self.audit.mark_unflushed(pending);
                warn!(error = %e, pending, "audit flush failed, will retry");
                break;
            }
            written += 1;
        }
        written
    }

    /// Steps 1 to 6 of the gate.
    async fn admit(
        &self,
        id: &str,
        method: &str,
        auth: Option<&zlink_security::AuthEnvelope>,
        params: &Value,
    ) -> Result<CommandContext, CoreError> {
        let required = self.permissions.required_level(method);

        let (identity, device) = match auth {
            None if required == PermissionLevel::Public => (None, None),
            None => return Err(self.auth_failed(method, None, AuthError::Missing)),
            Some(envelope) => {
                if let Err(e) = self.auth.verify(method, envelope) {
                    return Err(self.auth_failed(method, Some(envelope.identity.clone()), e));
                }
                let device = self.devices.peek(&envelope.identity).await;
                (Some(envelope.identity.clone()), Some(device))
            }
        };

        let level = device
            .as_ref()
            .map(|d| d.permission_level)
            .unwrap_or(PermissionLevel::Public);
        let denied = CoreError::PermissionDenied {
            method: method.to_string(),
            required,
            actual: level,
        };
        if device.as_ref().is_some_and(|d| d.is_blocked()) {
            DispatchStats::inc(&self.stats.denied);
            self.record(AuditKind::PermissionDenied, method, identity.clone(), "device blocked");
            warn!(method = %method, identity = ?identity, "blocked device refused");
            return Err(denied);
        }
        if !self.permissions.allows(method, level) {
            DispatchStats::inc(&self.stats.denied);
            self.record(
                AuditKind::PermissionDenied,
                method,
                identity.clone(),
                &format!("requires {}, has {}", required, level),
            );
            warn!(method = %method, required = %required, actual = %level, "permission denied");
            return Err(denied);
        }

        let trusted = device.as_ref().is_some_and(|d| d.trusted);
        if let Err(e) = self.rate_limiter.check(method, trusted) {
            let e = CoreError::from(e);
            DispatchStats::inc(&self.stats.rate_limited);
            self.record(AuditKind::RateLimited, method, identity.clone(), &e.to_string());
            warn!(method = %method, identity = ?identity, "rate limited");
            return Err(e);
        }

        if let Err(e) = sanitize_params(params) {
            let e = CoreError::from(e);
            DispatchStats::inc(&self.stats.invalid_params);
            self.record(AuditKind::InvalidParams, method, identity.clone(), &e.to_string());
            warn!(method = %method, error = %e, "unsafe params rejected");
            return Err(e);
        }

        // Admitted: only now is the contact recorded.
        let device = match identity.as_deref() {
            Some(identity) => Some(self.record_contact(method, identity).await?),
            None => None,
        };

        Ok(CommandContext {
            request_id: id.to_string(),
            method: method.to_string(),
            identity,
            device,
            level,
        })
    }

    async fn record_contact(&self, method: &str, identity: &str) -> Result<DeviceRecord, CoreError> {
        self.devices.observe(identity).await.map_err(|e| {
            self.record(AuditKind::Internal, method, Some(identity.to_string()), &e.to_string());
            warn!(method = %method, identity = %identity, error = %e, "device update failed");
            CoreError::Internal(format!("device update failed: {}", e))
        })
    }

    fn auth_failed(&self, method: &str, identity: Option<String>, error: AuthError) -> CoreError {
        DispatchStats::inc(&self.stats.auth_failures);
        self.record(AuditKind::AuthFailed, method, identity.clone(), &error.to_string());
        warn!(method = %method, identity = ?identity, error = %error, "auth failed");
        CoreError::Auth(error)
    }

    fn record(&self, kind: AuditKind, method: &str, identity: Option<String>, detail: &str) {
        self.audit.record(AuditEntry::new(kind, method, identity, detail));
    }
}
