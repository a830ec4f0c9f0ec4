//! Audit trail for dispatch outcomes.
//!
//! Entries live in a bounded in-memory ring buffer. The newest entries not
//! yet handed to durable storage are tracked so a periodic flusher can drain
//! them; if the buffer overflows before a flush, the oldest are lost.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default ring buffer capacity
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// What happened to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    AuthFailed,
    PermissionDenied,
    RateLimited,
    InvalidParams,
    NotFound,
    Dispatched,
    HandlerError,
    DeviceChanged,
    Internal,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::AuthFailed => "auth_failed",
            AuditKind::PermissionDenied => "permission_denied",
            AuditKind::RateLimited => "rate_limited",
            AuditKind::InvalidParams => "invalid_params",
            AuditKind::NotFound => "not_found",
            AuditKind::Dispatched => "dispatched",
            AuditKind::HandlerError => "handler_error",
            AuditKind::DeviceChanged => "device_changed",
            AuditKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "auth_failed" => AuditKind::AuthFailed,
            "permission_denied" => AuditKind::PermissionDenied,
            "rate_limited" => AuditKind::RateLimited,
            "invalid_params" => AuditKind::InvalidParams,
            "not_found" => AuditKind::NotFound,
            "dispatched" => AuditKind::Dispatched,
            "handler_error" => AuditKind::HandlerError,
            "device_changed" => AuditKind::DeviceChanged,
            "internal" => AuditKind::Internal,
            _ => return None,
        })
    }

    /// Outcomes that refused the command.
    pub fn is_denial(self) -> bool {
        matches!(
            self,
            AuditKind::AuthFailed | AuditKind::PermissionDenied | AuditKind::RateLimited | AuditKind::InvalidParams
        )
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record. Never contains signatures or key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub kind: AuditKind,
    pub method: String,
    pub identity: Option<String>,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(kind: AuditKind, method: impl Into<String>, identity: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            method: method.into(),
            identity,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct Ring {
    entries: VecDeque<AuditEntry>,
    unflushed: usize,
}

/// Bounded, append-only audit buffer.
#[derive(Debug)]
pub struct AuditTrail {
    ring: Mutex<Ring>,
    capacity: usize,
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                unflushed: 0,
            }),
            capacity,
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        let mut ring = self.ring.lock();
        if ring.entries.len() >= self.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(entry);
        ring.unflushed = (ring.unflushed + 1).min(ring.entries.len());
    }

    /// The newest `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let ring = self.ring.lock();
        let skip = ring.entries.len().saturating_sub(n);
        ring.entries.iter().skip(skip).cloned().collect()
    }

    /// Entries recorded since the previous drain, oldest first.
    pub fn drain_unflushed(&self) -> Vec<AuditEntry> {
        let mut ring = self.ring.lock();
        let skip = ring.entries.len() - ring.unflushed;
        let out = ring.entries.iter().skip(skip).cloned().collect();
        ring.unflushed = 0;
        out
    }

    /// Return the newest `n` drained entries to the unflushed set after a
    /// failed write. Entries evicted in the meantime are gone.
    pub fn mark_unflushed(&self, n: usize) {
        let mut ring = self.ring.lock();
        ring.unflushed = (ring.unflushed + n).min(ring.entries.len());
    }

    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: usize) -> AuditEntry {
        AuditEntry::new(AuditKind::Dispatched, format!("m{}", i), None, "")
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let trail = AuditTrail::new(3);
        for i in 0..5 {
            trail.record(entry(i));
        }
        assert_eq!(trail.len(), 3);
        let methods: Vec<_> = trail.recent(10).into_iter().map(|e| e.method).collect();
        assert_eq!(methods, vec!["m2", "m3", "m4"]);
        assert_eq!(trail.recent(1)[0].method, "m4");
    }

    #[test]
    fn test_drain_unflushed() {
        let trail = AuditTrail::new(10);
        trail.record(entry(0));
        trail.record(entry(1));
        assert_eq!(trail.drain_unflushed().len(), 2);
        assert!(trail.drain_unflushed().is_empty());

        trail.record(entry(2));
        let drained = trail.drain_unflushed();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].method, "m2");
        // drained entries stay visible
        assert_eq!(trail.len(), 3);
    }

    #[test]
    fn test_drain_after_overflow() {
        let trail = AuditTrail::new(2);
        for i in 0..4 {
            trail.record(entry(i));
        }
        let drained: Vec<_> = trail.drain_unflushed().into_iter().map(|e| e.method).collect();
        assert_eq!(drained, vec!["m2", "m3"]);
    }

    #[test]
    fn test_mark_unflushed_requeues_tail() {
        let trail = AuditTrail::new(10);
        for i in 0..3 {
            trail.record(entry(i));
        }
        let drained = trail.drain_unflushed();
        assert_eq!(drained.len(), 3);

        // first entry written, the other two failed; one more arrives
        trail.mark_unflushed(2);
        trail.record(entry(3));
        let methods: Vec<_> = trail.drain_unflushed().into_iter().map(|e| e.method).collect();
        assert_eq!(methods, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_mark_unflushed_bounded_by_ring() {
        let trail = AuditTrail::new(2);
        trail.record(entry(0));
        trail.drain_unflushed();
        trail.mark_unflushed(5);
        assert_eq!(trail.drain_unflushed().len(), 1);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [AuditKind::AuthFailed, AuditKind::HandlerError, AuditKind::DeviceChanged, AuditKind::Internal] {
            assert_eq!(AuditKind::parse(kind.as_str()), Some(kind));
        }
        assert!(AuditKind::RateLimited.is_denial());
        assert!(!AuditKind::Dispatched.is_denial());
    }
}
