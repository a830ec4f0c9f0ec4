//! Replay protection for command auth envelopes.
//!
//! Two checks: the envelope timestamp must be within a symmetric freshness
//! window of local time, and the `(identity, nonce)` pair must not have been
//! seen within that window. Seen pairs are evicted once they age out of the
//! window, so the cache never needs to remember anything older.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::error::AuthError;

/// Default freshness window (5 minutes)
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(300);

/// Default nonce cache bound
pub const DEFAULT_NONCE_CAPACITY: usize = 10_000;

/// Symmetric timestamp freshness check.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessWindow {
    window_ms: i64,
}

impl FreshnessWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis().min(i64::MAX as u128) as i64,
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Reject if `|now - timestamp|` exceeds the window.
    pub fn check(&self, timestamp_ms: i64, now_ms: i64) -> Result<(), AuthError> {
        let skew = now_ms.saturating_sub(timestamp_ms);
        if skew.saturating_abs() > self.window_ms {
            return Err(AuthError::Expired { skew_ms: skew });
        }
        Ok(())
    }
}

impl Default for FreshnessWindow {
    fn default() -> Self {
        Self::new(DEFAULT_FRESHNESS_WINDOW)
    }
}

/// Bounded, time-evicted set of seen `(identity, nonce)` pairs.
///
/// **Thread Safety:** not thread-safe; the verifier wraps it in a mutex.
#[derive(Debug)]
pub struct NonceCache {
    seen: HashMap<(String, String), i64>,
    order: VecDeque<(i64, (String, String))>,
    window_ms: i64,
    capacity: usize,
}

impl NonceCache {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            window_ms: window.as_millis().min(i64::MAX as u128) as i64,
            capacity: capacity.max(1),
        }
    }

    /// Record the pair, rejecting it if already seen within the window.
    pub fn check_and_insert(&mut self, identity: &str, nonce: &str, now_ms: i64) -> Result<(), AuthError> {
        self.evict_expired(now_ms);

        let key = (identity.to_string(), nonce.to_string());
        if self.seen.contains_key(&key) {
            return Err(AuthError::Replayed);
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((_, oldest)) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }

        self.seen.insert(key.clone(), now_ms);
        self.order.push_back((now_ms, key));
        Ok(())
    }

    /// Drop every pair seen at or before `now - window`.
    pub fn evict_expired(&mut self, now_ms: i64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while let Some((seen_at, _)) = self.order.front() {
            if *seen_at > cutoff {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                self.seen.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new(DEFAULT_FRESHNESS_WINDOW, DEFAULT_NONCE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(300);

    #[test]
    fn test_freshness_accepts_within_window() {
        let window = FreshnessWindow::new(WINDOW);
        let now = 1_700_000_000_000;
        assert!(window.check(now, now).is_ok());
        assert!(window.check(now - 299_000, now).is_ok());
        assert!(window.check(now + 299_000, now).is_ok());
        assert!(window.check(now - 300_000, now).is_ok());
    }

    #[test]
    fn test_freshness_rejects_stale_and_future() {
        let window = FreshnessWindow::new(WINDOW);
        let now = 1_700_000_000_000;
        assert!(matches!(window.check(now - 300_001, now), Err(AuthError::Expired { .. })));
        assert!(matches!(window.check(now + 600_000, now), Err(AuthError::Expired { .. })));
    }

    #[test]
    fn test_nonce_rejects_duplicate_within_window() {
        let mut cache = NonceCache::new(WINDOW, 100);
        let now = 1_000_000;
        assert!(cache.check_and_insert("alice", "n1", now).is_ok());
        assert_eq!(cache.check_and_insert("alice", "n1", now + 1_000), Err(AuthError::Replayed));
    }

    #[test]
    fn test_same_nonce_different_identity_is_fine() {
        let mut cache = NonceCache::new(WINDOW, 100);
        assert!(cache.check_and_insert("alice", "n1", 0).is_ok());
        assert!(cache.check_and_insert("bob", "n1", 0).is_ok());
    }

    #[test]
    fn test_nonce_reusable_after_window() {
        let mut cache = NonceCache::new(WINDOW, 100);
        let now = 1_000_000;
        assert!(cache.check_and_insert("alice", "n1", now).is_ok());
        assert!(cache.check_and_insert("alice", "n1", now + 300_001).is_ok());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = NonceCache::new(WINDOW, 2);
        cache.check_and_insert("a", "1", 0).unwrap();
        cache.check_and_insert("a", "2", 1).unwrap();
        cache.check_and_insert("a", "3", 2).unwrap();
        assert_eq!(cache.len(), 2);
        // "1" was evicted to make room
        assert!(cache.check_and_insert("a", "1", 3).is_ok());
        assert_eq!(cache.check_and_insert("a", "3", 4), Err(AuthError::Replayed));
    }
}
