//! Connection state vocabulary, reconnection policy and link statistics.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Connection state. Exactly one is active per connection instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable reconnection configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectionPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            backoff_factor: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectionPolicy {
    /// Delay before 1-based attempt `attempt`: `min(base * factor^(attempt-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay.max(0.0)).min(self.max_delay)
    }

    /// Iterator over the capped delay sequence, bounded by `max_attempts`.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }
}

/// Stateful exponential backoff: multiplies after every attempt, capped.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: ReconnectionPolicy,
    attempts: u32,
    next_delay: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectionPolicy) -> Self {
        let next_delay = policy.base_delay.min(policy.max_delay);
        Self {
            policy,
            attempts: 0,
            next_delay,
        }
    }

    /// Claim the next attempt. Returns `(attempt_number, delay)` or `None`
    /// once `max_attempts` attempts have been made.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.next_delay;
        let scaled = delay.as_secs_f64() * self.policy.backoff_factor;
        self.next_delay = if scaled.is_finite() && scaled < self.policy.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled.max(0.0)).min(self.policy.max_delay)
        } else {
            self.policy.max_delay
        };
        Some((self.attempts, delay))
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Back to `base_delay` with a zero attempt counter
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_delay = self.policy.base_delay.min(self.policy.max_delay);
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.next_attempt().map(|(_, delay)| delay)
    }
}

/// Link statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub connected_for: Option<Duration>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnects: u32,
}

/// Counters for a connection, shared between the send path and the receive loop.
#[derive(Debug)]
pub struct StatsTracker {
    connected_at: Mutex<Option<Instant>>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    reconnects: AtomicU32,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            connected_at: Mutex::new(None),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            reconnects: AtomicU32::new(0),
        }
    }

    pub fn mark_connected(&self) {
        *self.connected_at.lock() = Some(Instant::now());
    }

    pub fn mark_disconnected(&self) {
        *self.connected_at.lock() = None;
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            connected_for: self.connected_at.lock().map(|t| t.elapsed()),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}
