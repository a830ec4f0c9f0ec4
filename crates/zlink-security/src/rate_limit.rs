//! Sliding-window rate limiting by method category.
//!
//! Each category keeps the timestamps of calls inside its window. A call
//! evicts expired timestamps, is rejected if the window is full, and is
//! otherwise recorded.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SecurityError;

/// Window a method is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateCategory {
    Global,
    Sensitive,
    FileOperation,
}

impl fmt::Display for RateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateCategory::Global => write!(f, "global"),
            RateCategory::Sensitive => write!(f, "sensitive"),
            RateCategory::FileOperation => write!(f, "file_operation"),
        }
    }
}

/// Window length and call budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub window: Duration,
    pub max_calls: usize,
}

impl WindowConfig {
    pub const fn new(window: Duration, max_calls: usize) -> Self {
        Self { window, max_calls }
    }
}

/// Configuration for rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global: WindowConfig,
    pub sensitive: WindowConfig,
    pub file_operation: WindowConfig,
    /// Methods (exact or `prefix:*`) counted as sensitive
    pub sensitive_methods: HashSet<String>,
    /// Methods (exact or `prefix:*`) counted as file operations
    pub file_methods: HashSet<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            global: WindowConfig::new(minute, 120),
            sensitive: WindowConfig::new(minute, 10),
            file_operation: WindowConfig::new(minute, 30),
            sensitive_methods: ["device:*", "system:shutdown", "system:exec", "file:delete"]
                .into_iter()
                .map(String::from)
                .collect(),
            file_methods: ["transfer:request", "file:*"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl RateLimitConfig {
    fn window(&self, category: RateCategory) -> WindowConfig {
        match category {
            RateCategory::Global => self.global,
            RateCategory::Sensitive => self.sensitive,
            RateCategory::FileOperation => self.file_operation,
        }
    }
}

fn matches_any(set: &HashSet<String>, method: &str) -> bool {
    set.contains(method)
        || set
            .iter()
            .filter_map(|p| p.strip_suffix('*'))
            .any(|prefix| method.starts_with(prefix))
}

/// Rate limiter shared by the dispatcher.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<RateCategory, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Category `method` is counted against.
    pub fn category_for(&self, method: &str) -> RateCategory {
        if matches_any(&self.config.sensitive_methods, method) {
            RateCategory::Sensitive
        } else if matches_any(&self.config.file_methods, method) {
            RateCategory::FileOperation
        } else {
            RateCategory::Global
        }
    }

    /// Count a call to `method`. Trusted callers skip the global window.
    pub fn check(&self, method: &str, trusted: bool) -> Result<(), SecurityError> {
        self.check_at(method, trusted, Instant::now())
    }

    pub fn check_at(&self, method: &str, trusted: bool, now: Instant) -> Result<(), SecurityError> {
        let category = self.category_for(method);
        if trusted && category == RateCategory::Global {
            return Ok(());
        }

        let limit = self.config.window(category);
        let mut windows = self.windows.lock();
        let calls = windows.entry(category).or_default();

        calls.retain(|&t| now.saturating_duration_since(t) < limit.window);

        if calls.len() >= limit.max_calls {
            let retry_after = calls
                .first()
                .map(|&oldest| limit.window.saturating_sub(now.saturating_duration_since(oldest)))
                .unwrap_or(limit.window);

            warn!(
                method = %method,
                category = %category,
                calls = calls.len(),
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );

            return Err(SecurityError::RateLimited { category, retry_after });
        }

        calls.push(now);
        Ok(())
    }

    /// Calls currently counted in `category`'s window.
    pub fn in_window(&self, category: RateCategory) -> usize {
        self.windows.lock().get(&category).map(Vec::len).unwrap_or(0)
    }

    pub fn reset(&self) {
        self.windows.lock().clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
