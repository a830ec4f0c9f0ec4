//! Security error types.

use std::time::Duration;
use thiserror::Error;

use crate::permission::PermissionLevel;
use crate::rate_limit::RateCategory;

/// Reasons an auth envelope is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication missing")]
    Missing,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("auth timestamp outside freshness window (skew {skew_ms} ms)")]
    Expired { skew_ms: i64 },

    #[error("replayed nonce")]
    Replayed,
}

/// Security-related errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("auth failed: {0}")]
    Auth(#[from] AuthError),

    #[error("permission denied: {method} requires {required}, caller has {actual}")]
    PermissionDenied {
        method: String,
        required: PermissionLevel,
        actual: PermissionLevel,
    },

    #[error("rate limited: {category} window full, retry after {retry_after:?}")]
    RateLimited {
        category: RateCategory,
        retry_after: Duration,
    },

    #[error("unsafe parameter at {path}: {reason}")]
    UnsafeParameter { path: String, reason: String },

    #[error("invalid key: {0}")]
    InvalidKey(String),
}
