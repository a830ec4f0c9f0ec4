//! Error types for zippy-link core.
//!
//! `CoreError` is the single error type surfaced by the runtime. Every
//! variant maps to a stable wire [`ErrorCode`] so remote callers can tell
//! denials and rate limits apart from internal failures without seeing
//! internal details.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use zlink_security::{AuthError, PermissionLevel, RateCategory, SecurityError};
use zlink_transport::TransportError;

use crate::messages::ErrorBody;
use crate::store::StoreError;

// ============================================================================
// Wire Error Codes
// ============================================================================

/// Stable error codes carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    TransportError,
    AuthMissing,
    AuthInvalidSignature,
    AuthExpired,
    AuthReplayed,
    PermissionDenied,
    RateLimited,
    Timeout,
    NotConnected,
    NotFound,
    Cancelled,
    InvalidParams,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TransportError => "TRANSPORT_ERROR",
            ErrorCode::AuthMissing => "AUTH_MISSING",
            ErrorCode::AuthInvalidSignature => "AUTH_INVALID_SIGNATURE",
            ErrorCode::AuthExpired => "AUTH_EXPIRED",
            ErrorCode::AuthReplayed => "AUTH_REPLAYED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Parse a wire code. Unknown codes are treated as `INTERNAL`.
    pub fn parse(code: &str) -> Self {
        match code {
            "TRANSPORT_ERROR" => ErrorCode::TransportError,
            "AUTH_MISSING" => ErrorCode::AuthMissing,
            "AUTH_INVALID_SIGNATURE" => ErrorCode::AuthInvalidSignature,
            "AUTH_EXPIRED" => ErrorCode::AuthExpired,
            "AUTH_REPLAYED" => ErrorCode::AuthReplayed,
            "PERMISSION_DENIED" => ErrorCode::PermissionDenied,
            "RATE_LIMITED" => ErrorCode::RateLimited,
            "TIMEOUT" => ErrorCode::Timeout,
            "NOT_CONNECTED" => ErrorCode::NotConnected,
            "NOT_FOUND" => ErrorCode::NotFound,
            "CANCELLED" => ErrorCode::Cancelled,
            "INVALID_PARAMS" => ErrorCode::InvalidParams,
            _ => ErrorCode::Internal,
        }
    }

    /// Codes produced by the permission gate before any handler runs.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            ErrorCode::AuthMissing
                | ErrorCode::AuthInvalidSignature
                | ErrorCode::AuthExpired
                | ErrorCode::AuthReplayed
                | ErrorCode::PermissionDenied
                | ErrorCode::RateLimited
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Core Error
// ============================================================================

/// Unified error type for zippy-link core operations.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("permission denied: {method} requires {required}, caller has {actual}")]
    PermissionDenied {
        method: String,
        required: PermissionLevel,
        actual: PermissionLevel,
    },

    #[error("rate limited ({category}), retry after {retry_after:?}")]
    RateLimited {
        category: RateCategory,
        retry_after: Duration,
    },

    #[error("timeout: {method} got no response within {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("not connected")]
    NotConnected,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled: operation cancelled")]
    Cancelled,

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(String),

    #[error("decode error: {0}")]
    Decode(String),

    /// Error response returned by the remote peer
    #[error("remote error {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    /// Internal error (details are not sent to the remote peer)
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Transport(_) => ErrorCode::TransportError,
            CoreError::Auth(AuthError::Missing) => ErrorCode::AuthMissing,
            CoreError::Auth(AuthError::InvalidSignature) => ErrorCode::AuthInvalidSignature,
            CoreError::Auth(AuthError::Expired { .. }) => ErrorCode::AuthExpired,
            CoreError::Auth(AuthError::Replayed) => ErrorCode::AuthReplayed,
            CoreError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            CoreError::RateLimited { .. } => ErrorCode::RateLimited,
            CoreError::Timeout { .. } => ErrorCode::Timeout,
            CoreError::NotConnected => ErrorCode::NotConnected,
            CoreError::NotFound(_) => ErrorCode::NotFound,
            CoreError::Cancelled => ErrorCode::Cancelled,
            CoreError::InvalidParams(_) | CoreError::InvalidState(_) | CoreError::Decode(_) => {
                ErrorCode::InvalidParams
            }
            CoreError::Remote { code, .. } => *code,
            CoreError::Store(_) | CoreError::Io(_) | CoreError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Wire-safe error body. Internal failures carry a generic message.
    pub fn to_wire(&self) -> ErrorBody {
        let message = match self {
            CoreError::Store(_) | CoreError::Io(_) | CoreError::Internal(_) => "internal error".to_string(),
            CoreError::Transport(_) => "transport error".to_string(),
            CoreError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code().as_str().to_string(),
            message,
        }
    }

    /// Rebuild an error from a received error body.
    pub fn from_wire(body: &ErrorBody) -> Self {
        CoreError::Remote {
            code: ErrorCode::parse(&body.code),
            message: body.message.clone(),
        }
    }
}

impl From<SecurityError> for CoreError {
    fn from(e: SecurityError) -> Self {
        match e {
            SecurityError::Auth(auth) => CoreError::Auth(auth),
            SecurityError::PermissionDenied { method, required, actual } => {
                CoreError::PermissionDenied { method, required, actual }
            }
            SecurityError::RateLimited { category, retry_after } => {
                CoreError::RateLimited { category, retry_after }
            }
            SecurityError::UnsafeParameter { path, reason } => {
                CoreError::InvalidParams(format!("{}: {}", path, reason))
            }
            SecurityError::InvalidKey(msg) => CoreError::Internal(msg),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => CoreError::NotFound(e.to_string()),
            _ => CoreError::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(CoreError::NotConnected.code().as_str(), "NOT_CONNECTED");
        assert_eq!(CoreError::Auth(AuthError::Replayed).code().as_str(), "AUTH_REPLAYED");
        assert_eq!(
            CoreError::Timeout { method: "m".into(), after: Duration::from_secs(1) }.code(),
            ErrorCode::Timeout
        );
    }

    #[test]
    fn test_internal_details_not_leaked() {
        let body = CoreError::Internal("db path /var/secret locked".into()).to_wire();
        assert_eq!(body.code, "INTERNAL");
        assert!(!body.message.contains("secret"));
    }

    #[test]
    fn test_wire_round_trip() {
        let err = CoreError::RateLimited {
            category: RateCategory::Sensitive,
            retry_after: Duration::from_secs(3),
        };
        let remote = CoreError::from_wire(&err.to_wire());
        assert_eq!(remote.code(), ErrorCode::RateLimited);
        assert!(remote.code().is_denial());
    }

    #[test]
    fn test_unknown_code_is_internal() {
        assert_eq!(ErrorCode::parse("SOMETHING_NEW"), ErrorCode::Internal);
    }

    #[test]
    fn test_security_error_mapping() {
        let err: CoreError = SecurityError::UnsafeParameter {
            path: "$.path".into(),
            reason: "path traversal".into(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::InvalidParams);
    }
}
