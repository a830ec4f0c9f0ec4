#![forbid(unsafe_code)]

//! zippy-link security primitives
//!
//! This crate provides the receiving-side checks applied to every command:
//! - Signer / verifier seam with an Ed25519 implementation
//! - Auth envelope construction and verification
//! - Replay protection (freshness window + nonce cache)
//! - Hierarchical permission levels
//! - Sliding-window rate limiting
//! - Parameter sanitization
//! - Audit trail

pub mod error;
pub mod identity;
pub mod envelope;
pub mod replay;
pub mod permission;
pub mod rate_limit;
pub mod sanitize;
pub mod audit;

pub use audit::{AuditEntry, AuditKind, AuditTrail};
pub use envelope::{AuthConfig, AuthEnvelope, AuthVerifier};
pub use error::{AuthError, SecurityError};
pub use identity::{Ed25519Signer, Ed25519Verifier, Identity, SignatureVerifier, Signer};
pub use permission::{has_permission, PermissionLevel, PermissionMap};
pub use rate_limit::{RateCategory, RateLimitConfig, RateLimiter, WindowConfig};
pub use sanitize::sanitize_params;
