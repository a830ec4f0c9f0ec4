//! Per-command auth envelopes.
//!
//! Every command carries an [`AuthEnvelope`] signed over the method name,
//! a millisecond timestamp and a random nonce. [`AuthVerifier`] checks the
//! signature first, then freshness, and only then records the nonce, so an
//! envelope that fails either earlier check never occupies the replay cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthError;
use crate::identity::{Identity, SignatureVerifier, Signer};
use crate::replay::{FreshnessWindow, NonceCache, DEFAULT_FRESHNESS_WINDOW, DEFAULT_NONCE_CAPACITY};

const NONCE_LEN: usize = 16;

/// Authentication attached to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEnvelope {
    pub identity: Identity,
    /// Hex-encoded signature over [`signing_payload`]
    pub signature: String,
    /// Unix milliseconds
    pub timestamp: i64,
    /// Hex-encoded random nonce
    pub nonce: String,
}

impl AuthEnvelope {
    /// Build a fresh envelope for `method` using the current time.
    pub fn create(signer: &dyn Signer, method: &str) -> Self {
        Self::create_at(signer, method, Utc::now().timestamp_millis())
    }

    /// Build an envelope with an explicit timestamp.
    pub fn create_at(signer: &dyn Signer, method: &str, timestamp: i64) -> Self {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce = hex::encode(nonce);
        let signature = signer.sign(&signing_payload(method, timestamp, &nonce));

        Self {
            identity: signer.identity(),
            signature: hex::encode(signature),
            timestamp,
            nonce,
        }
    }
}

/// Bytes covered by the envelope signature: `method\ntimestamp\nnonce`.
pub fn signing_payload(method: &str, timestamp: i64, nonce: &str) -> Vec<u8> {
    format!("{}\n{}\n{}", method, timestamp, nonce).into_bytes()
}

/// Verification settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Maximum |now - timestamp|; also the nonce retention period
    pub freshness_window: Duration,
    /// Upper bound on remembered nonces
    pub nonce_capacity: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            nonce_capacity: DEFAULT_NONCE_CAPACITY,
        }
    }
}

/// Validates incoming auth envelopes.
pub struct AuthVerifier {
    verifier: Arc<dyn SignatureVerifier>,
    freshness: FreshnessWindow,
    nonces: Mutex<NonceCache>,
}

impl AuthVerifier {
    pub fn new(verifier: Arc<dyn SignatureVerifier>, config: AuthConfig) -> Self {
        Self {
            verifier,
            freshness: FreshnessWindow::new(config.freshness_window),
            nonces: Mutex::new(NonceCache::new(config.freshness_window, config.nonce_capacity)),
        }
    }

    /// Verify `envelope` for `method` against the current time.
    pub fn verify(&self, method: &str, envelope: &AuthEnvelope) -> Result<(), AuthError> {
        self.verify_at(method, envelope, Utc::now().timestamp_millis())
    }

    /// Verify against an explicit clock reading.
    pub fn verify_at(&self, method: &str, envelope: &AuthEnvelope, now_ms: i64) -> Result<(), AuthError> {
        let signature = hex::decode(&envelope.signature).map_err(|_| AuthError::InvalidSignature)?;
        let payload = signing_payload(method, envelope.timestamp, &envelope.nonce);
        if !self.verifier.verify(&envelope.identity, &payload, &signature) {
            debug!(identity = %envelope.identity, method = %method, "signature check failed");
            return Err(AuthError::InvalidSignature);
        }

        self.freshness.check(envelope.timestamp, now_ms)?;

        self.nonces
            .lock()
            .check_and_insert(&envelope.identity, &envelope.nonce, now_ms)
            .map_err(|e| {
                debug!(identity = %envelope.identity, nonce = %envelope.nonce, "replayed nonce");
                e
            })
    }

    /// Boolean form of [`verify`](Self::verify).
    pub fn is_valid(&self, method: &str, envelope: &AuthEnvelope) -> bool {
        self.verify(method, envelope).is_ok()
    }

    pub fn cached_nonces(&self) -> usize {
        self.nonces.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Ed25519Signer, Ed25519Verifier};

    fn verifier() -> AuthVerifier {
        AuthVerifier::new(Arc::new(Ed25519Verifier), AuthConfig::default())
    }

    #[test]
    fn test_fresh_envelope_verifies() {
        let signer = Ed25519Signer::generate();
        let env = AuthEnvelope::create(&signer, "system:echo");
        assert!(verifier().verify("system:echo", &env).is_ok());
    }

    #[test]
    fn test_signature_binds_method() {
        let signer = Ed25519Signer::generate();
        let env = AuthEnvelope::create(&signer, "system:echo");
        assert_eq!(verifier().verify("device:approve", &env), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn test_tampered_fields_rejected() {
        let signer = Ed25519Signer::generate();
        let v = verifier();

        let mut env = AuthEnvelope::create(&signer, "m");
        env.timestamp += 1;
        assert_eq!(v.verify("m", &env), Err(AuthError::InvalidSignature));

        let mut env = AuthEnvelope::create(&signer, "m");
        env.signature = "zz".into();
        assert_eq!(v.verify("m", &env), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn test_replay_rejected_then_allowed_after_window() {
        let signer = Ed25519Signer::generate();
        let v = verifier();
        let now = 1_700_000_000_000;
        let env = AuthEnvelope::create_at(&signer, "m", now);

        assert!(v.verify_at("m", &env, now).is_ok());
        assert_eq!(v.verify_at("m", &env, now + 10), Err(AuthError::Replayed));

        // Past the window the nonce is forgotten, but the timestamp is stale.
        let later = now + 300_001;
        assert!(matches!(v.verify_at("m", &env, later), Err(AuthError::Expired { .. })));
    }

    #[test]
    fn test_expired_envelope_does_not_consume_nonce() {
        let signer = Ed25519Signer::generate();
        let v = verifier();
        let now = 1_700_000_000_000;
        let stale = AuthEnvelope::create_at(&signer, "m", now - 400_000);

        assert!(matches!(v.verify_at("m", &stale, now), Err(AuthError::Expired { .. })));
        assert_eq!(v.cached_nonces(), 0);
    }

    #[test]
    fn test_forged_envelope_does_not_consume_nonce() {
        let signer = Ed25519Signer::generate();
        let v = verifier();
        let mut env = AuthEnvelope::create(&signer, "m");
        env.identity = Ed25519Signer::generate().identity();

        assert!(!v.is_valid("m", &env));
        assert_eq!(v.cached_nonces(), 0);
    }

    #[test]
    fn test_envelope_serde_shape() {
        let signer = Ed25519Signer::generate();
        let env = AuthEnvelope::create(&signer, "m");
        let json = serde_json::to_value(&env).unwrap();
        for key in ["identity", "signature", "timestamp", "nonce"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(env.nonce.len(), NONCE_LEN * 2);
    }
}
