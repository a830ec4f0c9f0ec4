//! Signing seam for command authentication.
//!
//! Identities are self-certifying: `ed25519:<hex public key>`. A verifier
//! needs nothing but the identity string to check a signature.

use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use rand_core::OsRng;
use std::fmt;

use crate::error::SecurityError;

const ED25519_PREFIX: &str = "ed25519:";

/// Stable cryptographic identifier of a peer.
pub type Identity = String;

/// Produces signatures for the local identity.
pub trait Signer: Send + Sync {
    /// The identity signatures verify against
    fn identity(&self) -> Identity;

    /// Sign `message`
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// Checks a signature against a claimed identity.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, identity: &str, message: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 signer backed by an in-memory key.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }

    pub fn from_secret_hex(hex_secret: &str) -> Result<Self, SecurityError> {
        let bytes = hex::decode(hex_secret.trim())
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SecurityError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("identity", &self.identity())
            .finish()
    }
}

impl Signer for Ed25519Signer {
    fn identity(&self) -> Identity {
        identity_for_key(&self.key.verifying_key())
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }
}

/// Identity string for an Ed25519 public key
pub fn identity_for_key(key: &VerifyingKey) -> Identity {
    format!("{}{}", ED25519_PREFIX, hex::encode(key.as_bytes()))
}

/// Parse an `ed25519:` identity back into its public key
pub fn parse_identity(identity: &str) -> Result<VerifyingKey, SecurityError> {
    let hex_key = identity
        .strip_prefix(ED25519_PREFIX)
        .ok_or_else(|| SecurityError::InvalidKey(format!("unsupported identity scheme: {}", identity)))?;
    let bytes = hex::decode(hex_key).map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
    let key: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SecurityError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&key).map_err(|e| SecurityError::InvalidKey(e.to_string()))
}

/// Verifier for `ed25519:` identities.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, identity: &str, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = parse_identity(identity) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_strict(message, &signature).is_ok()
    }
}
