//! Fuzzing target for auth envelope decoding and verification.

#![no_main]
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use zlink_security::{AuthConfig, AuthEnvelope, AuthVerifier, Ed25519Verifier};

fuzz_target!(|data: &[u8]| {
    // Arbitrary envelopes must be rejected, never panic
    if let Ok(envelope) = serde_json::from_slice::<AuthEnvelope>(data) {
        let verifier = AuthVerifier::new(Arc::new(Ed25519Verifier), AuthConfig::default());
        let _ = verifier.verify("system:echo", &envelope);
    }
});
