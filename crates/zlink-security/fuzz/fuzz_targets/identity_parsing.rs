//! Fuzzing target for identity strings.

#![no_main]
use libfuzzer_sys::fuzz_target;
use zlink_security::identity::parse_identity;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = parse_identity(s);
    }
});
