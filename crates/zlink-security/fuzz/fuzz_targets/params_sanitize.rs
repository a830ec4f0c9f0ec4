#![no_main]
use libfuzzer_sys::fuzz_target;
use zlink_security::sanitize_params;

fuzz_target!(|data: &[u8]| {
    if let Ok(params) = serde_json::from_slice::<serde_json::Value>(data) {
        let _ = sanitize_params(&params);
    }
});
