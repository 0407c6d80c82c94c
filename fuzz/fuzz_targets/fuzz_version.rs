//! Fuzz target for version conversion.
//!
//! This tests that `version_as_integer` never panics on arbitrary JSON
//! and that numeric strings agree with the numbers they spell.

#![no_main]

use index_replicator::versioning::version_as_integer;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &str| {
    // Should never panic
    if let Ok(value) = serde_json::from_str::<Value>(data) {
        let _ = version_as_integer(&value);
    }

    let as_string = version_as_integer(&Value::String(data.to_string()));
    if let Ok(n) = data.trim().parse::<u64>() {
        assert_eq!(as_string, Some(n));
    }
});
