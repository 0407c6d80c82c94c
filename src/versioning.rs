//! Conversion of source version fields into index engine versions.
//!
//! The index engine uses external versioning for optimistic concurrency:
//! a write is only applied if its version is greater than the stored one,
//! which is what makes replayed change events idempotent. The version comes
//! from a configurable source field and must be turned into a `u64` whose
//! ordering matches the source's notion of "newer".
//!
//! Accepted shapes:
//!
//! | Source value | Version |
//! |--------------|---------|
//! | non-negative integer | itself |
//! | non-negative float | truncated |
//! | numeric string | parsed |
//! | RFC 3339 string | milliseconds since epoch |
//! | `{"$numberLong": "N"}` | `N` |
//! | `{"$date": ..}` | milliseconds since epoch |
//! | `{"$timestamp": {"t": T, "i": I}}` | `T << 32 \| I` |
//!
//! Anything else yields `None`, and the operation is written unversioned.

use chrono::DateTime;
use serde_json::Value;

/// Convert a source version value into a monotonically comparable integer.
pub fn version_as_integer(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                Some(v)
            } else if let Some(f) = n.as_f64() {
                (f.is_finite() && f >= 0.0 && f <= u64::MAX as f64).then(|| f as u64)
            } else {
                None
            }
        }
        Value::String(s) => parse_version_str(s),
        Value::Object(obj) => {
            if let Some(long) = obj.get("$numberLong") {
                return version_as_integer(long);
            }
            if let Some(date) = obj.get("$date") {
                return version_as_integer(date);
            }
            if let Some(Value::Object(ts)) = obj.get("$timestamp") {
                let t = ts.get("t").and_then(Value::as_u64)?;
                let i = ts.get("i").and_then(Value::as_u64)?;
                if t > u64::from(u32::MAX) || i > u64::from(u32::MAX) {
                    return None;
                }
                return Some((t << 32) | i);
            }
            None
        }
        _ => None,
    }
}

fn parse_version_str(s: &str) -> Option<u64> {
    let trimmed = s.trim();
    if let Ok(v) = trimmed.parse::<u64>() {
        return Some(v);
    }
    let millis = DateTime::parse_from_rfc3339(trimmed).ok()?.timestamp_millis();
    u64::try_from(millis).ok()
}
