//! Wall-clock helpers.
//!
//! All persisted and emitted timestamps are Unix epoch milliseconds.

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalizes a protocol timestamp to milliseconds.
///
/// Envelopes carry seconds; values that already look like milliseconds
/// (13+ digits) pass through unchanged.
pub fn to_millis(timestamp: i64) -> i64 {
    if timestamp.abs() >= 100_000_000_000 {
        timestamp
    } else {
        timestamp * 1000
    }
}

/// Reads a protocol "long": a number, a numeric string, or `{low, high}`.
pub fn long_from_json(value: &serde_json::Value) -> Option<i64> {
    use serde_json::Value;

    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => {
            let low = map.get("low")?.as_i64()?;
            let high = map.get("high").and_then(Value::as_i64).unwrap_or(0);
            Some((high << 32) | (low & 0xFFFF_FFFF))
        }
        _ => None,
    }
}
