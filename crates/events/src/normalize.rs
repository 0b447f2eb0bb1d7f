//! Pure normalization rules applied to every envelope field on the way in and out.
//!
//! Incoming values arrive loosely typed (Redis stream fields are always strings,
//! JSON numbers may be floats), so each rule accepts integers, floats and numeric
//! strings and never fails: unparsable input falls back to a default.

use serde_json::Value;

/// Lower bound for any event TTL.
pub const MINIMUM_TTL: u32 = 0;

/// Normalize an action path so it always starts with `/`.
///
/// ```
/// use unipubsub_events::normalize_action;
///
/// assert_eq!(normalize_action(""), "/");
/// assert_eq!(normalize_action("user/created"), "/user/created");
/// assert_eq!(normalize_action("/user/created"), "/user/created");
/// ```
pub fn normalize_action(action: &str) -> String {
    if action.starts_with('/') {
        action.to_string()
    } else {
        format!("/{action}")
    }
}

/// Coerce a loosely typed TTL into a value clamped at [`MINIMUM_TTL`].
///
/// `None` (key absent) and `null` yield the minimum. Unparsable values are read
/// as 0 and then clamped.
pub fn normalize_ttl(value: Option<&Value>) -> u32 {
    match value {
        None | Some(Value::Null) => MINIMUM_TTL,
        Some(v) => clamp_ttl(coerce_i64(v)),
    }
}

/// Clamp an already numeric TTL (producer side).
pub fn clamp_ttl(ttl: i64) -> u32 {
    if ttl < i64::from(MINIMUM_TTL) {
        MINIMUM_TTL
    } else {
        u32::try_from(ttl).unwrap_or(u32::MAX)
    }
}

/// Coerce a loosely typed unix-millisecond timestamp; anything unusable is 0.
pub fn parse_timestamp(value: Option<&Value>) -> i64 {
    value.map(coerce_i64).unwrap_or(0)
}

fn coerce_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    }
}
