//! Helpers over the JSON execution document

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

/// Wrap scalar values as `{ "value": ... }` so state input stays
/// object-typed. Objects and arrays pass through untouched.
pub fn wrap_scalar(value: Value) -> Value {
    match value {
        Value::Object(_) | Value::Array(_) => value,
        scalar => {
            let mut wrapped = Map::new();
            wrapped.insert("value".to_string(), scalar);
            Value::Object(wrapped)
        }
    }
}

/// Shallow-merge two values. When both are objects, `overlay`'s keys win;
/// otherwise `overlay` replaces `base` entirely.
pub fn shallow_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (k, v) in b {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

/// Compare two JSON numbers numerically. Integer and float representations
/// of the same quantity compare equal.
pub fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Some(x.cmp(&y));
    }
    let x = a.as_f64()?;
    let y = b.as_f64()?;
    x.partial_cmp(&y)
}

/// Whether a string parses as an RFC 3339 timestamp.
pub fn is_timestamp(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
}
