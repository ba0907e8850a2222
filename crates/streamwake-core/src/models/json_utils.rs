//! Helpers for reading loosely-typed API payloads.

use serde_json::Value;

/// Unwrap an optional `{"data": ...}` envelope.
pub fn unwrap_data(value: &Value) -> &Value {
    match value.get("data") {
        Some(inner) if !inner.is_null() => inner,
        _ => value,
    }
}

/// Walk a dotted path like `message.author.name`.
pub fn value_at<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
        .filter(|v| !v.is_null())
}

/// Identifiers arrive as either strings or numbers.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn str_at<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    value_at(value, path).and_then(|v| v.as_str())
}

pub fn id_at(value: &Value, path: &str) -> Option<String> {
    value_at(value, path).and_then(id_string)
}
