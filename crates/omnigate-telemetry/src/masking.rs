//! Header masking and body truncation applied before events leave the
//! process.

use serde_json::{Map, Value};

pub const DEFAULT_SENSITIVE_HEADERS: [&str; 5] = [
    "authorization",
    "x-api-key",
    "api-key",
    "cookie",
    "set-cookie",
];

/// Mask sensitive header values, keeping 4+4 chars of long values.
pub fn mask_headers(headers: &Value, sensitive: &[&str]) -> Value {
    let Value::Object(map) = headers else {
        return headers.clone();
    };
    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        if sensitive.iter().any(|s| key.eq_ignore_ascii_case(s)) {
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            let masked = if text.len() > 8 {
                format!("{}****{}", &text[..4], &text[text.len() - 4..])
            } else {
                "****".to_string()
            };
            out.insert(key.clone(), Value::String(masked));
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    Value::Object(out)
}

/// Best-effort size cap. Oversized structured bodies collapse to a marker
/// object carrying a prefix of their serialization.
pub fn truncate_body(body: &Value, max_bytes: usize) -> Value {
    if max_bytes == 0 {
        return body.clone();
    }
    let serialized = body.to_string();
    if serialized.len() <= max_bytes {
        return body.clone();
    }
    let mut cut = max_bytes;
    while cut > 0 && !serialized.is_char_boundary(cut) {
        cut -= 1;
    }
    serde_json::json!({
        "_truncated": true,
        "_original_size": serialized.len(),
        "_content": &serialized[..cut],
    })
}
