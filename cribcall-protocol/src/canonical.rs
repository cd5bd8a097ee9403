//! Canonical JSON serialization for pairing transcripts
//!
//! Both pairing parties HMAC the same logical transcript, so the byte
//! representation must be identical regardless of how either side's JSON
//! library orders object keys. This follows the RFC 8785 approach: object
//! keys sorted lexicographically, nested objects canonicalized
//! recursively, no insignificant whitespace.

use serde_json::Value;

/// Serialize a JSON value in canonical form.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json handles string escaping
                out.push_str(&serde_json::to_string(key).expect("string serialization"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a single serde_json representation
        other => out.push_str(&serde_json::to_string(other).expect("scalar serialization")),
    }
}
