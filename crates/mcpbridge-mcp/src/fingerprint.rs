//! Stable input fingerprints for cache keying.
//!
//! Arguments are canonicalized (object keys sorted recursively, no
//! insignificant whitespace) before hashing, so `{"a":1,"b":2}` and
//! `{ "b": 2, "a": 1 }` fingerprint identically.

use serde_json::Value;

/// Blake3 hex digest over the canonical form of `args`.
pub fn fingerprint(args: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(args, &mut canonical);
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
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
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
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
        other => {
            out.push_str(&other.to_string());
        }
    }
}
