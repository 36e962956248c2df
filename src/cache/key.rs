//! Content-addressable cache keys.
//!
//! Keys are Sha256 over a canonical serialization of the normalized inputs.
//! Canonical means recursively key-sorted objects, so two semantically
//! identical inputs hash the same regardless of field ordering.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded Sha256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Recursively sort object keys so serialization order is deterministic.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::with_capacity(sorted.len());
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Derive a stable cache key from normalized enrichment inputs.
///
/// Inputs are the content fingerprints plus prompt and executor/model
/// configuration; changed content naturally yields a different key, so no
/// explicit invalidation is needed for it.
pub fn generate_key(inputs: &Value) -> String {
    let canonical = canonicalize(inputs);
    sha256_hex(canonical.to_string().as_bytes())
}
