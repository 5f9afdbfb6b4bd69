//! Helpers for deterministic JSON serialization.
//!
//! Identity keys (input group keys, combination keys) are built from
//! serialized JSON, so object keys must be sorted recursively before
//! serialization or the same logical value could produce different keys.

use serde_json::{Map, Value};

/// Recursively sorts all object keys in a JSON value.
///
/// - Objects: keys are sorted alphabetically, values are recursively processed
/// - Arrays: elements are recursively processed (order preserved)
/// - Primitives: returned unchanged
pub fn sort_json_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut sorted_map = Map::new();
            for key in keys {
                if let Some(v) = map.get(&key) {
                    sorted_map.insert(key, sort_json_keys(v.clone()));
                }
            }
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_keys).collect()),
        other => other,
    }
}

/// Serializes a value with recursively sorted object keys.
///
/// This is the canonical string form used for identity keys throughout the
/// engine. Serialization of plain JSON values cannot fail.
pub fn canonical_string(value: &Value) -> String {
    sort_json_keys(value.clone()).to_string()
}
