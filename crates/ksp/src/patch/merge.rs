//! RFC 7386 JSON merge patch.

use serde_json::{Map, Value};

use super::PatchError;

/// Merge `patch` into `target`. Objects merge key-wise, `null` deletes, and
/// every other value replaces what it lands on.
pub fn apply(target: &Value, patch: &Value) -> Value {
    let Value::Object(patch) = patch else {
        return patch.clone();
    };

    let mut merged = match target {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (key, value) in patch {
        if value.is_null() {
            merged.remove(key);
        } else {
            let next = apply(merged.get(key).unwrap_or(&Value::Null), value);
            merged.insert(key.clone(), next);
        }
    }
    Value::Object(merged)
}

/// Smallest merge patch taking `from` to `to`.
pub fn create(from: &Value, to: &Value) -> Result<Value, PatchError> {
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => Ok(Value::Object(diff(from, to))),
        (Value::Object(_), _) => Err(PatchError::NotAnObject("patch target")),
        _ => Err(PatchError::NotAnObject("patch source")),
    }
}

fn diff(from: &Map<String, Value>, to: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();

    for key in from.keys() {
        if !to.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    for (key, next) in to {
        match (from.get(key), next) {
            (Some(prev), next) if prev == next => {}
            (Some(Value::Object(prev)), Value::Object(next)) => {
                patch.insert(key.clone(), Value::Object(diff(prev, next)));
            }
            _ => {
                patch.insert(key.clone(), next.clone());
            }
        }
    }

    patch
}
