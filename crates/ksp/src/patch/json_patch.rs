//! RFC 6902 JSON patch.

use serde::Deserialize;
use serde_json::Value;

use super::PatchError;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

/// Parse a patch document into its operations.
pub fn operations(patch: &Value) -> Result<Vec<Operation>, PatchError> {
    Vec::<Operation>::deserialize(patch).map_err(|e| PatchError::Invalid(e.to_string()))
}

pub fn apply(base: &Value, patch: &Value) -> Result<Value, PatchError> {
    let mut doc = base.clone();
    for op in operations(patch)? {
        match op {
            Operation::Add { path, value } => add(&mut doc, &path, value)?,
            Operation::Remove { path } => {
                remove(&mut doc, &path)?;
            }
            Operation::Replace { path, value } => {
                let slot = doc
                    .pointer_mut(&path)
                    .ok_or_else(|| PatchError::PathNotFound(path.clone()))?;
                *slot = value;
            }
            Operation::Move { from, path } => {
                if path.starts_with(&format!("{from}/")) {
                    return Err(PatchError::Invalid(format!(
                        "cannot move {from} into its own child {path}"
                    )));
                }
                let value = remove(&mut doc, &from)?;
                add(&mut doc, &path, value)?;
            }
            Operation::Copy { from, path } => {
                let value = doc
                    .pointer(&from)
                    .cloned()
                    .ok_or_else(|| PatchError::PathNotFound(from.clone()))?;
                add(&mut doc, &path, value)?;
            }
            Operation::Test { path, value } => {
                if doc.pointer(&path) != Some(&value) {
                    return Err(PatchError::TestFailed(path));
                }
            }
        }
    }
    Ok(doc)
}

/// Split a pointer into its parent pointer and unescaped last token.
fn split(path: &str) -> Result<(&str, String), PatchError> {
    let at = path
        .rfind('/')
        .ok_or_else(|| PatchError::Invalid(format!("{path:?} is not a JSON pointer")))?;
    let token = path[at + 1..].replace("~1", "/").replace("~0", "~");
    Ok((&path[..at], token))
}

fn index(token: &str, len: usize, path: &str) -> Result<usize, PatchError> {
    match token.parse::<usize>() {
        Ok(i) if i <= len && (token == "0" || !token.starts_with('0')) => Ok(i),
        _ => Err(PatchError::PathNotFound(path.to_owned())),
    }
}

fn add(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, token) = split(path)?;
    match doc.pointer_mut(parent) {
        Some(Value::Object(map)) => {
            map.insert(token, value);
            Ok(())
        }
        Some(Value::Array(list)) => {
            let at = if token == "-" {
                list.len()
            } else {
                index(&token, list.len(), path)?
            };
            list.insert(at, value);
            Ok(())
        }
        _ => Err(PatchError::PathNotFound(path.to_owned())),
    }
}

fn remove(doc: &mut Value, path: &str) -> Result<Value, PatchError> {
    let (parent, token) = split(path)?;
    let removed = match doc.pointer_mut(parent) {
        Some(Value::Object(map)) => map.remove(&token),
        Some(Value::Array(list)) => match index(&token, list.len(), path) {
            Ok(at) if at < list.len() => Some(list.remove(at)),
            _ => None,
        },
        _ => None,
    };
    removed.ok_or_else(|| PatchError::PathNotFound(path.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_remove_replace() {
        let base = json!({"data": {"a": "MQ=="}, "list": [1, 3]});
        let patch = json!([
            {"op": "add", "path": "/data/b", "value": "Mg=="},
            {"op": "add", "path": "/list/1", "value": 2},
            {"op": "add", "path": "/list/-", "value": 4},
            {"op": "remove", "path": "/data/a"},
            {"op": "replace", "path": "/data/b", "value": "Mw=="}
        ]);
        assert_eq!(
            apply(&base, &patch).unwrap(),
            json!({"data": {"b": "Mw=="}, "list": [1, 2, 3, 4]})
        );
    }

    #[test]
    fn move_and_copy() {
        let base = json!({"data": {"a": "MQ=="}});
        let patch = json!([
            {"op": "copy", "from": "/data/a", "path": "/data/b"},
            {"op": "move", "from": "/data/a", "path": "/data/c"}
        ]);
        assert_eq!(
            apply(&base, &patch).unwrap(),
            json!({"data": {"b": "MQ==", "c": "MQ=="}})
        );
    }

    #[test]
    fn escaped_tokens() {
        let base = json!({"metadata": {"annotations": {}}});
        let patch = json!([
            {"op": "add", "path": "/metadata/annotations/ksp~1inject", "value": "gpg"}
        ]);
        assert_eq!(
            apply(&base, &patch).unwrap(),
            json!({"metadata": {"annotations": {"ksp/inject": "gpg"}}})
        );
    }

    #[test]
    fn failed_test_aborts() {
        let base = json!({"data": {"a": "MQ=="}});
        let patch = json!([
            {"op": "test", "path": "/data/a", "value": "other"},
            {"op": "remove", "path": "/data/a"}
        ]);
        assert!(matches!(apply(&base, &patch), Err(PatchError::TestFailed(_))));
    }

    #[test]
    fn missing_paths_are_errors() {
        let base = json!({"data": {}});
        for patch in [
            json!([{"op": "remove", "path": "/data/nope"}]),
            json!([{"op": "replace", "path": "/data/nope", "value": 1}]),
            json!([{"op": "add", "path": "/missing/child", "value": 1}]),
        ] {
            assert!(matches!(apply(&base, &patch), Err(PatchError::PathNotFound(_))));
        }
    }

    #[test]
    fn unknown_op_is_invalid() {
        let patch = json!([{"op": "frobnicate", "path": "/a"}]);
        assert!(matches!(apply(&json!({}), &patch), Err(PatchError::Invalid(_))));
    }
}
