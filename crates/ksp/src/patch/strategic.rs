//! Kubernetes strategic merge patch, restricted to the `v1.Secret` schema.
//!
//! A Secret declares only two list strategies: `metadata.finalizers` merges as
//! a set of primitives and `metadata.ownerReferences` merges by `uid`. Every
//! other list is replaced whole, as in a plain merge patch.

use serde_json::{Map, Value};

use super::PatchError;

const PATCH: &str = "$patch";
const RETAIN_KEYS: &str = "$retainKeys";
const DELETE_FROM_PRIMITIVE_LIST: &str = "$deleteFromPrimitiveList/";
const SET_ELEMENT_ORDER: &str = "$setElementOrder/";

enum ListStrategy {
    Replace,
    PrimitiveSet,
    MergeByKey(&'static str),
}

fn list_strategy(path: &[&str]) -> ListStrategy {
    match path {
        ["metadata", "finalizers"] => ListStrategy::PrimitiveSet,
        ["metadata", "ownerReferences"] => ListStrategy::MergeByKey("uid"),
        _ => ListStrategy::Replace,
    }
}

pub fn apply(base: &Value, patch: &Value) -> Result<Value, PatchError> {
    let Value::Object(patch) = patch else {
        return Err(PatchError::NotAnObject("strategic merge patch"));
    };
    let base = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let merged = merge_map(base, patch, &[])?.unwrap_or_default();
    Ok(Value::Object(merged))
}

/// Returns `None` when the patch deletes the map it was applied to.
fn merge_map(
    mut base: Map<String, Value>,
    patch: &Map<String, Value>,
    path: &[&str],
) -> Result<Option<Map<String, Value>>, PatchError> {
    match patch.get(PATCH) {
        None => {}
        Some(Value::String(d)) if d == "merge" => {}
        Some(Value::String(d)) if d == "replace" => return Ok(Some(without_directives(patch))),
        Some(Value::String(d)) if d == "delete" => return Ok(None),
        Some(other) => {
            return Err(PatchError::Invalid(format!("unknown $patch directive {other}")));
        }
    }

    let retain = match patch.get(RETAIN_KEYS) {
        None => None,
        Some(Value::Array(keys)) => Some(
            keys.iter()
                .map(|k| {
                    k.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| PatchError::Invalid("$retainKeys must list strings".into()))
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(_) => return Err(PatchError::Invalid("$retainKeys must be a list".into())),
    };

    for (key, value) in patch {
        if key == PATCH || key == RETAIN_KEYS || key.starts_with(SET_ELEMENT_ORDER) {
            continue;
        }

        if let Some(field) = key.strip_prefix(DELETE_FROM_PRIMITIVE_LIST) {
            let Value::Array(remove) = value else {
                return Err(PatchError::Invalid(format!("{key} must be a list")));
            };
            if let Some(Value::Array(list)) = base.get_mut(field) {
                list.retain(|item| !remove.contains(item));
            }
            continue;
        }

        if value.is_null() {
            base.remove(key);
            continue;
        }

        let child_path: Vec<&str> = path.iter().copied().chain([key.as_str()]).collect();
        let merged = match value {
            Value::Object(child_patch) => {
                let child = match base.remove(key) {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                merge_map(child, child_patch, &child_path)?.map(Value::Object)
            }
            Value::Array(items) => Some(merge_list(base.remove(key), items, &child_path)?),
            scalar => Some(scalar.clone()),
        };
        match merged {
            Some(v) => {
                base.insert(key.clone(), v);
            }
            None => {
                base.remove(key);
            }
        }
    }

    if let Some(retain) = retain {
        base.retain(|k, _| retain.iter().any(|r| r == k));
    }

    Ok(Some(base))
}

fn merge_list(base: Option<Value>, items: &[Value], path: &[&str]) -> Result<Value, PatchError> {
    let replace_all = items
        .iter()
        .any(|item| item.get(PATCH).and_then(Value::as_str) == Some("replace"));
    let plain: Vec<Value> = items
        .iter()
        .filter(|item| item.get(PATCH).is_none())
        .cloned()
        .collect();

    let mut list = match base {
        Some(Value::Array(list)) if !replace_all => list,
        _ => Vec::new(),
    };

    match list_strategy(path) {
        ListStrategy::Replace => Ok(Value::Array(plain)),
        ListStrategy::PrimitiveSet => {
            for item in plain {
                if !list.contains(&item) {
                    list.push(item);
                }
            }
            Ok(Value::Array(list))
        }
        ListStrategy::MergeByKey(key) => {
            for item in items {
                let Value::Object(element) = item else {
                    return Err(PatchError::Invalid(format!(
                        "elements of {} must be objects",
                        path.join(".")
                    )));
                };
                if element.get(PATCH).and_then(Value::as_str) == Some("replace") {
                    continue;
                }
                let id = element.get(key).ok_or_else(|| {
                    PatchError::Invalid(format!("{} element without merge key {key}", path.join(".")))
                })?;

                let position = list.iter().position(|e| e.get(key) == Some(id));
                match position {
                    Some(at) => {
                        let existing = match list[at].take() {
                            Value::Object(map) => map,
                            _ => Map::new(),
                        };
                        match merge_map(existing, element, path)? {
                            Some(map) => list[at] = Value::Object(map),
                            None => {
                                list.remove(at);
                            }
                        }
                    }
                    None if element.get(PATCH).and_then(Value::as_str) == Some("delete") => {}
                    None => list.push(Value::Object(without_directives(element))),
                }
            }
            Ok(Value::Array(list))
        }
    }
}

fn without_directives(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(k, _)| !k.starts_with('$'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn behaves_like_merge_patch_for_plain_fields() {
        let base = json!({"data": {"a": "MQ==", "b": "Mg=="}, "type": "Opaque"});
        let patch = json!({"data": {"a": null, "c": "Mw=="}});
        assert_eq!(
            apply(&base, &patch).unwrap(),
            json!({"data": {"b": "Mg==", "c": "Mw=="}, "type": "Opaque"})
        );
    }

    #[test]
    fn finalizers_merge_as_a_set() {
        let base = json!({"metadata": {"finalizers": ["a", "b"]}});
        let patch = json!({"metadata": {"finalizers": ["b", "c"]}});
        assert_eq!(
            apply(&base, &patch).unwrap(),
            json!({"metadata": {"finalizers": ["a", "b", "c"]}})
        );
    }

    #[test]
    fn delete_from_primitive_list() {
        let base = json!({"metadata": {"finalizers": ["a", "b", "c"]}});
        let patch = json!({"metadata": {"$deleteFromPrimitiveList/finalizers": ["b"]}});
        assert_eq!(
            apply(&base, &patch).unwrap(),
            json!({"metadata": {"finalizers": ["a", "c"]}})
        );
    }

    #[test]
    fn owner_references_merge_by_uid() {
        let base = json!({"metadata": {"ownerReferences": [
            {"uid": "1", "kind": "Deployment", "name": "web"},
            {"uid": "2", "kind": "Job", "name": "seed"}
        ]}});
        let patch = json!({"metadata": {
            "$setElementOrder/ownerReferences": [{"uid": "1"}, {"uid": "2"}, {"uid": "3"}],
            "ownerReferences": [
                {"uid": "1", "name": "web-v2"},
                {"uid": "2", "$patch": "delete"},
                {"uid": "3", "kind": "CronJob", "name": "rotate"}
            ]
        }});
        assert_eq!(
            apply(&base, &patch).unwrap(),
            json!({"metadata": {"ownerReferences": [
                {"uid": "1", "kind": "Deployment", "name": "web-v2"},
                {"uid": "3", "kind": "CronJob", "name": "rotate"}
            ]}})
        );
    }

    #[test]
    fn patch_replace_and_delete_directives() {
        let base = json!({"data": {"a": "MQ==", "b": "Mg=="}, "metadata": {"labels": {"x": "1"}}});
        let patch = json!({
            "data": {"$patch": "replace", "c": "Mw=="},
            "metadata": {"labels": {"$patch": "delete"}}
        });
        assert_eq!(
            apply(&base, &patch).unwrap(),
            json!({"data": {"c": "Mw=="}, "metadata": {}})
        );
    }

    #[test]
    fn retain_keys_drops_unlisted_fields() {
        let base = json!({"data": {"a": "MQ==", "b": "Mg=="}});
        let patch = json!({"data": {"$retainKeys": ["a", "c"], "c": "Mw=="}});
        assert_eq!(
            apply(&base, &patch).unwrap(),
            json!({"data": {"a": "MQ==", "c": "Mw=="}})
        );
    }

    #[test]
    fn unknown_directive_is_rejected() {
        let patch = json!({"data": {"$patch": "explode"}});
        assert!(matches!(
            apply(&json!({}), &patch),
            Err(PatchError::Invalid(_))
        ));
    }

    #[test]
    fn non_object_patch_is_rejected() {
        assert!(matches!(
            apply(&json!({}), &json!("x")),
            Err(PatchError::NotAnObject(_))
        ));
    }
}
