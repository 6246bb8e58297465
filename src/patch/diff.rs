//! Structural diff between two documents.

use super::{Patch, PatchOperation};
use crate::value::{Path, Value};

/// Compute a patch that turns `old` into `new`.
///
/// Objects are walked key by key in insertion order: keys of `old` first
/// (yielding `remove` or a recursive diff), then keys only present in `new`
/// (yielding `add`). Any other difference, including arrays whose contents
/// differ, becomes a single `replace` of the whole node.
pub fn diff(old: &Value, new: &Value) -> Patch {
    let mut patch = Patch::new();
    diff_into(old, new, &Path::root(), &mut patch);
    patch
}

fn diff_into(old: &Value, new: &Value, path: &Path, out: &mut Patch) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                let child = path.child(key.as_str());
                match new_map.get(key) {
                    Some(new_value) => diff_into(old_value, new_value, &child, out),
                    None => out.push(PatchOperation::remove(child.to_string())),
                }
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    out.push(PatchOperation::add(
                        path.child(key.as_str()).to_string(),
                        new_value.clone(),
                    ));
                }
            }
        }
        _ => out.push(PatchOperation::replace(path.to_string(), new.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Value {
        Value::from(v)
    }

    #[test]
    fn test_replace_then_add() {
        let patch = diff(&doc(json!({"a": 1})), &doc(json!({"a": 2, "b": 3})));
        assert_eq!(
            patch.operations(),
            &[PatchOperation::replace("/a", 2), PatchOperation::add("/b", 3)]
        );
    }

    #[test]
    fn test_identical_documents_yield_empty_patch() {
        let d = doc(json!({"a": {"b": [1, 2]}}));
        assert!(diff(&d, &d).is_empty());
    }

    #[test]
    fn test_nested_objects_recurse_arrays_replace() {
        let old: Value = serde_json::from_str(
            r#"{"user": {"name": "Jane", "roles": ["a"]}, "gone": true}"#,
        )
        .unwrap();
        let new = doc(json!({"user": {"name": "Jane", "roles": ["a", "b"]}}));

        let patch = diff(&old, &new);
        assert_eq!(
            patch.operations(),
            &[
                PatchOperation::replace("/user/roles", doc(json!(["a", "b"]))),
                PatchOperation::remove("/gone"),
            ]
        );
    }

    #[test]
    fn test_keys_needing_escape() {
        let old = doc(json!({}));
        let new = doc(json!({"a/b": 1}));
        let patch = diff(&old, &new);
        assert_eq!(patch.operations()[0].path, "/a~1b");
        assert_eq!(patch.apply(&old).unwrap(), new);
    }

    #[test]
    fn test_round_trip() {
        let old = doc(json!({
            "settings": {"theme": "dark", "font": {"size": 12, "family": "mono"}},
            "items": [1, 2, 3],
            "removed": {"x": 1}
        }));
        let new = doc(json!({
            "settings": {"theme": "light", "font": {"size": 14}, "lang": "en"},
            "items": [3, 2, 1],
            "added": null
        }));

        let patch = diff(&old, &new);
        assert_eq!(patch.apply(&old).unwrap(), new);
    }

    #[test]
    fn test_type_change_replaces_node() {
        let old = doc(json!({"a": {"b": 1}}));
        let new = doc(json!({"a": "flat"}));
        assert_eq!(diff(&old, &new).operations(), &[PatchOperation::replace("/a", "flat")]);
    }
}
