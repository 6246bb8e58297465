//! Patch engine
//!
//! A [`Patch`] is an ordered list of add/remove/replace/move operations that
//! is applied atomically: operations run against a working copy and the
//! caller only ever sees the result of a fully successful application.

mod diff;

pub use diff::diff;

use std::mem;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SyncError};
use crate::store::StateChange;
use crate::value::{array_index, Path, Value};

/// Kind of a patch operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
    Move,
}

impl PatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOp::Add => "add",
            PatchOp::Remove => "remove",
            PatchOp::Replace => "replace",
            PatchOp::Move => "move",
        }
    }
}

/// A single patch operation as carried on the wire
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// A present `"value": null` is `Some(Value::Null)`, not a missing value
fn present_value<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op: PatchOp::Add,
            path: path.into(),
            value: Some(value.into()),
            from: None,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            value: None,
            from: None,
        }
    }

    pub fn replace(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op: PatchOp::Replace,
            path: path.into(),
            value: Some(value.into()),
            from: None,
        }
    }

    pub fn move_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Move,
            path: path.into(),
            value: None,
            from: Some(from.into()),
        }
    }

    /// Check the operation's shape without touching a document
    pub fn validate(&self) -> Result<()> {
        let path = Path::parse(&self.path)?;
        match self.op {
            PatchOp::Add | PatchOp::Replace => {
                if self.value.is_none() {
                    return Err(SyncError::validation(format!(
                        "{} at {} requires a value",
                        self.op.as_str(),
                        self.path
                    )));
                }
            }
            PatchOp::Remove => {
                if path.is_root() {
                    return Err(SyncError::validation("cannot remove the document root"));
                }
            }
            PatchOp::Move => {
                let from = self.from.as_deref().ok_or_else(|| {
                    SyncError::validation(format!("move to {} requires a from path", self.path))
                })?;
                let from = Path::parse(from)?;
                if from.is_root() {
                    return Err(SyncError::validation("cannot move the document root"));
                }
                if path != from && path.starts_with(&from) {
                    return Err(SyncError::validation(format!(
                        "cannot move {from} into its own descendant {path}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// An ordered sequence of operations, applied all-or-nothing
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch {
    ops: Vec<PatchOperation>,
}

impl Patch {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn push(&mut self, op: PatchOperation) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, other: Patch) {
        self.ops.extend(other.ops);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PatchOperation> {
        self.ops.iter()
    }

    pub fn operations(&self) -> &[PatchOperation] {
        &self.ops
    }

    /// Validate every operation's shape
    pub fn validate(&self) -> Result<()> {
        self.ops.iter().try_for_each(PatchOperation::validate)
    }

    /// Apply to a copy of `doc`; `doc` itself is never modified
    pub fn apply(&self, doc: &Value) -> Result<Value> {
        self.apply_tracked(doc).map(|(value, _)| value)
    }

    /// Apply and report one [`StateChange`] per mutation
    pub(crate) fn apply_tracked(&self, doc: &Value) -> Result<(Value, Vec<StateChange>)> {
        self.validate()?;

        let timestamp = Utc::now();
        let mut working = doc.clone();
        let mut changes = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            apply_operation(&mut working, op, timestamp, &mut changes)?;
        }
        Ok((working, changes))
    }
}

impl From<Vec<PatchOperation>> for Patch {
    fn from(ops: Vec<PatchOperation>) -> Self {
        Self { ops }
    }
}

impl FromIterator<PatchOperation> for Patch {
    fn from_iter<I: IntoIterator<Item = PatchOperation>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Patch {
    type Item = PatchOperation;
    type IntoIter = std::vec::IntoIter<PatchOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

impl<'a> IntoIterator for &'a Patch {
    type Item = &'a PatchOperation;
    type IntoIter = std::slice::Iter<'a, PatchOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

/// Apply `patch` to `doc`, returning the new document
pub fn apply(doc: &Value, patch: &Patch) -> Result<Value> {
    patch.apply(doc)
}

fn apply_operation(
    doc: &mut Value,
    op: &PatchOperation,
    timestamp: DateTime<Utc>,
    changes: &mut Vec<StateChange>,
) -> Result<()> {
    let path = Path::parse(&op.path)?;
    match op.op {
        PatchOp::Add => {
            let value = required_value(op)?;
            let old = add_at(doc, &path, value.clone())?;
            changes.push(StateChange::new(&path, PatchOp::Add, old, Some(value), timestamp));
        }
        PatchOp::Remove => {
            let old = remove_at(doc, &path)?;
            changes.push(StateChange::new(&path, PatchOp::Remove, Some(old), None, timestamp));
        }
        PatchOp::Replace => {
            let value = required_value(op)?;
            let old = replace_at(doc, &path, value.clone())?;
            changes.push(StateChange::new(
                &path,
                PatchOp::Replace,
                Some(old),
                Some(value),
                timestamp,
            ));
        }
        PatchOp::Move => {
            let from = Path::parse(op.from.as_deref().unwrap_or_default())?;
            if from == path {
                // Moving onto itself only has to prove the source exists
                doc.locate(&from)?;
                return Ok(());
            }
            let moved = remove_at(doc, &from)?;
            changes.push(StateChange::new(
                &from,
                PatchOp::Remove,
                Some(moved.clone()),
                None,
                timestamp,
            ));
            let old = add_at(doc, &path, moved.clone())?;
            changes.push(StateChange::new(&path, PatchOp::Add, old, Some(moved), timestamp));
        }
    }
    Ok(())
}

fn required_value(op: &PatchOperation) -> Result<Value> {
    op.value.clone().ok_or_else(|| {
        SyncError::validation(format!("{} at {} requires a value", op.op.as_str(), op.path))
    })
}

/// Insert `value`; returns the value it displaced, if any
fn add_at(doc: &mut Value, path: &Path, value: Value) -> Result<Option<Value>> {
    let Some((parent_path, key)) = path.split_last() else {
        return Ok(Some(mem::replace(doc, value)));
    };

    match doc.locate_mut(&parent_path)? {
        Value::Object(map) => Ok(map.insert(key.to_string(), value)),
        Value::Array(items) => {
            let idx = if key == "-" {
                items.len()
            } else {
                array_index(key).ok_or_else(|| {
                    SyncError::validation(format!("invalid array index {key:?} in {path}"))
                })?
            };
            if idx > items.len() {
                return Err(SyncError::validation(format!(
                    "array index {idx} out of bounds at {path}"
                )));
            }
            items.insert(idx, value);
            Ok(None)
        }
        other => Err(SyncError::validation(format!(
            "cannot add into {} at {path}",
            other.kind()
        ))),
    }
}

fn remove_at(doc: &mut Value, path: &Path) -> Result<Value> {
    let Some((parent_path, key)) = path.split_last() else {
        return Err(SyncError::validation("cannot remove the document root"));
    };

    match doc.locate_mut(&parent_path)? {
        Value::Object(map) => map
            .shift_remove(key)
            .ok_or_else(|| SyncError::not_found(path.to_string())),
        Value::Array(items) => {
            let idx = array_index(key).ok_or_else(|| {
                SyncError::validation(format!("invalid array index {key:?} in {path}"))
            })?;
            if idx >= items.len() {
                return Err(SyncError::not_found(path.to_string()));
            }
            Ok(items.remove(idx))
        }
        other => Err(SyncError::validation(format!(
            "cannot remove from {} at {path}",
            other.kind()
        ))),
    }
}

fn replace_at(doc: &mut Value, path: &Path, value: Value) -> Result<Value> {
    let target = doc.locate_mut(path)?;
    Ok(mem::replace(target, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Value {
        Value::from(v)
    }

    #[test]
    fn test_apply_in_order() {
        let base = doc(json!({"user": {"name": "Jane"}}));
        let patch = Patch::from(vec![
            PatchOperation::add("/user/age", 30),
            PatchOperation::replace("/user/name", "Jane Smith"),
            PatchOperation::add("/tags", Value::Array(vec![])),
            PatchOperation::add("/tags/-", "admin"),
            PatchOperation::add("/tags/0", "first"),
        ]);

        let result = patch.apply(&base).unwrap();
        assert_eq!(
            result,
            doc(json!({"user": {"name": "Jane Smith", "age": 30}, "tags": ["first", "admin"]}))
        );
    }

    #[test]
    fn test_failed_operation_leaves_input_untouched() {
        let base = doc(json!({"a": 1}));
        let patch = Patch::from(vec![
            PatchOperation::replace("/a", 2),
            PatchOperation::remove("/missing"),
        ]);

        let err = patch.apply(&base).unwrap_err();
        assert!(matches!(err, SyncError::NotFoundError(_)));
        assert_eq!(base, doc(json!({"a": 1})));
    }

    #[test]
    fn test_move_reports_two_changes() {
        let base = doc(json!({"draft": {"title": "x"}, "published": {}}));
        let patch = Patch::from(vec![PatchOperation::move_from(
            "/draft/title",
            "/published/title",
        )]);

        let (result, changes) = patch.apply_tracked(&base).unwrap();
        assert_eq!(result, doc(json!({"draft": {}, "published": {"title": "x"}})));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path, "/draft/title");
        assert_eq!(changes[0].operation, PatchOp::Remove);
        assert_eq!(changes[1].path, "/published/title");
        assert_eq!(changes[1].new_value, Some(Value::from("x")));
    }

    #[test]
    fn test_shape_validation() {
        let missing_value = PatchOperation {
            op: PatchOp::Replace,
            path: "/a".into(),
            value: None,
            from: None,
        };
        assert!(missing_value.validate().is_err());
        assert!(PatchOperation::remove("/").validate().is_err());
        assert!(PatchOperation::move_from("/a", "/a/b").validate().is_err());
        assert!(PatchOperation {
            op: PatchOp::Move,
            path: "/b".into(),
            value: None,
            from: None,
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_array_type_mismatch_is_validation_error() {
        let base = doc(json!({"list": [1, 2]}));
        let err = Patch::from(vec![PatchOperation::replace("/list/first", 0)])
            .apply(&base)
            .unwrap_err();
        assert!(matches!(err, SyncError::ValidationError(_)));

        let err = Patch::from(vec![PatchOperation::add("/list/5", 0)])
            .apply(&base)
            .unwrap_err();
        assert!(matches!(err, SyncError::ValidationError(_)));
    }

    #[test]
    fn test_wire_format() {
        let raw = r#"[{"op":"add","path":"/a","value":null},{"op":"move","path":"/b","from":"/a"},{"op":"remove","path":"/b"}]"#;
        let patch: Patch = serde_json::from_str(raw).unwrap();
        assert_eq!(patch.len(), 3);
        assert_eq!(patch.operations()[0].value, Some(Value::Null));
        assert_eq!(patch.operations()[1].from.as_deref(), Some("/a"));
        assert_eq!(serde_json::to_string(&patch).unwrap(), raw);
    }

    #[test]
    fn test_replace_root() {
        let base = doc(json!({"a": 1}));
        let patch = Patch::from(vec![PatchOperation::replace("/", doc(json!({"b": 2})))]);
        assert_eq!(patch.apply(&base).unwrap(), doc(json!({"b": 2})));
    }
}
