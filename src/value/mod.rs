//! The document value model
//!
//! A [`Value`] is a tagged JSON-like tree. Objects keep insertion order so
//! diffs and exports are deterministic. Numbers keep their JSON
//! representation: `1` and `1.0` are distinct values.

mod path;

pub use path::Path;
pub(crate) use path::array_index;

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// An ordered object body
pub type Map = IndexMap<String, Value>;

/// A JSON-like document value
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(Map),
}

impl Value {
    /// An empty object, the initial document
    pub fn object() -> Self {
        Value::Object(Map::new())
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Name of the variant, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Look up a value by path, `None` if anything along the way is missing
    pub fn pointer(&self, path: &Path) -> Option<&Value> {
        self.locate(path).ok()
    }

    /// Look up a value by path, distinguishing missing entries from
    /// traversal through a non-container
    pub fn locate(&self, path: &Path) -> Result<&Value> {
        let mut cur = self;
        for token in path.tokens() {
            cur = match cur {
                Value::Object(map) => map
                    .get(token)
                    .ok_or_else(|| SyncError::not_found(path.to_string()))?,
                Value::Array(items) => {
                    let idx = array_index(token).ok_or_else(|| bad_index(token, path))?;
                    items
                        .get(idx)
                        .ok_or_else(|| SyncError::not_found(path.to_string()))?
                }
                other => return Err(not_a_container(other, path)),
            };
        }
        Ok(cur)
    }

    /// Mutable counterpart of [`Value::locate`]
    pub fn locate_mut(&mut self, path: &Path) -> Result<&mut Value> {
        let mut cur = self;
        for token in path.tokens() {
            cur = match cur {
                Value::Object(map) => map
                    .get_mut(token)
                    .ok_or_else(|| SyncError::not_found(path.to_string()))?,
                Value::Array(items) => {
                    let idx = array_index(token).ok_or_else(|| bad_index(token, path))?;
                    items
                        .get_mut(idx)
                        .ok_or_else(|| SyncError::not_found(path.to_string()))?
                }
                other => return Err(not_a_container(other, path)),
            };
        }
        Ok(cur)
    }
}

fn bad_index(token: &str, path: &Path) -> SyncError {
    SyncError::validation(format!("invalid array index {token:?} in {path}"))
}

fn not_a_container(value: &Value, path: &Path) -> SyncError {
    SyncError::validation(format!("cannot traverse into {} at {path}", value.kind()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<unserializable>"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats have no JSON form and become `Null`
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Object(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Value::Number(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}
