//! Conflict resolution strategies for concurrent writes to one path.

use chrono::{DateTime, Utc};

use crate::error::{Result, SyncError};
use crate::value::Value;

/// Picks the value that survives when a local edit and a remote edit race
/// on the same path
pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        path: &str,
        local: &Value,
        local_timestamp: DateTime<Utc>,
        remote: &Value,
        remote_timestamp: DateTime<Utc>,
    ) -> Result<Value>;

    fn name(&self) -> &'static str;
}

/// The strictly later write wins; ties keep the local value
#[derive(Clone, Copy, Debug, Default)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn resolve(
        &self,
        _path: &str,
        local: &Value,
        local_timestamp: DateTime<Utc>,
        remote: &Value,
        remote_timestamp: DateTime<Utc>,
    ) -> Result<Value> {
        if remote_timestamp > local_timestamp {
            Ok(remote.clone())
        } else {
            Ok(local.clone())
        }
    }

    fn name(&self) -> &'static str {
        "last-write-wins"
    }
}

/// The strictly earlier write wins; ties keep the local value
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstWriteWins;

impl ConflictResolver for FirstWriteWins {
    fn resolve(
        &self,
        _path: &str,
        local: &Value,
        local_timestamp: DateTime<Utc>,
        remote: &Value,
        remote_timestamp: DateTime<Utc>,
    ) -> Result<Value> {
        if remote_timestamp < local_timestamp {
            Ok(remote.clone())
        } else {
            Ok(local.clone())
        }
    }

    fn name(&self) -> &'static str {
        "first-write-wins"
    }
}

/// Shallow merge of two objects with remote keys taking precedence
///
/// Anything other than two objects falls back to last-write-wins, unless
/// `strict` is set, in which case the conflict is refused.
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeObjects {
    strict: bool,
}

impl MergeObjects {
    pub fn strict() -> Self {
        Self { strict: true }
    }
}

impl ConflictResolver for MergeObjects {
    fn resolve(
        &self,
        path: &str,
        local: &Value,
        local_timestamp: DateTime<Utc>,
        remote: &Value,
        remote_timestamp: DateTime<Utc>,
    ) -> Result<Value> {
        match (local, remote) {
            (Value::Object(local_map), Value::Object(remote_map)) => {
                let mut merged = local_map.clone();
                for (key, value) in remote_map {
                    merged.insert(key.clone(), value.clone());
                }
                Ok(Value::Object(merged))
            }
            _ if self.strict => Err(SyncError::ConflictError {
                path: path.to_string(),
                reason: format!("cannot merge {} with {}", local.kind(), remote.kind()),
            }),
            _ => LastWriteWins.resolve(path, local, local_timestamp, remote, remote_timestamp),
        }
    }

    fn name(&self) -> &'static str {
        "merge-objects"
    }
}
