//! Rollback to retained versions, points in time and named markers
//!
//! A rollback never rewrites history. It commits the target document as a
//! new version, so it passes the validator and notifies subscribers like
//! any other write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::patch::{Patch, PatchOperation};
use crate::value::Value;

use super::{Snapshot, StateStore, StoreInner};

/// A named snapshot kept until it is deleted
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    pub name: String,
    pub description: Option<String>,
    pub snapshot: Snapshot,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackKind {
    Version,
    Timestamp,
    Marker,
}

/// Outcome of one rollback attempt, successful or not
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRecord {
    pub id: Uuid,
    pub kind: RollbackKind,
    /// Version id, RFC 3339 timestamp or marker name
    pub target: String,
    pub from_sequence: u64,
    pub to_sequence: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StoreInner {
    /// Document right after `history[index]` was applied
    fn replay_through(&self, index: usize) -> Result<Value> {
        self.history
            .iter()
            .take(index + 1)
            .try_fold(self.base.clone(), |doc, version| version.patch.apply(&doc))
    }

    fn push_rollback(&mut self, record: RollbackRecord, limit: usize) {
        self.rollbacks.push_back(record);
        while self.rollbacks.len() > limit {
            self.rollbacks.pop_front();
        }
    }
}

impl StateStore {
    /// Save the current document under `name`
    pub fn create_marker(&self, name: &str, description: Option<&str>) -> Result<Marker> {
        if name.is_empty() {
            return Err(SyncError::validation("marker name cannot be empty"));
        }
        let mut inner = self.write();
        if inner.markers.contains_key(name) {
            return Err(SyncError::validation(format!("marker {} already exists", name)));
        }
        let now = Utc::now();
        let marker = Marker {
            name: name.to_string(),
            description: description.map(str::to_string),
            snapshot: Snapshot {
                id: Uuid::new_v4(),
                document: inner.document.clone(),
                sequence: inner.sequence,
                timestamp: now,
            },
            created_at: now,
        };
        inner.markers.insert(name.to_string(), marker.clone());
        log::debug!("Created marker {} at sequence {}", name, inner.sequence);
        Ok(marker)
    }

    /// Markers in creation order
    pub fn list_markers(&self) -> Vec<Marker> {
        self.read().markers.values().cloned().collect()
    }

    pub fn delete_marker(&self, name: &str) -> Result<()> {
        self.write()
            .markers
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| SyncError::not_found(format!("marker {}", name)))
    }

    pub fn rollback_to_marker(&self, name: &str) -> Result<u64> {
        self.rollback_with(RollbackKind::Marker, name.to_string(), |inner| {
            inner
                .markers
                .get(name)
                .map(|marker| marker.snapshot.document.clone())
                .ok_or_else(|| SyncError::not_found(format!("marker {}", name)))
        })
    }

    /// Restore the document as it was right after version `id`.
    ///
    /// Only retained versions can be targeted.
    pub fn rollback_to_version(&self, id: Uuid) -> Result<u64> {
        self.rollback_with(RollbackKind::Version, id.to_string(), |inner| {
            let index = inner
                .history
                .iter()
                .position(|version| version.id == id)
                .ok_or_else(|| SyncError::not_found(format!("version {}", id)))?;
            inner.replay_through(index)
        })
    }

    /// Restore the document as of the newest retained version committed at
    /// or before `at`
    pub fn rollback_to_timestamp(&self, at: DateTime<Utc>) -> Result<u64> {
        self.rollback_with(RollbackKind::Timestamp, at.to_rfc3339(), |inner| {
            let index = inner
                .history
                .iter()
                .rposition(|version| version.timestamp <= at)
                .ok_or_else(|| {
                    SyncError::not_found(format!("no retained version at or before {}", at))
                })?;
            inner.replay_through(index)
        })
    }

    pub fn can_rollback(&self, id: Uuid) -> bool {
        self.read().history.iter().any(|version| version.id == id)
    }

    /// Rollback attempts, oldest first, bounded like the version history
    pub fn rollback_history(&self) -> Vec<RollbackRecord> {
        self.read().rollbacks.iter().cloned().collect()
    }

    fn rollback_with<F>(&self, kind: RollbackKind, target: String, resolve: F) -> Result<u64>
    where
        F: FnOnce(&StoreInner) -> Result<Value>,
    {
        let mut from_sequence = 0;
        let result = self
            .commit_with(
                |inner| {
                    from_sequence = inner.sequence;
                    let document = resolve(inner)?;
                    Ok(Patch::from(vec![PatchOperation::replace("/", document)]))
                },
                0,
            )
            .map(|(sequence, _)| sequence);

        match &result {
            Ok(sequence) => log::info!(
                "Rolled back to {:?} {} as version {}",
                kind,
                target,
                sequence
            ),
            Err(e) => log::warn!("Rollback to {:?} {} failed: {}", kind, target, e),
        }
        let record = RollbackRecord {
            id: Uuid::new_v4(),
            kind,
            target,
            from_sequence,
            to_sequence: result.as_ref().ok().copied(),
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
            timestamp: Utc::now(),
        };
        self.write().push_rollback(record, self.config.max_history);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::validation::RequiredFields;
    use serde_json::json;
    use std::time::Duration;

    fn doc(v: serde_json::Value) -> Value {
        Value::from(v)
    }

    #[test]
    fn test_rollback_to_version() {
        let store = StateStore::default();
        store.set("/title", "draft").unwrap();
        store.set("/tags", Value::Array(vec!["a".into()])).unwrap();
        let target = store.get_history()[1].id;
        store.set("/title", "final").unwrap();
        store.delete("/tags").unwrap();

        assert!(store.can_rollback(target));
        let sequence = store.rollback_to_version(target).unwrap();
        assert_eq!(sequence, 5);
        assert_eq!(store.get_state(), doc(json!({"title": "draft", "tags": ["a"]})));
        assert_eq!(store.replay_history().unwrap(), store.get_state());

        let records = store.rollback_history();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RollbackKind::Version);
        assert_eq!(records[0].from_sequence, 4);
        assert_eq!(records[0].to_sequence, Some(5));
        assert!(records[0].success);
    }

    #[test]
    fn test_rollback_to_evicted_version_fails() {
        let store = StateStore::new(StoreConfig { max_history: 2 }).unwrap();
        store.set("/n", 1).unwrap();
        let evicted = store.get_history()[0].id;
        store.set("/n", 2).unwrap();
        store.set("/n", 3).unwrap();

        assert!(!store.can_rollback(evicted));
        let err = store.rollback_to_version(evicted).unwrap_err();
        assert!(matches!(err, SyncError::NotFoundError(_)));
        assert_eq!(store.version(), 3);

        let records = store.rollback_history();
        assert!(!records[0].success);
        assert_eq!(records[0].to_sequence, None);
        assert!(records[0].error.is_some());
    }

    #[test]
    fn test_rollback_to_timestamp() {
        let store = StateStore::default();
        store.set("/step", 1).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let checkpoint = Utc::now();
        std::thread::sleep(Duration::from_millis(5));
        store.set("/step", 2).unwrap();
        store.set("/late", true).unwrap();

        store.rollback_to_timestamp(checkpoint).unwrap();
        assert_eq!(store.get_state(), doc(json!({"step": 1})));

        let before_everything = checkpoint - chrono::Duration::hours(1);
        assert!(matches!(
            store.rollback_to_timestamp(before_everything),
            Err(SyncError::NotFoundError(_))
        ));
    }

    #[test]
    fn test_markers() {
        let store = StateStore::default();
        store.set("/stage", "alpha").unwrap();
        store.create_marker("alpha", Some("first cut")).unwrap();
        store.set("/stage", "beta").unwrap();
        store.create_marker("beta", None).unwrap();

        assert!(matches!(
            store.create_marker("alpha", None),
            Err(SyncError::ValidationError(_))
        ));
        assert!(store.create_marker("", None).is_err());

        let names: Vec<String> = store.list_markers().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        store.set("/stage", "gamma").unwrap();
        store.rollback_to_marker("alpha").unwrap();
        assert_eq!(store.get("/stage").unwrap(), Value::from("alpha"));
        assert_eq!(store.version(), 4);

        store.delete_marker("alpha").unwrap();
        assert!(matches!(
            store.delete_marker("alpha"),
            Err(SyncError::NotFoundError(_))
        ));
        assert!(store.rollback_to_marker("alpha").is_err());
        assert_eq!(store.list_markers().len(), 1);
        assert_eq!(store.rollback_history().len(), 2);
    }

    #[test]
    fn test_rollback_target_must_pass_validation() {
        let store = StateStore::default();
        store.set("/a", 1).unwrap();
        store.create_marker("bare", None).unwrap();
        store.set("/owner", "ana").unwrap();
        store
            .add_validation_rule(RequiredFields::new(["/owner"]).unwrap())
            .unwrap();

        let err = store.rollback_to_marker("bare").unwrap_err();
        assert!(matches!(err, SyncError::ValidationError(_)));
        assert_eq!(store.get_state(), doc(json!({"a": 1, "owner": "ana"})));
        assert_eq!(store.version(), 2);
        assert!(!store.rollback_history()[0].success);
    }
}
