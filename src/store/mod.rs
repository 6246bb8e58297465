//! Versioned document store
//!
//! The [`StateStore`] owns the live document, a bounded history of
//! [`Version`]s and a set of path-scoped subscriptions. Every write goes
//! through a single commit path: the patch is applied to the live document
//! under the write lock, one new Version is recorded, the lock is released,
//! and only then are subscribers notified.

mod rollback;
mod subscription;
mod transaction;
pub mod validation;

pub use rollback::{Marker, RollbackKind, RollbackRecord};
pub use subscription::{path_matches, StateSubscriber, SubscriptionHandle};
pub use transaction::Transaction;
pub use validation::{StateValidator, ValidationReport, ValidationRule};

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{Result, SyncError};
use crate::patch::{Patch, PatchOp, PatchOperation};
use crate::value::{Path, Value};

use subscription::SubscriberRegistry;

/// One mutation reported to subscribers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub path: String,
    pub operation: PatchOp,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl StateChange {
    pub(crate) fn new(
        path: &Path,
        operation: PatchOp,
        old_value: Option<Value>,
        new_value: Option<Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            path: path.to_string(),
            operation,
            old_value,
            new_value,
            timestamp,
        }
    }
}

/// A committed patch and the sequence number it produced
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub sequence: u64,
    pub patch: Patch,
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
}

/// An immutable copy of the document at one sequence
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub document: Value,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// On-disk form produced by [`StateStore::export`]
#[derive(Serialize, Deserialize)]
struct ExportData {
    document: Value,
    version: u64,
}

struct StoreInner {
    document: Value,
    sequence: u64,
    history: VecDeque<Version>,
    /// Document as it was before the oldest retained version
    base: Value,
    markers: IndexMap<String, Marker>,
    rollbacks: VecDeque<RollbackRecord>,
}

impl StoreInner {
    fn record(&mut self, version: Version, max_history: usize) {
        self.history.push_back(version);
        while self.history.len() > max_history {
            let Some(evicted) = self.history.pop_front() else {
                break;
            };
            match evicted.patch.apply(&self.base) {
                Ok(next) => self.base = next,
                Err(e) => log::error!(
                    "History base could not absorb version {}: {}",
                    evicted.sequence,
                    e
                ),
            }
        }
    }
}

/// Thread-safe versioned document store
///
/// Share it behind an `Arc`. Readers run concurrently; writers are exclusive.
pub struct StateStore {
    inner: RwLock<StoreInner>,
    subscribers: Arc<SubscriberRegistry>,
    validator: RwLock<StateValidator>,
    config: StoreConfig,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::with_config(StoreConfig::default())
    }
}

impl StateStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    fn with_config(config: StoreConfig) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                document: Value::object(),
                sequence: 0,
                history: VecDeque::with_capacity(config.max_history),
                base: Value::object(),
                markers: IndexMap::new(),
                rollbacks: VecDeque::new(),
            }),
            subscribers: Arc::new(SubscriberRegistry::default()),
            validator: RwLock::new(StateValidator::new()),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn validator(&self) -> RwLockReadGuard<'_, StateValidator> {
        self.validator.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a rule checked against every future commit
    pub fn add_validation_rule(&self, rule: impl ValidationRule + 'static) -> Result<()> {
        self.validator
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_rule(rule)
    }

    pub fn remove_validation_rule(&self, id: &str) -> bool {
        self.validator
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_rule(id)
    }

    /// Run the registered rules against the current document
    pub fn validate_state(&self) -> ValidationReport {
        let document = self.get_state();
        self.validator().validate(&document)
    }

    /// Value at `path`
    pub fn get(&self, path: &str) -> Result<Value> {
        let path = Path::parse(path)?;
        self.read().document.locate(&path).cloned()
    }

    /// Deep copy of the whole document
    pub fn get_state(&self) -> Value {
        self.read().document.clone()
    }

    /// Current sequence number, 0 for a fresh store
    pub fn version(&self) -> u64 {
        self.read().sequence
    }

    /// Write `value` at `path` as one version.
    ///
    /// Uses `replace` when the path exists and `add` otherwise. Missing
    /// intermediate objects are created in the same version.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<u64> {
        let path = Path::parse(path)?;
        let value = value.into();
        self.commit_with(
            |inner| {
                let doc = &inner.document;
                let mut patch = Patch::new();
                if path.is_root() {
                    patch.push(PatchOperation::replace("/", value));
                    return Ok(patch);
                }
                for ancestor in path.ancestors().skip(1) {
                    if doc.pointer(&ancestor).is_none() {
                        patch.push(PatchOperation::add(ancestor.to_string(), Value::object()));
                    }
                }
                if doc.pointer(&path).is_some() {
                    patch.push(PatchOperation::replace(path.to_string(), value));
                } else {
                    patch.push(PatchOperation::add(path.to_string(), value));
                }
                Ok(patch)
            },
            0,
        )
        .map(|(sequence, _)| sequence)
    }

    /// Remove the value at `path` as one version
    pub fn delete(&self, path: &str) -> Result<u64> {
        self.apply_patch(Patch::from(vec![PatchOperation::remove(path)]))
    }

    /// Commit `patch` as a one-shot transaction
    pub fn apply_patch(&self, patch: Patch) -> Result<u64> {
        self.commit_patch(patch).map(|(sequence, _)| sequence)
    }

    /// Open a transaction against the current document
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self, self.get_state())
    }

    pub(crate) fn commit_patch(&self, patch: Patch) -> Result<(u64, Vec<StateChange>)> {
        self.commit_with(move |_| Ok(patch), 0)
    }

    /// The single write path. `build` sees the store state under the write
    /// lock. The result must pass the validator before it is committed. The
    /// new sequence is `max(current, floor) + 1`.
    fn commit_with<F>(&self, build: F, floor: u64) -> Result<(u64, Vec<StateChange>)>
    where
        F: FnOnce(&StoreInner) -> Result<Patch>,
    {
        let (sequence, changes) = {
            let mut inner = self.write();
            let patch = build(&inner)?;
            let (document, changes) = patch.apply_tracked(&inner.document)?;
            if !document.is_object() {
                return Err(SyncError::validation(format!(
                    "document root must be an object, not {}",
                    document.kind()
                )));
            }
            self.validator().check(&document)?;

            let sequence = inner.sequence.max(floor) + 1;
            inner.document = document;
            inner.sequence = sequence;
            inner.record(
                Version {
                    sequence,
                    patch,
                    timestamp: Utc::now(),
                    id: Uuid::new_v4(),
                },
                self.config.max_history,
            );
            (sequence, changes)
        };

        self.subscribers.notify(&changes);
        Ok((sequence, changes))
    }

    /// Subscribe to changes at `path`, its descendants, or `/prefix/*`
    pub fn subscribe<S>(&self, path: &str, subscriber: S) -> Result<SubscriptionHandle>
    where
        S: StateSubscriber + 'static,
    {
        let pattern = path.strip_suffix("/*").unwrap_or(path);
        Path::parse(pattern)?;
        let id = self.subscribers.insert(path, Arc::new(subscriber));
        Ok(SubscriptionHandle::new(id, &self.subscribers))
    }

    /// Remove a subscription by id; false if it was not registered
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.subscribers.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn create_snapshot(&self) -> Snapshot {
        let inner = self.read();
        Snapshot {
            id: Uuid::new_v4(),
            document: inner.document.clone(),
            sequence: inner.sequence,
            timestamp: Utc::now(),
        }
    }

    /// Replace the document with the snapshot's, recorded as a new version.
    ///
    /// Subscribers see one change at `/` carrying both whole documents,
    /// not one change per path that differs.
    pub fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<u64> {
        self.replace_document(snapshot.document.clone(), 0)
    }

    /// Reset to an empty object, recorded as a new version
    pub fn clear(&self) -> Result<u64> {
        self.replace_document(Value::object(), 0)
    }

    fn replace_document(&self, document: Value, floor: u64) -> Result<u64> {
        let patch = Patch::from(vec![PatchOperation::replace("/", document)]);
        self.commit_with(move |_| Ok(patch), floor)
            .map(|(sequence, _)| sequence)
    }

    /// Retained versions, oldest first
    pub fn get_history(&self) -> Vec<Version> {
        self.read().history.iter().cloned().collect()
    }

    /// Document immediately before the oldest retained version
    pub fn history_base(&self) -> Value {
        self.read().base.clone()
    }

    /// Rebuild the current document from the history base and retained
    /// versions
    pub fn replay_history(&self) -> Result<Value> {
        let inner = self.read();
        inner
            .history
            .iter()
            .try_fold(inner.base.clone(), |doc, version| version.patch.apply(&doc))
    }

    /// Timestamp of the newest retained version that touched `path`, one of
    /// its ancestors or one of its descendants
    pub fn last_modified(&self, path: &str) -> Result<Option<DateTime<Utc>>> {
        let path = Path::parse(path)?;
        let inner = self.read();
        for version in inner.history.iter().rev() {
            for op in version.patch.iter() {
                let touched = std::iter::once(op.path.as_str()).chain(op.from.as_deref());
                for raw in touched {
                    let Ok(other) = Path::parse(raw) else {
                        continue;
                    };
                    if path.starts_with(&other) || other.starts_with(&path) {
                        return Ok(Some(version.timestamp));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Serialize the document and sequence as pretty JSON
    pub fn export(&self) -> Result<Vec<u8>> {
        let inner = self.read();
        let data = ExportData {
            document: inner.document.clone(),
            version: inner.sequence,
        };
        Ok(serde_json::to_vec_pretty(&data)?)
    }

    /// Load an export.
    ///
    /// The document becomes a new version numbered past both the current
    /// and the exported sequence.
    pub fn import(&self, bytes: &[u8]) -> Result<u64> {
        let data: ExportData = serde_json::from_slice(bytes)?;
        if !data.document.is_object() {
            return Err(SyncError::validation(format!(
                "imported document must be an object, not {}",
                data.document.kind()
            )));
        }
        self.replace_document(data.document, data.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn doc(v: serde_json::Value) -> Value {
        Value::from(v)
    }

    #[test]
    fn test_set_on_empty_store() {
        let store = StateStore::default();
        store.set("/user/name", "Jane Smith").unwrap();

        assert_eq!(store.get("/user/name").unwrap(), Value::from("Jane Smith"));
        assert_eq!(store.version(), 1);
        assert_eq!(store.get_history().len(), 1);
    }

    #[test]
    fn test_set_existing_path_replaces() {
        let store = StateStore::default();
        store.set("/count", 1).unwrap();
        store.set("/count", 2).unwrap();

        let history = store.get_history();
        assert_eq!(history[0].patch.operations()[0].op, PatchOp::Add);
        assert_eq!(history[1].patch.operations()[0].op, PatchOp::Replace);
        assert_eq!(store.get("/count").unwrap(), Value::from(2));
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let store = StateStore::default();
        assert!(matches!(store.get("/nope"), Err(SyncError::NotFoundError(_))));
    }

    #[test]
    fn test_failed_commit_leaves_store_unchanged() {
        let store = StateStore::default();
        store.set("/a", 1).unwrap();
        let before = serde_json::to_vec(&store.get_state()).unwrap();

        let err = store
            .apply_patch(Patch::from(vec![
                PatchOperation::replace("/a", 2),
                PatchOperation::remove("/missing"),
            ]))
            .unwrap_err();

        assert!(matches!(err, SyncError::NotFoundError(_)));
        assert_eq!(serde_json::to_vec(&store.get_state()).unwrap(), before);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_root_must_stay_an_object() {
        let store = StateStore::default();
        let err = store.set("/", 5).unwrap_err();
        assert!(matches!(err, SyncError::ValidationError(_)));
        assert!(store.delete("/").is_err());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_history_is_bounded_and_replayable() {
        let store = StateStore::new(StoreConfig { max_history: 3 }).unwrap();
        for i in 0..7 {
            store.set(&format!("/k{}", i % 4), i).unwrap();
        }

        let history = store.get_history();
        assert_eq!(history.len(), 3);
        assert_eq!(
            history.iter().map(|v| v.sequence).collect::<Vec<_>>(),
            vec![5, 6, 7]
        );
        assert_eq!(store.replay_history().unwrap(), store.get_state());
    }

    #[test]
    fn test_snapshot_restore_is_a_new_version() {
        let store = StateStore::default();
        store.set("/theme", "dark").unwrap();
        let snapshot = store.create_snapshot();

        store.set("/theme", "light").unwrap();
        store.set("/extra", true).unwrap();

        let sequence = store.restore_snapshot(&snapshot).unwrap();
        assert_eq!(sequence, 4);
        assert_eq!(store.get_state(), snapshot.document);
        assert_eq!(store.replay_history().unwrap(), store.get_state());
    }

    #[test]
    fn test_export_import_round_trip() {
        let store = StateStore::default();
        store.set("/user/name", "Jane").unwrap();
        store.set("/user/tags", Value::Array(vec!["a".into()])).unwrap();
        let exported = store.export().unwrap();
        let expected = store.get_state();

        store.clear().unwrap();
        assert_eq!(store.get_state(), Value::object());

        let sequence = store.import(&exported).unwrap();
        assert_eq!(store.get_state(), expected);
        assert_eq!(sequence, 4);
    }

    #[test]
    fn test_import_rejects_non_object() {
        let store = StateStore::default();
        let err = store.import(br#"{"document": [1], "version": 3}"#).unwrap_err();
        assert!(matches!(err, SyncError::ValidationError(_)));
        assert!(matches!(
            store.import(b"not json"),
            Err(SyncError::SerializationError(_))
        ));
    }

    #[test]
    fn test_subscriber_isolation() {
        let store = StateStore::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        store
            .subscribe("/", |_: &StateChange| panic!("subscriber bug"))
            .unwrap();
        let counter = Arc::clone(&delivered);
        store
            .subscribe("/user", move |_: &StateChange| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        store.set("/user/name", "Jane").unwrap();
        store.set("/other", 1).unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn test_subscriber_may_reenter_store() {
        let store = Arc::new(StateStore::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&store);
        let sink = Arc::clone(&seen);
        let handle = store
            .subscribe("/a", move |change: &StateChange| {
                if let Some(store) = weak.upgrade() {
                    sink.lock().unwrap().push((change.path.clone(), store.version()));
                    store.subscribe("/b", |_: &StateChange| {}).unwrap();
                }
            })
            .unwrap();

        store.set("/a", 1).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[("/a".to_string(), 1)]);
        assert_eq!(store.subscriber_count(), 2);

        assert!(handle.unsubscribe());
        store.set("/a", 2).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_last_modified_tracks_related_paths() {
        let store = StateStore::default();
        store.set("/user/name", "Jane").unwrap();
        store.set("/other", 1).unwrap();

        let user = store.last_modified("/user").unwrap();
        let name = store.last_modified("/user/name").unwrap();
        assert!(user.is_some());
        assert_eq!(user, name);
        assert!(store.last_modified("/missing").unwrap().is_none());
    }

    #[test]
    fn test_rejected_commit_leaves_store_unchanged() {
        use super::validation::{MaxDepth, RequiredFields};

        let store = StateStore::default();
        store.set("/user/name", "Jane").unwrap();
        store
            .add_validation_rule(RequiredFields::new(["/user/name"]).unwrap())
            .unwrap();
        store.add_validation_rule(MaxDepth::new(3)).unwrap();
        let before = store.get_state();

        let err = store.delete("/user/name").unwrap_err();
        assert!(matches!(err, SyncError::ValidationError(ref msg) if msg.contains("REQUIRED_FIELD_MISSING")));
        assert!(store.set("/a/b/c/d", 1).is_err());
        assert!(store.clear().is_err());
        assert_eq!(store.get_state(), before);
        assert_eq!(store.version(), 1);
        assert!(store.validate_state().valid);

        store.set("/user/email", "jane@example.com").unwrap();
        assert_eq!(store.version(), 2);

        assert!(store.remove_validation_rule("required-fields"));
        store.delete("/user/name").unwrap();
        assert_eq!(store.version(), 3);
    }

    #[test]
    fn test_whole_document_writes_notify_root_only() {
        let store = StateStore::default();
        store.set("/user/name", "Jane").unwrap();
        let snapshot = store.create_snapshot();
        store.set("/user/name", "Ana").unwrap();

        let root = Arc::new(Mutex::new(Vec::new()));
        let narrow = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&root);
        store
            .subscribe("/", move |change: &StateChange| {
                sink.lock().unwrap().push(change.clone());
            })
            .unwrap();
        let counter = Arc::clone(&narrow);
        store
            .subscribe("/user/name", move |_: &StateChange| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        store.restore_snapshot(&snapshot).unwrap();
        store.clear().unwrap();

        let root = root.lock().unwrap();
        assert_eq!(root.len(), 2);
        assert!(root.iter().all(|c| c.path == "/" && c.operation == PatchOp::Replace));
        assert_eq!(root[0].old_value, Some(doc(json!({"user": {"name": "Ana"}}))));
        assert_eq!(root[0].new_value, Some(snapshot.document.clone()));
        assert_eq!(narrow.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_set_creates_parents_in_one_version() {
        let store = StateStore::default();
        store.set("/a/b/c", 1).unwrap();
        assert_eq!(store.version(), 1);
        assert_eq!(store.get_state(), doc(json!({"a": {"b": {"c": 1}}})));
        assert_eq!(store.get_history()[0].patch.len(), 3);
    }
}
