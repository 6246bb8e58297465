use crate::error::{Result, SyncError};
use crate::patch::Patch;
use crate::value::{Path, Value};

use super::{StateChange, StateStore};

/// An uncommitted batch of patches bound to one store
///
/// `apply` only touches a private working copy. `commit` re-applies the
/// accumulated patch to the live document as a single version; dropping the
/// transaction without committing discards it.
pub struct Transaction<'a> {
    store: &'a StateStore,
    working: Value,
    patch: Patch,
    poisoned: Option<SyncError>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(store: &'a StateStore, working: Value) -> Self {
        Self {
            store,
            working,
            patch: Patch::new(),
            poisoned: None,
        }
    }

    /// Append `patch` to the transaction.
    ///
    /// A patch that fails against the working copy poisons the transaction:
    /// every later `apply` and the eventual `commit` fail with the same error.
    pub fn apply(&mut self, patch: Patch) -> Result<()> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }
        match patch.apply(&self.working) {
            Ok(working) => {
                self.working = working;
                self.patch.extend(patch);
                Ok(())
            }
            Err(err) => {
                self.poisoned = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Read from the working copy
    pub fn get(&self, path: &str) -> Result<Value> {
        let path = Path::parse(path)?;
        self.working.locate(&path).cloned()
    }

    pub fn working_state(&self) -> &Value {
        &self.working
    }

    /// Operations accumulated so far
    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Apply everything to the store as one version
    pub fn commit(self) -> Result<u64> {
        self.commit_tracked().map(|(sequence, _)| sequence)
    }

    pub(crate) fn commit_tracked(self) -> Result<(u64, Vec<StateChange>)> {
        if let Some(err) = self.poisoned {
            return Err(err);
        }
        self.store.commit_patch(self.patch)
    }

    pub fn rollback(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchOperation;

    #[test]
    fn test_live_state_untouched_until_commit() {
        let store = StateStore::default();
        store.set("/a", 1).unwrap();

        let mut tx = store.begin();
        tx.apply(Patch::from(vec![PatchOperation::replace("/a", 2)]))
            .unwrap();
        tx.apply(Patch::from(vec![PatchOperation::add("/b", 3)]))
            .unwrap();
        assert_eq!(tx.get("/b").unwrap(), Value::from(3));
        assert_eq!(store.get("/a").unwrap(), Value::from(1));

        let sequence = tx.commit().unwrap();
        assert_eq!(sequence, 2);
        assert_eq!(store.get("/a").unwrap(), Value::from(2));
        assert_eq!(store.get_history().last().unwrap().patch.len(), 2);
    }

    #[test]
    fn test_rollback_discards() {
        let store = StateStore::default();
        let mut tx = store.begin();
        tx.apply(Patch::from(vec![PatchOperation::add("/a", 1)]))
            .unwrap();
        tx.rollback();

        assert_eq!(store.get_state(), Value::object());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_poisoned_transaction_cannot_commit() {
        let store = StateStore::default();
        let mut tx = store.begin();
        tx.apply(Patch::from(vec![PatchOperation::add("/a", 1)]))
            .unwrap();
        assert!(tx
            .apply(Patch::from(vec![PatchOperation::remove("/missing")]))
            .is_err());
        assert!(tx.is_poisoned());

        assert!(matches!(tx.commit(), Err(SyncError::NotFoundError(_))));
        assert_eq!(store.version(), 0);
        assert_eq!(store.get_state(), Value::object());
    }

    #[test]
    fn test_empty_commit_creates_version() {
        let store = StateStore::default();
        assert_eq!(store.begin().commit().unwrap(), 1);
        assert_eq!(store.get_history().len(), 1);
    }
}
