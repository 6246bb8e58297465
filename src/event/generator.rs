use std::sync::Arc;

use crate::patch::diff;
use crate::store::StateStore;
use crate::value::Value;

use super::{StateDeltaEvent, StateSnapshotEvent};

/// Builds wire events from a store without ever writing to it
///
/// Events are stamped with the store version at generation time. Senders
/// that number their own stream restamp with
/// [`StateDeltaEvent::with_sequence`].
#[derive(Clone)]
pub struct EventGenerator {
    store: Arc<StateStore>,
}

impl EventGenerator {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Capture the current document
    pub fn generate_snapshot(&self) -> StateSnapshotEvent {
        let snapshot = self.store.create_snapshot();
        let mut event = StateSnapshotEvent::new(snapshot.sequence, snapshot.document);
        event.timestamp = snapshot.timestamp;
        event
    }

    /// Diff two documents into a delta event, which may carry an empty patch
    pub fn generate_delta(&self, old: &Value, new: &Value) -> StateDeltaEvent {
        StateDeltaEvent::new(self.store.version(), diff(old, new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchOperation;

    #[test]
    fn test_snapshot_captures_state_and_version() {
        let store = Arc::new(StateStore::default());
        store.set("/a", 1).unwrap();
        store.set("/b", 2).unwrap();

        let event = EventGenerator::new(Arc::clone(&store)).generate_snapshot();
        assert_eq!(event.sequence_number, 2);
        assert_eq!(event.document, store.get_state());
    }

    #[test]
    fn test_delta_does_not_touch_store() {
        let store = Arc::new(StateStore::default());
        let generator = EventGenerator::new(Arc::clone(&store));
        let old = store.get_state();
        let mut new = old.clone();
        if let Value::Object(map) = &mut new {
            map.insert("x".into(), Value::from(true));
        }

        let event = generator.generate_delta(&old, &new);
        assert_eq!(event.delta.operations(), &[PatchOperation::add("/x", true)]);
        assert_eq!(store.version(), 0);
        assert_eq!(store.get_state(), Value::object());
    }
}
