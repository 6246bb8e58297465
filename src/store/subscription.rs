//! Path-scoped change subscriptions.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use uuid::Uuid;

use super::StateChange;
use crate::error::Result;

/// Receives state changes from a store
///
/// Any `Fn(&StateChange) + Send + Sync` closure is a subscriber. Implement the
/// trait directly to report failures; errors are logged and never stop
/// delivery to other subscribers.
pub trait StateSubscriber: Send + Sync {
    fn on_change(&self, change: &StateChange) -> Result<()>;
}

impl<F> StateSubscriber for F
where
    F: Fn(&StateChange) + Send + Sync,
{
    fn on_change(&self, change: &StateChange) -> Result<()> {
        self(change);
        Ok(())
    }
}

#[derive(Clone)]
struct Subscription {
    id: Uuid,
    path: String,
    subscriber: Arc<dyn StateSubscriber>,
}

#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    entries: Mutex<Vec<Subscription>>,
}

impl SubscriberRegistry {
    pub(crate) fn insert(&self, path: &str, subscriber: Arc<dyn StateSubscriber>) -> Uuid {
        let id = Uuid::new_v4();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                path: path.to_string(),
                subscriber,
            });
        id
    }

    pub(crate) fn remove(&self, id: Uuid) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|s| s.id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `changes` to every matching subscriber.
    ///
    /// The subscriber list is copied before delivery, so callbacks may
    /// subscribe or unsubscribe without deadlocking.
    pub(crate) fn notify(&self, changes: &[StateChange]) {
        if changes.is_empty() {
            return;
        }
        let subscriptions: Vec<Subscription> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for change in changes {
            for sub in subscriptions.iter().filter(|s| path_matches(&s.path, &change.path)) {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| sub.subscriber.on_change(change)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        log::error!("Subscriber {} failed on {}: {}", sub.id, change.path, e);
                    }
                    Err(payload) => {
                        log::error!(
                            "Subscriber {} panicked on {}: {}",
                            sub.id,
                            change.path,
                            panic_message(payload.as_ref())
                        );
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle returned by [`StateStore::subscribe`](super::StateStore::subscribe).
///
/// Dropping the handle keeps the subscription alive; call
/// [`SubscriptionHandle::unsubscribe`] to end it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: Uuid,
    registry: Weak<SubscriberRegistry>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: Uuid, registry: &Arc<SubscriberRegistry>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remove the subscription; false if it was already gone
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.remove(self.id))
            .unwrap_or(false)
    }
}

/// Whether a change at `changed` is delivered to a subscription on `subscribed`.
///
/// The root (`"/"` or `""`) receives everything, a path receives itself and
/// its descendants, and `/prefix/*` receives strict descendants of `/prefix`.
pub fn path_matches(subscribed: &str, changed: &str) -> bool {
    if subscribed.is_empty() || subscribed == "/" || subscribed == changed {
        return true;
    }
    if let Some(prefix) = subscribed.strip_suffix("/*") {
        return changed
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'));
    }
    changed
        .strip_prefix(subscribed)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_matching() {
        assert!(path_matches("/", "/anything/at/all"));
        assert!(path_matches("", "/a"));
        assert!(path_matches("/user", "/user"));
        assert!(path_matches("/user", "/user/name"));
        assert!(!path_matches("/user", "/username"));
        assert!(!path_matches("/user/name", "/user"));
        assert!(path_matches("/users/*", "/users/42"));
        assert!(!path_matches("/users/*", "/users"));
    }
}
