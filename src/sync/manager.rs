//! Fan-out of one master store to many replica handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use super::handler::{EventHandler, HandlerStats};
use super::health::HealthReport;
use crate::config::ManagerConfig;
use crate::error::{Result, SyncError};
use crate::event::{EventGenerator, StateEvent, StateSnapshotEvent};
use crate::store::{StateChange, StateStore, SubscriptionHandle};
use crate::value::Value;

/// Bookkeeping for one registered replica
#[derive(Clone, Debug, Serialize)]
pub struct ClientStatus {
    pub client_id: String,
    /// Sequence of the last event the client accepted
    pub last_sequence: Option<u64>,
    pub dispatched: u64,
    pub dropped: u64,
    pub needs_resync: bool,
    pub registered_at: DateTime<Utc>,
    pub health: HealthReport,
    pub stats: HandlerStats,
}

struct Client {
    handler: Arc<EventHandler>,
    last_sequence: Option<u64>,
    dispatched: u64,
    dropped: u64,
    needs_resync: bool,
    registered_at: DateTime<Utc>,
}

struct DispatchState {
    clients: IndexMap<String, Client>,
    /// Master document as of the last dispatched delta
    last_document: Value,
    next_sequence: u64,
}

/// The part of the manager reachable from the master's subscription
struct Dispatcher {
    generator: EventGenerator,
    config: ManagerConfig,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Diff the master against what was last sent and push the delta to
    /// every client. Changes already covered by an earlier diff are skipped.
    fn on_master_change(&self) {
        let mut state = self.lock();
        let current = self.generator.store().get_state();
        let delta = self.generator.generate_delta(&state.last_document, &current);
        if delta.delta.is_empty() {
            return;
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.last_document = current;
        let delta = delta.with_sequence(sequence);
        let resync_after_drop = self.config.resync_after_drop;

        let DispatchState {
            clients,
            last_document,
            ..
        } = &mut *state;
        for (client_id, client) in clients.iter_mut() {
            if client.needs_resync {
                let snapshot = StateSnapshotEvent::new(sequence + 1, last_document.clone());
                send(client_id, client, snapshot.into(), Some(sequence));
                continue;
            }

            match client.handler.submit(delta.clone()) {
                Ok(()) => {
                    client.dispatched += 1;
                    client.last_sequence = Some(sequence);
                }
                Err(SyncError::CapacityError(reason)) => {
                    client.dropped += 1;
                    client.needs_resync = resync_after_drop;
                    log::warn!(
                        "Client {} shed delta {}: {}",
                        client_id,
                        sequence,
                        reason
                    );
                }
                Err(e) => log::warn!("Client {} rejected delta {}: {}", client_id, sequence, e),
            }
        }
    }
}

/// Submit a snapshot that covers every delta up to `covers`, clearing
/// `needs_resync` on success
fn send(client_id: &str, client: &mut Client, event: StateEvent, covers: Option<u64>) {
    match client.handler.submit(event) {
        Ok(()) => {
            client.dispatched += 1;
            client.needs_resync = false;
            client.last_sequence = covers;
            log::info!("Sent snapshot to client {} covering {:?}", client_id, covers);
        }
        Err(e) => {
            client.needs_resync = true;
            log::warn!("Snapshot to client {} failed: {}", client_id, e);
        }
    }
}

/// Keeps any number of replicas in step with one master store
///
/// Each client has its own [`EventHandler`], queue and backpressure, so a
/// slow replica only sheds its own load.
pub struct SyncManager {
    master: Arc<StateStore>,
    dispatcher: Arc<Dispatcher>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    closed: AtomicBool,
}

impl SyncManager {
    pub fn new(master: Arc<StateStore>, config: ManagerConfig) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher {
            generator: EventGenerator::new(Arc::clone(&master)),
            config,
            state: Mutex::new(DispatchState {
                clients: IndexMap::new(),
                last_document: master.get_state(),
                next_sequence: 0,
            }),
        });

        let weak: Weak<Dispatcher> = Arc::downgrade(&dispatcher);
        let subscription = master.subscribe("/", move |_: &StateChange| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.on_master_change();
            }
        })?;

        Ok(Self {
            master,
            dispatcher,
            subscription: Mutex::new(Some(subscription)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn master(&self) -> &Arc<StateStore> {
        &self.master
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ClosedError("sync manager is shut down".into()));
        }
        Ok(())
    }

    /// Add a replica. With `snapshot_on_register` the client first receives
    /// the current document, numbered so the next delta follows on.
    pub fn register(&self, handler: Arc<EventHandler>) -> Result<()> {
        self.ensure_open()?;
        let client_id = handler.client_id().to_string();

        let mut state = self.dispatcher.lock();
        if state.clients.contains_key(&client_id) {
            return Err(SyncError::validation(format!(
                "client {} is already registered",
                client_id
            )));
        }

        let mut client = Client {
            handler,
            last_sequence: None,
            dispatched: 0,
            dropped: 0,
            needs_resync: false,
            registered_at: Utc::now(),
        };
        if self.dispatcher.config.snapshot_on_register {
            let snapshot =
                StateSnapshotEvent::new(state.next_sequence, state.last_document.clone());
            let covers = state.next_sequence.checked_sub(1);
            send(&client_id, &mut client, snapshot.into(), covers);
        }

        log::info!("Registered client {}", client_id);
        state.clients.insert(client_id, client);
        Ok(())
    }

    /// Remove a replica and hand its handler back; the handler keeps running
    pub fn unregister(&self, client_id: &str) -> Result<Arc<EventHandler>> {
        let mut state = self.dispatcher.lock();
        let client = state
            .clients
            .shift_remove(client_id)
            .ok_or_else(|| SyncError::not_found(format!("client {}", client_id)))?;
        log::info!("Unregistered client {}", client_id);
        Ok(client.handler)
    }

    /// Send the client a fresh snapshot right away
    pub fn resync(&self, client_id: &str) -> Result<()> {
        self.ensure_open()?;
        let mut guard = self.dispatcher.lock();
        let state = &mut *guard;
        let client = state
            .clients
            .get_mut(client_id)
            .ok_or_else(|| SyncError::not_found(format!("client {}", client_id)))?;

        let snapshot = StateSnapshotEvent::new(state.next_sequence, state.last_document.clone());
        let covers = state.next_sequence.checked_sub(1);
        send(client_id, client, snapshot.into(), covers);
        if client.needs_resync {
            return Err(SyncError::CapacityError(format!(
                "snapshot to client {} was not accepted",
                client_id
            )));
        }
        Ok(())
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.dispatcher.lock().clients.keys().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.dispatcher.lock().clients.len()
    }

    pub fn client_status(&self, client_id: &str) -> Result<ClientStatus> {
        let state = self.dispatcher.lock();
        let client = state
            .clients
            .get(client_id)
            .ok_or_else(|| SyncError::not_found(format!("client {}", client_id)))?;
        Ok(ClientStatus {
            client_id: client_id.to_string(),
            last_sequence: client.last_sequence,
            dispatched: client.dispatched,
            dropped: client.dropped,
            needs_resync: client.needs_resync,
            registered_at: client.registered_at,
            health: client.handler.health(),
            stats: client.handler.stats(),
        })
    }

    /// Sequence number the next delta will carry
    pub fn next_sequence(&self) -> u64 {
        self.dispatcher.lock().next_sequence
    }

    /// Detach from the master and stop every registered handler.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }

        let handlers: Vec<Arc<EventHandler>> = self
            .dispatcher
            .lock()
            .clients
            .drain(..)
            .map(|(_, client)| client.handler)
            .collect();
        for handler in handlers {
            handler.stop().await;
        }
        log::info!("Sync manager shut down");
    }
}
