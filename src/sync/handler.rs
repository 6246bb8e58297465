//! Per-replica ingestion pipeline.
//!
//! An [`EventHandler`] owns one worker task. Events enter through
//! [`EventHandler::submit`] (or [`EventHandler::receive_payload`] for raw
//! transport bytes), pass admission control, and are queued. The worker
//! reorders deltas by sequence number, accumulates them into batches and
//! applies each batch as a single store transaction, retrying failed commits
//! with exponential backoff. Snapshots skip reordering and batching.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::backpressure::{BackpressureController, BackpressureStats};
use super::conflict::{ConflictResolver, LastWriteWins};
use super::health::{ConnectionHealth, HealthReport, HealthStatus};
use super::reorder::{Released, ReorderBuffer};
use crate::config::HandlerConfig;
use crate::error::{Result, SyncError};
use crate::event::{codec, decode_event, StateDeltaEvent, StateEvent, StateSnapshotEvent};
use crate::patch::{Patch, PatchOp, PatchOperation};
use crate::store::{StateChange, StateStore};
use crate::value::{Path, Value};

/// Room in the queue beyond the backpressure capacity, for snapshots
const SNAPSHOT_HEADROOM: usize = 16;

pub type SnapshotCallback = Box<dyn Fn(&StateSnapshotEvent) + Send + Sync>;
pub type DeltaCallback = Box<dyn Fn(&StateDeltaEvent) + Send + Sync>;
pub type StateChangeCallback = Box<dyn Fn(&StateChange) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&SyncError) + Send + Sync>;

/// Hooks fired by the worker after successful applies, and on errors
#[derive(Default)]
pub struct HandlerCallbacks {
    on_snapshot: Option<SnapshotCallback>,
    on_delta: Option<DeltaCallback>,
    on_state_change: Option<StateChangeCallback>,
    on_error: Option<ErrorCallback>,
}

impl HandlerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_snapshot<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateSnapshotEvent) + Send + Sync + 'static,
    {
        self.on_snapshot = Some(Box::new(f));
        self
    }

    pub fn on_delta<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateDeltaEvent) + Send + Sync + 'static,
    {
        self.on_delta = Some(Box::new(f));
        self
    }

    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&SyncError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }
}

fn fire<T>(client_id: &str, hook: &str, callback: &Option<Box<dyn Fn(&T) + Send + Sync>>, arg: &T) {
    if let Some(callback) = callback {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(arg))).is_err() {
            log::error!("[{}] {} callback panicked", client_id, hook);
        }
    }
}

/// Where the worker currently is in the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum HandlerState {
    Idle,
    Receiving,
    Reordering,
    Batching,
    Applying,
    Retrying,
    Stopped,
}

/// Point-in-time copy of a handler's counters
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HandlerStats {
    pub events_received: u64,
    pub snapshots_applied: u64,
    pub deltas_applied: u64,
    pub batches_applied: u64,
    pub duplicates: u64,
    /// Deltas refused by backpressure or a full queue
    pub dropped: u64,
    pub gap_skips: u64,
    pub retries: u64,
    pub failed_batches: u64,
    pub conflicts_resolved: u64,
    pub codec_errors: u64,
    /// Snapshots older than deltas already applied
    pub stale_snapshots: u64,
    pub backpressure: BackpressureStats,
}

#[derive(Default)]
struct Counters {
    events_received: AtomicU64,
    snapshots_applied: AtomicU64,
    deltas_applied: AtomicU64,
    batches_applied: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    gap_skips: AtomicU64,
    retries: AtomicU64,
    failed_batches: AtomicU64,
    conflicts_resolved: AtomicU64,
    codec_errors: AtomicU64,
    stale_snapshots: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// State visible to both the handle and the worker task
struct Shared {
    backpressure: BackpressureController,
    health: Mutex<ConnectionHealth>,
    counters: Counters,
    state: Mutex<HandlerState>,
}

impl Shared {
    fn health(&self) -> MutexGuard<'_, ConnectionHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: HandlerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Applies snapshot and delta events from one master to one replica store
pub struct EventHandler {
    config: HandlerConfig,
    store: Arc<StateStore>,
    resolver: Arc<dyn ConflictResolver>,
    callbacks: Arc<HandlerCallbacks>,
    shared: Arc<Shared>,
    tx: mpsc::Sender<StateEvent>,
    rx: Mutex<Option<mpsc::Receiver<StateEvent>>>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EventHandler {
    pub fn new(store: Arc<StateStore>, config: HandlerConfig) -> Result<Self> {
        let mut config = config;
        config.normalize();
        config.validate()?;

        let backpressure = BackpressureController::new(config.backpressure.clone())?;
        let (tx, rx) = mpsc::channel(config.backpressure.capacity + SNAPSHOT_HEADROOM);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            store,
            resolver: Arc::new(LastWriteWins),
            callbacks: Arc::new(HandlerCallbacks::default()),
            shared: Arc::new(Shared {
                backpressure,
                health: Mutex::new(ConnectionHealth::new(config.health_window)),
                counters: Counters::default(),
                state: Mutex::new(HandlerState::Idle),
            }),
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown_tx,
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Replace the default last-write-wins resolver
    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_callbacks(mut self, callbacks: HandlerCallbacks) -> Self {
        self.callbacks = Arc::new(callbacks);
        self
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn resolver_name(&self) -> &'static str {
        self.resolver.name()
    }

    /// Spawn the worker task. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ClosedError(format!(
                "handler {} is stopped",
                self.config.client_id
            )));
        }
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                SyncError::validation(format!("handler {} already started", self.config.client_id))
            })?;

        let worker = Worker {
            client_id: self.config.client_id.clone(),
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            resolver: Arc::clone(&self.resolver),
            callbacks: Arc::clone(&self.callbacks),
            shared: Arc::clone(&self.shared),
            reorder: ReorderBuffer::new(self.config.out_of_order_buffer_size, self.config.gap_timeout),
            batch: Vec::new(),
            batch_deadline: None,
            shadow: self.store.get_state(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            stopping: false,
        };

        let handle = tokio::spawn(worker.run(rx));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        log::info!("[{}] Event handler started", self.config.client_id);
        Ok(())
    }

    /// Stop the worker. Queued events are processed and the pending batch
    /// is flushed once without retry; out-of-order leftovers are discarded.
    /// Calling this more than once is harmless.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("[{}] Worker task failed: {}", self.config.client_id, e);
            }
        }
        // Never started: release whatever was queued
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut rx) = rx {
            rx.close();
            let mut queued = 0;
            while let Ok(event) = rx.try_recv() {
                if matches!(event, StateEvent::Delta(_)) {
                    queued += 1;
                }
            }
            self.shared.backpressure.release(queued);
        }
        self.shared.set_state(HandlerState::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Queue an event without blocking.
    ///
    /// Deltas pass admission control first and fail with `CapacityError`
    /// while the handler is shedding load. Snapshots are always admitted.
    pub fn submit(&self, event: impl Into<StateEvent>) -> Result<()> {
        let event = event.into();
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ClosedError(format!(
                "handler {} is stopped",
                self.config.client_id
            )));
        }
        bump(&self.shared.counters.events_received, 1);

        let is_delta = matches!(event, StateEvent::Delta(_));
        if is_delta {
            if let Err(e) = self.shared.backpressure.try_admit() {
                bump(&self.shared.counters.dropped, 1);
                return Err(e);
            }
        }

        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                if is_delta {
                    self.shared.backpressure.cancel();
                    self.shared.backpressure.record_drop();
                    bump(&self.shared.counters.dropped, 1);
                }
                Err(SyncError::CapacityError(format!(
                    "queue full for {}",
                    self.config.client_id
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                if is_delta {
                    self.shared.backpressure.cancel();
                }
                Err(SyncError::ClosedError(format!(
                    "handler {} is stopped",
                    self.config.client_id
                )))
            }
        }
    }

    /// Decode a transport payload (plain or gzip JSON) and submit it
    pub fn receive_payload(&self, bytes: &[u8]) -> Result<()> {
        let event = decode_event(bytes).map_err(|e| {
            bump(&self.shared.counters.codec_errors, 1);
            log::warn!("[{}] Undecodable payload: {}", self.config.client_id, e);
            e
        })?;
        self.submit(event)
    }

    /// Encode an outgoing event with this handler's compression threshold
    /// and level
    pub fn encode_event(&self, event: &StateEvent) -> Result<Vec<u8>> {
        codec::encode_event(
            event,
            self.config.compression_threshold,
            self.config.compression_level,
        )
    }

    pub fn state(&self) -> HandlerState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn health(&self) -> HealthReport {
        self.shared.health().report()
    }

    pub fn health_status(&self) -> HealthStatus {
        self.shared.health().status()
    }

    pub fn backpressure_stats(&self) -> BackpressureStats {
        self.shared.backpressure.stats()
    }

    pub fn stats(&self) -> HandlerStats {
        let c = &self.shared.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        HandlerStats {
            events_received: load(&c.events_received),
            snapshots_applied: load(&c.snapshots_applied),
            deltas_applied: load(&c.deltas_applied),
            batches_applied: load(&c.batches_applied),
            duplicates: load(&c.duplicates),
            dropped: load(&c.dropped),
            gap_skips: load(&c.gap_skips),
            retries: load(&c.retries),
            failed_batches: load(&c.failed_batches),
            conflicts_resolved: load(&c.conflicts_resolved),
            codec_errors: load(&c.codec_errors),
            stale_snapshots: load(&c.stale_snapshots),
            backpressure: self.shared.backpressure.stats(),
        }
    }
}

impl Drop for EventHandler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// The task side of an [`EventHandler`]
struct Worker {
    client_id: String,
    config: HandlerConfig,
    store: Arc<StateStore>,
    resolver: Arc<dyn ConflictResolver>,
    callbacks: Arc<HandlerCallbacks>,
    shared: Arc<Shared>,
    reorder: ReorderBuffer<StateDeltaEvent>,
    batch: Vec<StateDeltaEvent>,
    batch_deadline: Option<Instant>,
    /// The document as the remote side last wrote it; a local value that
    /// differs from it is a concurrent local edit
    shadow: Value,
    shutdown_rx: broadcast::Receiver<()>,
    stopping: bool,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<StateEvent>) {
        while !self.stopping {
            let batch_deadline = self.batch_deadline;
            let gap_deadline = self.reorder.next_deadline();

            tokio::select! {
                received = rx.recv() => match received {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = wait_until(batch_deadline) => self.flush().await,
                _ = wait_until(gap_deadline) => {
                    let released = self.reorder.expire(Instant::now());
                    self.accept(released).await;
                }
                _ = self.shutdown_rx.recv() => {
                    self.stopping = true;
                }
            }

            if !self.stopping {
                self.shared.set_state(HandlerState::Idle);
            }
        }
        self.drain(rx).await;
    }

    async fn drain(mut self, mut rx: mpsc::Receiver<StateEvent>) {
        self.stopping = true;
        rx.close();
        while let Ok(event) = rx.try_recv() {
            self.handle(event).await;
        }
        self.flush().await;

        let leftover = self.reorder.reset(self.reorder.expected());
        if leftover > 0 {
            log::warn!(
                "[{}] Discarding {} out-of-order deltas on stop",
                self.client_id,
                leftover
            );
            self.shared.backpressure.release(leftover);
        }
        self.shared.set_state(HandlerState::Stopped);
        log::info!("[{}] Event handler stopped", self.client_id);
    }

    async fn handle(&mut self, event: StateEvent) {
        self.shared.set_state(HandlerState::Receiving);
        match event {
            StateEvent::Snapshot(snapshot) => self.apply_snapshot(snapshot).await,
            StateEvent::Delta(delta) => {
                self.shared.set_state(HandlerState::Reordering);
                let released = self.reorder.push(delta.sequence_number, delta, Instant::now());
                self.accept(released).await;
            }
        }
    }

    async fn accept(&mut self, released: Released<StateDeltaEvent>) {
        let counters = &self.shared.counters;
        if released.duplicate {
            bump(&counters.duplicates, 1);
            self.shared.backpressure.release(1);
            log::debug!("[{}] Ignoring duplicate delta", self.client_id);
        }
        for skip in released.skipped {
            bump(&counters.gap_skips, 1);
            log::warn!(
                "[{}] Gave up waiting for sequence {}, resuming at {}",
                self.client_id,
                skip.expected,
                skip.resumed_at
            );
            self.report(&skip.into());
        }

        for delta in released.items {
            self.shared.set_state(HandlerState::Batching);
            if self.batch.is_empty() {
                self.batch_deadline = Some(Instant::now() + self.config.batch_timeout);
            }
            self.batch.push(delta);
            if self.batch.len() >= self.config.batch_size {
                self.flush().await;
            }
        }
    }

    async fn apply_snapshot(&mut self, snapshot: StateSnapshotEvent) {
        let start = snapshot.sequence_number;
        let uncommitted = self
            .batch
            .first()
            .map_or(self.reorder.expected(), |delta| delta.sequence_number);
        if start < uncommitted {
            bump(&self.shared.counters.stale_snapshots, 1);
            log::warn!(
                "[{}] Ignoring snapshot at {}: deltas up to {} are already applied",
                self.client_id,
                start,
                uncommitted - 1
            );
            return;
        }

        // Deltas the snapshot already contains are dropped; later ones are
        // kept and applied on top of it
        let keep_from = self.batch.partition_point(|delta| delta.sequence_number < start);
        let kept = self.batch.split_off(keep_from);
        let superseded = std::mem::replace(&mut self.batch, kept).len();
        let (buffered, released) = self.reorder.advance_to(start);
        if self.batch.is_empty() {
            self.batch_deadline = None;
        }
        let discarded = superseded + buffered;
        if discarded > 0 {
            log::debug!(
                "[{}] Snapshot at {} superseded {} pending deltas",
                self.client_id,
                start,
                discarded
            );
            self.shared.backpressure.release(discarded);
        }

        self.shared.set_state(HandlerState::Applying);
        let patch = Patch::from(vec![PatchOperation::replace("/", snapshot.document.clone())]);
        let result = self
            .commit_with_retry(|worker| {
                let mut tx = worker.store.begin();
                tx.apply(patch.clone())?;
                let (_, changes) = tx.commit_tracked()?;
                Ok((changes, snapshot.document.clone()))
            })
            .await;

        match result {
            Ok((changes, shadow)) => {
                self.shadow = shadow;
                bump(&self.shared.counters.snapshots_applied, 1);
                self.shared.health().record_success();
                fire(&self.client_id, "snapshot", &self.callbacks.on_snapshot, &snapshot);
                for change in &changes {
                    fire(&self.client_id, "state change", &self.callbacks.on_state_change, change);
                }
            }
            Err(err) => self.fail(err),
        }

        self.accept(Released {
            items: released,
            ..Released::default()
        })
        .await;
    }

    async fn flush(&mut self) {
        self.batch_deadline = None;
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);

        self.shared.set_state(HandlerState::Applying);
        let result = self.commit_with_retry(|worker| worker.apply_batch(&batch)).await;
        self.shared.backpressure.release(batch.len());

        match result {
            Ok((changes, shadow)) => {
                self.shadow = shadow;
                let counters = &self.shared.counters;
                bump(&counters.batches_applied, 1);
                bump(&counters.deltas_applied, batch.len() as u64);
                self.shared.health().record_success();
                for delta in &batch {
                    fire(&self.client_id, "delta", &self.callbacks.on_delta, delta);
                }
                for change in &changes {
                    fire(&self.client_id, "state change", &self.callbacks.on_state_change, change);
                }
            }
            Err(err) => self.fail(err),
        }
    }

    /// Run `attempt` until it succeeds, retrying with backoff up to
    /// `max_retries` times. Errors that cannot clear on their own are
    /// returned after the first attempt.
    async fn commit_with_retry<F>(&mut self, attempt: F) -> Result<(Vec<StateChange>, Value)>
    where
        F: Fn(&Worker) -> Result<(Vec<StateChange>, Value)>,
    {
        let retry = self.config.retry.clone();
        let mut attempts = 0;
        loop {
            let err = match attempt(&*self) {
                Ok(applied) => return Ok(applied),
                Err(err) => err,
            };
            attempts += 1;
            if !err.is_retryable() {
                log::warn!("[{}] Commit failed ({}), not retrying", self.client_id, err);
                return Err(err);
            }
            if attempts > retry.max_retries || self.stopping {
                return Err(SyncError::RetryExhaustedError {
                    attempts,
                    source: Box::new(err),
                });
            }

            let delay = retry.delay_for(attempts - 1);
            bump(&self.shared.counters.retries, 1);
            log::warn!(
                "[{}] Commit failed ({}), retry {}/{} in {:?}",
                self.client_id,
                err,
                attempts,
                retry.max_retries,
                delay
            );
            self.shared.set_state(HandlerState::Retrying);
            self.backoff(delay).await;
        }
    }

    /// Sleep for `delay` unless shutdown arrives first
    async fn backoff(&mut self, delay: Duration) {
        if self.stopping {
            return;
        }
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = self.shutdown_rx.recv() => {
                self.stopping = true;
            }
        }
    }

    /// Apply a whole batch as one transaction
    fn apply_batch(&self, batch: &[StateDeltaEvent]) -> Result<(Vec<StateChange>, Value)> {
        let mut tx = self.store.begin();
        let mut shadow = self.shadow.clone();

        for delta in batch {
            for op in delta.delta.iter() {
                if let Some(resolved) = self.resolve(op, delta.timestamp, tx.working_state(), &shadow)? {
                    tx.apply(Patch::from(vec![resolved]))?;
                }
                match Patch::from(vec![op.clone()]).apply(&shadow) {
                    Ok(next) => shadow = next,
                    Err(e) => log::debug!("[{}] Shadow diverged at {}: {}", self.client_id, op.path, e),
                }
            }
        }

        let (_, changes) = tx.commit_tracked()?;
        Ok((changes, shadow))
    }

    /// Resolve a remote write against a concurrent local edit.
    /// `None` means the local value won and the operation is skipped.
    fn resolve(
        &self,
        op: &PatchOperation,
        remote_timestamp: DateTime<Utc>,
        working: &Value,
        shadow: &Value,
    ) -> Result<Option<PatchOperation>> {
        let remote = match (op.op, &op.value) {
            (PatchOp::Add | PatchOp::Replace, Some(value)) => value,
            _ => return Ok(Some(op.clone())),
        };
        let path = Path::parse(&op.path)?;

        // Adding into an array inserts rather than overwrites
        if op.op == PatchOp::Add {
            if let Some((parent, _)) = path.split_last() {
                if !matches!(working.pointer(&parent), Some(Value::Object(_))) {
                    return Ok(Some(op.clone()));
                }
            }
        }

        let Some(local) = working.pointer(&path) else {
            return Ok(Some(op.clone()));
        };
        if local == remote || shadow.pointer(&path) == Some(local) {
            return Ok(Some(op.clone()));
        }

        let local_timestamp = self
            .store
            .last_modified(&op.path)?
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let winner = self
            .resolver
            .resolve(&op.path, local, local_timestamp, remote, remote_timestamp)?;
        bump(&self.shared.counters.conflicts_resolved, 1);
        log::debug!(
            "[{}] Conflict at {} resolved by {}",
            self.client_id,
            op.path,
            self.resolver.name()
        );

        if &winner == local {
            return Ok(None);
        }
        Ok(Some(PatchOperation {
            value: Some(winner),
            ..op.clone()
        }))
    }

    fn fail(&self, err: SyncError) {
        bump(&self.shared.counters.failed_batches, 1);
        {
            let mut health = self.shared.health();
            health.record_failure(&err);
            health.mark_degraded();
        }
        self.report(&err);
    }

    fn report(&self, err: &SyncError) {
        log::error!("[{}] {}", self.client_id, err);
        fire(&self.client_id, "error", &self.callbacks.on_error, err);
    }
}
