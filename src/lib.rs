// Statesync - Differential State Synchronization Engine
//
// A versioned JSON-like document store with transactional patches and a
// diff/patch codec, plus the replica-side pipeline that keeps remote copies
// of a master store eventually consistent over an unreliable transport.

pub mod config;
pub mod error;
pub mod event;
pub mod patch;
pub mod store;
pub mod sync;
pub mod value;

pub use config::{BackpressureConfig, HandlerConfig, ManagerConfig, RetryConfig, StoreConfig};
pub use error::{Result, SyncError};
pub use event::{EventGenerator, StateDeltaEvent, StateEvent, StateSnapshotEvent};
pub use patch::{diff, Patch, PatchOp, PatchOperation};
pub use store::validation::{FnRule, MaxDepth, RequiredFields, ValidationIssue};
pub use store::{
    Marker, RollbackKind, RollbackRecord, Snapshot, StateChange, StateStore, StateSubscriber,
    StateValidator, SubscriptionHandle, Transaction, ValidationReport, ValidationRule, Version,
};
pub use sync::{EventHandler, HandlerCallbacks, SyncManager};
pub use value::{Map, Path, Value};
