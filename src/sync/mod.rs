//! Replica-side synchronization: reordering, admission control, conflict
//! resolution, the per-replica event handler and the master fan-out.

pub mod backpressure;
pub mod conflict;
pub mod handler;
pub mod health;
pub mod manager;
pub mod reorder;

pub use backpressure::{BackpressureController, BackpressureStats};
pub use conflict::{ConflictResolver, FirstWriteWins, LastWriteWins, MergeObjects};
pub use handler::{EventHandler, HandlerCallbacks, HandlerState, HandlerStats};
pub use health::{ConnectionHealth, HealthReport, HealthStatus};
pub use manager::{ClientStatus, SyncManager};
pub use reorder::{GapSkip, ReorderBuffer};
