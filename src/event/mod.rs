//! Wire-level synchronization events
//!
//! A master sends a [`StateSnapshotEvent`] carrying the full document when a
//! replica joins or needs to resync, and a [`StateDeltaEvent`] carrying a
//! [`Patch`] for every change after that. Both travel inside the
//! [`StateEvent`] envelope, tagged by `type`.

pub mod codec;
mod generator;

pub use codec::{decode_event, encode_event};
pub use generator::EventGenerator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::patch::Patch;
use crate::value::Value;

/// Full document at a point in time.
///
/// `sequence_number` is the sequence of the first delta that applies on top
/// of this document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshotEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence_number: u64,
    pub document: Value,
}

impl StateSnapshotEvent {
    pub fn new(sequence_number: u64, document: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sequence_number,
            document,
        }
    }
}

/// Incremental change
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDeltaEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: u64,
    pub delta: Patch,
}

impl StateDeltaEvent {
    pub fn new(sequence_number: u64, delta: Patch) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sequence_number,
            delta,
        }
    }

    /// Restamp with a different sequence number
    pub fn with_sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = sequence_number;
        self
    }
}

/// Envelope for everything that crosses the transport
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateEvent {
    #[serde(rename = "STATE_SNAPSHOT")]
    Snapshot(StateSnapshotEvent),
    #[serde(rename = "STATE_DELTA")]
    Delta(StateDeltaEvent),
}

impl StateEvent {
    pub fn id(&self) -> Uuid {
        match self {
            StateEvent::Snapshot(e) => e.id,
            StateEvent::Delta(e) => e.id,
        }
    }

    pub fn sequence_number(&self) -> u64 {
        match self {
            StateEvent::Snapshot(e) => e.sequence_number,
            StateEvent::Delta(e) => e.sequence_number,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StateEvent::Snapshot(e) => e.timestamp,
            StateEvent::Delta(e) => e.timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            StateEvent::Snapshot(_) => "STATE_SNAPSHOT",
            StateEvent::Delta(_) => "STATE_DELTA",
        }
    }

    /// Snapshots must carry an object; deltas at least one well-formed
    /// operation
    pub fn validate(&self) -> Result<()> {
        match self {
            StateEvent::Snapshot(e) => {
                if !e.document.is_object() {
                    return Err(SyncError::validation(format!(
                        "snapshot document must be an object, not {}",
                        e.document.kind()
                    )));
                }
                Ok(())
            }
            StateEvent::Delta(e) => {
                if e.delta.is_empty() {
                    return Err(SyncError::validation(format!(
                        "delta {} carries no operations",
                        e.sequence_number
                    )));
                }
                e.delta.validate()
            }
        }
    }
}

impl From<StateSnapshotEvent> for StateEvent {
    fn from(e: StateSnapshotEvent) -> Self {
        StateEvent::Snapshot(e)
    }
}

impl From<StateDeltaEvent> for StateEvent {
    fn from(e: StateDeltaEvent) -> Self {
        StateEvent::Delta(e)
    }
}
