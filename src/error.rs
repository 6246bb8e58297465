//! Error types shared by the store, the patch engine and the sync pipeline.

use thiserror::Error;

/// Error types for state synchronization
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Malformed patch, path or configuration
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Path, snapshot or client is absent
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// A concurrent write could not be resolved
    #[error("Conflict at {path}: {reason}")]
    ConflictError { path: String, reason: String },

    /// Event rejected by backpressure or a full queue
    #[error("Capacity exceeded: {0}")]
    CapacityError(String),

    /// The reorder buffer gave up waiting for a missing sequence
    #[error("Sequence gap: expected {expected}, resumed at {resumed_at}")]
    GapTimeoutError { expected: u64, resumed_at: u64 },

    /// Compression or decompression failure
    #[error("Codec error: {0}")]
    CodecError(String),

    /// A batch kept failing after every retry
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetryExhaustedError {
        attempts: u32,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The handler or manager has been shut down
    #[error("Closed: {0}")]
    ClosedError(String),
}

impl SyncError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        SyncError::ValidationError(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        SyncError::NotFoundError(msg.into())
    }

    /// Whether repeating the failed operation could succeed.
    ///
    /// Malformed input and missing paths fail the same way every time.
    /// Conflicts and capacity limits depend on state that moves on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConflictError { .. }
                | SyncError::CapacityError(_)
                | SyncError::GapTimeoutError { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        let conflict = SyncError::ConflictError {
            path: "/a".into(),
            reason: "stale".into(),
        };
        assert!(conflict.is_retryable());
        assert!(SyncError::CapacityError("full".into()).is_retryable());
        assert!(!SyncError::validation("bad path").is_retryable());
        assert!(!SyncError::not_found("/missing").is_retryable());

        let exhausted = SyncError::RetryExhaustedError {
            attempts: 3,
            source: Box::new(conflict),
        };
        assert!(!exhausted.is_retryable());
    }
}
