//! Configuration for the store and the sync pipeline.
//!
//! Every struct deserializes with defaults for missing fields, so a config
//! document only needs to name what it overrides. Durations are written as
//! integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Configuration for a [`StateStore`](crate::store::StateStore)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of versions retained in history
    pub max_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { max_history: 100 }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_history == 0 {
            return Err(SyncError::validation("max_history must be at least 1"));
        }
        Ok(())
    }
}

/// Watermarks for ingestion-queue admission control
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub capacity: usize,
    pub high_watermark: f64,
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            high_watermark: 0.8,
            low_watermark: 0.2,
        }
    }
}

impl BackpressureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(SyncError::validation("backpressure capacity must be at least 1"));
        }
        let in_range = |w: f64| w > 0.0 && w < 1.0;
        if !in_range(self.high_watermark) || !in_range(self.low_watermark) {
            return Err(SyncError::validation("watermarks must lie strictly between 0 and 1"));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(SyncError::validation(
                "low watermark must be below the high watermark",
            ));
        }
        Ok(())
    }
}

/// Exponential backoff for failed batch commits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based):
    /// `initial_delay * backoff_multiplier^attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let nanos = (self.initial_delay.as_nanos() as f64 * factor).round();
        Duration::from_nanos(nanos.min(u64::MAX as f64) as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(SyncError::validation("backoff multiplier must be >= 1"));
        }
        Ok(())
    }
}

/// Configuration for one replica's [`EventHandler`](crate::sync::EventHandler)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    pub client_id: String,
    /// Deltas per applied batch
    pub batch_size: usize,
    #[serde(with = "duration_ms")]
    pub batch_timeout: Duration,
    /// Payloads larger than this many bytes travel gzip-compressed
    pub compression_threshold: usize,
    /// gzip level, 1..=9
    pub compression_level: u32,
    pub out_of_order_buffer_size: usize,
    /// How long a sequence gap may stall the reorder buffer
    #[serde(with = "duration_ms")]
    pub gap_timeout: Duration,
    /// Number of recent batches considered for connection health
    pub health_window: usize,
    pub retry: RetryConfig,
    pub backpressure: BackpressureConfig,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            client_id: format!("client-{}", Uuid::new_v4()),
            batch_size: 100,
            batch_timeout: Duration::from_millis(100),
            compression_threshold: 1024,
            compression_level: 6,
            out_of_order_buffer_size: 1000,
            gap_timeout: Duration::from_secs(5),
            health_window: 20,
            retry: RetryConfig::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl HandlerConfig {
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Load from a JSON config document
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: HandlerConfig = serde_json::from_str(raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Clamp out-of-range compression levels to the balanced default
    pub fn normalize(&mut self) {
        if !(1..=9).contains(&self.compression_level) {
            self.compression_level = 6;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(SyncError::validation("client_id must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(SyncError::validation("batch_size must be at least 1"));
        }
        if self.batch_timeout.is_zero() {
            return Err(SyncError::validation("batch_timeout must be non-zero"));
        }
        if self.out_of_order_buffer_size == 0 {
            return Err(SyncError::validation(
                "out_of_order_buffer_size must be at least 1",
            ));
        }
        if self.health_window == 0 {
            return Err(SyncError::validation("health_window must be at least 1"));
        }
        self.retry.validate()?;
        self.backpressure.validate()
    }
}

/// Configuration for the [`SyncManager`](crate::sync::SyncManager)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Send the current document to a client when it registers
    pub snapshot_on_register: bool,
    /// Send a fresh snapshot to a client after it shed a delta
    pub resync_after_drop: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            snapshot_on_register: true,
            resync_after_drop: true,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        StoreConfig::default().validate().unwrap();
        HandlerConfig::default().validate().unwrap();
        assert!(HandlerConfig::default().client_id.starts_with("client-"));
    }

    #[test]
    fn test_from_json_overrides_and_clamps() {
        let config = HandlerConfig::from_json(
            r#"{"client_id": "ui-1", "batch_timeout": 250, "compression_level": 42,
                "backpressure": {"capacity": 50}}"#,
        )
        .unwrap();

        assert_eq!(config.client_id, "ui-1");
        assert_eq!(config.batch_timeout, Duration::from_millis(250));
        assert_eq!(config.compression_level, 6);
        assert_eq!(config.backpressure.capacity, 50);
        assert_eq!(config.backpressure.high_watermark, 0.8);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_watermark_validation() {
        let inverted = BackpressureConfig {
            capacity: 10,
            high_watermark: 0.2,
            low_watermark: 0.8,
        };
        assert!(inverted.validate().is_err());

        let out_of_range = BackpressureConfig {
            capacity: 10,
            high_watermark: 1.0,
            low_watermark: 0.5,
        };
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn test_backoff_schedule() {
        let retry = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
    }
}
