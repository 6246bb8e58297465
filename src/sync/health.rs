//! Connection health derived from recent batch outcomes.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Consecutive failures that make a connection unhealthy on their own
pub const UNHEALTHY_AFTER_CONSECUTIVE: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub success_ratio: f64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Rolling window of batch outcomes
pub struct ConnectionHealth {
    window: usize,
    outcomes: VecDeque<bool>,
    consecutive_failures: u32,
    degraded: bool,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl ConnectionHealth {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            outcomes: VecDeque::with_capacity(window),
            consecutive_failures: 0,
            degraded: false,
            last_success: None,
            last_failure: None,
            last_error: None,
        }
    }

    fn push(&mut self, ok: bool) {
        if self.outcomes.len() == self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
    }

    pub fn record_success(&mut self) {
        self.push(true);
        self.consecutive_failures = 0;
        self.degraded = false;
        self.last_success = Some(Utc::now());
    }

    pub fn record_failure(&mut self, error: impl ToString) {
        self.push(false);
        self.consecutive_failures += 1;
        self.last_failure = Some(Utc::now());
        self.last_error = Some(error.to_string());
    }

    /// Hold the status at `Degraded` or worse until the next success
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    fn failure_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failed = self.outcomes.iter().filter(|ok| !**ok).count();
        failed as f64 / self.outcomes.len() as f64
    }

    pub fn success_ratio(&self) -> f64 {
        1.0 - self.failure_ratio()
    }

    pub fn status(&self) -> HealthStatus {
        let failure_ratio = self.failure_ratio();
        if failure_ratio >= 0.5 || self.consecutive_failures >= UNHEALTHY_AFTER_CONSECUTIVE {
            HealthStatus::Unhealthy
        } else if self.degraded || failure_ratio >= 0.1 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.status(),
            success_ratio: self.success_ratio(),
            consecutive_failures: self.consecutive_failures,
            last_success: self.last_success,
            last_failure: self.last_failure,
            last_error: self.last_error.clone(),
        }
    }
}
