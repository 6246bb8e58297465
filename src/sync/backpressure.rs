//! Watermark admission control with hysteresis.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::config::BackpressureConfig;
use crate::error::{Result, SyncError};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BackpressureStats {
    pub occupancy: usize,
    pub capacity: usize,
    pub shedding: bool,
    /// Highest occupancy seen, as a fraction of capacity
    pub peak_utilization: f64,
    /// Number of times shedding started
    pub backpressure_count: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct State {
    occupancy: usize,
    shedding: bool,
    peak: usize,
    backpressure_count: u64,
    dropped: u64,
}

/// Tracks queue occupancy and decides when to shed load.
///
/// Shedding starts once occupancy reaches `capacity * high_watermark` and
/// stops only when it falls to `capacity * low_watermark`.
pub struct BackpressureController {
    config: BackpressureConfig,
    state: Mutex<State>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(State::default()),
        })
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn high_mark(&self) -> f64 {
        self.config.capacity as f64 * self.config.high_watermark
    }

    fn low_mark(&self) -> f64 {
        self.config.capacity as f64 * self.config.low_watermark
    }

    pub fn should_drop(&self) -> bool {
        self.state().shedding
    }

    /// Admit one event, or count it as dropped while shedding
    pub fn try_admit(&self) -> Result<()> {
        let mut state = self.state();
        if state.shedding {
            state.dropped += 1;
            return Err(SyncError::CapacityError(format!(
                "shedding load at occupancy {}/{}",
                state.occupancy, self.config.capacity
            )));
        }
        let occupancy = state.occupancy + 1;
        self.update(&mut state, occupancy);
        Ok(())
    }

    /// Undo an admission whose event never reached the queue
    pub fn cancel(&self) {
        self.release(1);
    }

    /// Mark `n` admitted events as fully processed
    pub fn release(&self, n: usize) {
        let mut state = self.state();
        let occupancy = state.occupancy.saturating_sub(n);
        self.update(&mut state, occupancy);
    }

    /// Overwrite the occupancy, e.g. from an external queue length
    pub fn set_occupancy(&self, occupancy: usize) {
        let mut state = self.state();
        self.update(&mut state, occupancy);
    }

    /// Count an event dropped outside of `try_admit`
    pub fn record_drop(&self) {
        self.state().dropped += 1;
    }

    fn update(&self, state: &mut State, occupancy: usize) {
        state.occupancy = occupancy;
        state.peak = state.peak.max(occupancy);

        let level = occupancy as f64;
        if !state.shedding && level >= self.high_mark() {
            state.shedding = true;
            state.backpressure_count += 1;
            log::warn!(
                "Backpressure engaged at occupancy {}/{}",
                occupancy,
                self.config.capacity
            );
        } else if state.shedding && level <= self.low_mark() {
            state.shedding = false;
            log::info!(
                "Backpressure released at occupancy {}/{}",
                occupancy,
                self.config.capacity
            );
        }
    }

    pub fn stats(&self) -> BackpressureStats {
        let state = self.state();
        BackpressureStats {
            occupancy: state.occupancy,
            capacity: self.config.capacity,
            shedding: state.shedding,
            peak_utilization: state.peak as f64 / self.config.capacity as f64,
            backpressure_count: state.backpressure_count,
            dropped: state.dropped,
        }
    }
}
