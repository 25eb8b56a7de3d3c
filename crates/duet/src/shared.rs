//! Shared device state
//!
//! One `SharedState` exists per physical radio and is reached by both buddies
//! through their `Arc<PhysicalDevice>`. The lock guards pure in-memory
//! read-modify-write only; callers make hardware calls before or after, never
//! while holding it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::settings::{ChannelSelector, ConfigurationSnapshot, Direction};

/// Device-wide fields: changing any of these perturbs both buddies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub dev_sample_rate: f64,
    pub log2_hard_decim: u32,
    pub ext_clock: bool,
    pub ext_clock_freq: u32,
}

impl GlobalSettings {
    pub fn from_snapshot(snapshot: &ConfigurationSnapshot) -> Self {
        Self {
            dev_sample_rate: snapshot.dev_sample_rate,
            log2_hard_decim: snapshot.log2_hard_decim,
            ext_clock: snapshot.ext_clock,
            ext_clock_freq: snapshot.ext_clock_freq,
        }
    }

    pub fn same_rate(&self, other: &Self) -> bool {
        self.dev_sample_rate == other.dev_sample_rate
            && self.log2_hard_decim == other.log2_hard_decim
    }

    pub fn same_clock(&self, other: &Self) -> bool {
        self.ext_clock == other.ext_clock && self.ext_clock_freq == other.ext_clock_freq
    }
}

/// Per-direction view of the shared state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionState {
    pub log2_soft_decim: u32,
    pub nco_frequency: i64,
    pub center_frequency: u64,
    /// Host-side rate after hard and soft decimation
    pub rate: f64,
    /// Set while this direction's thread is suspended by an apply
    pub thread_was_running: bool,
}

/// Negotiated state of one physical radio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedDeviceState {
    pub channels: ChannelSelector,
    pub globals: GlobalSettings,
    pub master_rate: f64,
    pub rx: DirectionState,
    pub tx: DirectionState,
}

impl SharedDeviceState {
    pub fn direction(&self, direction: Direction) -> &DirectionState {
        match direction {
            Direction::Rx => &self.rx,
            Direction::Tx => &self.tx,
        }
    }

    fn direction_mut(&mut self, direction: Direction) -> &mut DirectionState {
        match direction {
            Direction::Rx => &mut self.rx,
            Direction::Tx => &mut self.tx,
        }
    }

    /// Rate of samples coming out of the device (RX side).
    pub fn output_rate(&self) -> f64 {
        self.rx.rate
    }

    /// Rate of samples going into the device (TX side).
    pub fn input_rate(&self) -> f64 {
        self.tx.rate
    }

    /// `master / 2^hard / 2^soft` for one direction.
    pub fn derived_rate(&self, direction: Direction) -> f64 {
        let soft = self.direction(direction).log2_soft_decim;
        self.master_rate
            / f64::from(1u32 << self.globals.log2_hard_decim)
            / f64::from(1u32 << soft)
    }

    fn recompute_rates(&mut self) {
        for direction in Direction::ALL {
            let rate = self.derived_rate(direction);
            self.direction_mut(direction).rate = rate;
        }
    }

    /// `master == rate * 2^hard * 2^soft` for both directions.
    pub fn rates_consistent(&self) -> bool {
        Direction::ALL.iter().all(|&d| {
            let dir = self.direction(d);
            let rebuilt = dir.rate
                * f64::from(1u32 << self.globals.log2_hard_decim)
                * f64::from(1u32 << dir.log2_soft_decim);
            (rebuilt - self.master_rate).abs() <= self.master_rate.abs() * 1e-12
        })
    }
}

/// Lock wrapper around `SharedDeviceState`.
#[derive(Debug, Default)]
pub struct SharedState {
    inner: Mutex<SharedDeviceState>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SharedDeviceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consistent copy of the whole state.
    pub fn read(&self) -> SharedDeviceState {
        self.lock().clone()
    }

    /// Replace the global fields, set the master rate the hardware actually
    /// took, and recompute both directions' rates.
    ///
    /// Returns whether any global field differed from the prior value.
    pub fn compare_and_update_global(&self, globals: GlobalSettings, master_rate: f64) -> bool {
        let mut state = self.lock();
        let changed = state.globals != globals || state.master_rate != master_rate;
        state.globals = globals;
        state.master_rate = master_rate;
        state.recompute_rates();
        debug!(
            "globals committed: {:?}, master {} (changed: {})",
            globals, master_rate, changed
        );
        changed
    }

    /// Set one direction's soft decimation and recompute its rate.
    pub fn set_soft_decim(&self, direction: Direction, log2_soft_decim: u32) {
        let mut state = self.lock();
        state.direction_mut(direction).log2_soft_decim = log2_soft_decim;
        state.recompute_rates();
    }

    pub fn set_center_frequency(&self, direction: Direction, frequency: u64) {
        self.lock().direction_mut(direction).center_frequency = frequency;
    }

    pub fn set_nco_frequency(&self, direction: Direction, offset: i64) {
        self.lock().direction_mut(direction).nco_frequency = offset;
    }

    pub fn set_channels(&self, channels: ChannelSelector) {
        self.lock().channels = channels;
    }

    pub fn rate(&self, direction: Direction) -> f64 {
        self.lock().direction(direction).rate
    }

    /// Record that `direction`'s thread was stopped by an apply.
    pub fn mark_suspended(&self, direction: Direction) {
        self.lock().direction_mut(direction).thread_was_running = true;
    }

    /// Clear the suspended flag, returning its previous value.
    pub fn take_suspended(&self, direction: Direction) -> bool {
        std::mem::take(&mut self.lock().direction_mut(direction).thread_was_running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globals(rate: f64, hard: u32) -> GlobalSettings {
        GlobalSettings {
            dev_sample_rate: rate,
            log2_hard_decim: hard,
            ..Default::default()
        }
    }

    #[test]
    fn test_compare_and_update_reports_change() {
        let state = SharedState::new();
        assert!(state.compare_and_update_global(globals(10e6, 1), 20e6));
        assert!(!state.compare_and_update_global(globals(10e6, 1), 20e6));
        assert!(state.compare_and_update_global(globals(5e6, 1), 10e6));
    }

    #[test]
    fn test_derived_rates_follow_soft_decim() {
        let state = SharedState::new();
        state.set_soft_decim(Direction::Rx, 2);
        state.compare_and_update_global(globals(10e6, 1), 20e6);

        let snap = state.read();
        assert_eq!(snap.output_rate(), 2.5e6);
        assert_eq!(snap.input_rate(), 10e6);
        assert!(snap.rates_consistent());

        state.set_soft_decim(Direction::Tx, 3);
        let snap = state.read();
        assert_eq!(snap.input_rate(), 1.25e6);
        assert!(snap.rates_consistent());
    }

    #[test]
    fn test_invariant_over_decimation_ranges() {
        let state = SharedState::new();
        for hard in 0..=crate::settings::MAX_LOG2_HARD_DECIM {
            for soft in 0..=crate::settings::MAX_LOG2_SOFT_DECIM {
                state.set_soft_decim(Direction::Rx, soft);
                let rate = 7_680_000.0;
                state.compare_and_update_global(globals(rate, hard), rate * f64::from(1u32 << hard));
                assert!(state.read().rates_consistent(), "hard {} soft {}", hard, soft);
            }
        }
    }

    #[test]
    fn test_suspended_flag_clears_once() {
        let state = SharedState::new();
        assert!(!state.take_suspended(Direction::Tx));
        state.mark_suspended(Direction::Tx);
        assert!(state.read().tx.thread_was_running);
        assert!(state.take_suspended(Direction::Tx));
        assert!(!state.take_suspended(Direction::Tx));
    }
}
