//! Streaming thread control
//!
//! The apply engine sequences only four calls on a streaming thread. Anything
//! implementing `StreamThread` can stand in, including test doubles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::settings::Direction;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamThreadError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("sample FIFO is not available (taken or lost)")]
    FifoUnavailable,

    #[error("worker failed: {0}")]
    Worker(String),
}

/// Start/stop/rate capability of a capture or playback thread.
///
/// `stop_work` returns only after the thread has stopped touching the device.
/// `set_device_sample_rate` is only called while the thread is stopped.
pub trait StreamThread: Send + Sync {
    fn start_work(&self) -> Result<(), StreamThreadError>;

    fn stop_work(&self);

    fn set_device_sample_rate(&self, rate: f64);

    fn is_running(&self) -> bool;

    /// Counters for stream-info reports.
    fn stats(&self) -> Option<WorkerStatsSnapshot> {
        None
    }
}

/// Running threads attached to one radio, one slot per direction.
#[derive(Default)]
pub struct ThreadRegistry {
    slots: Mutex<[Option<Arc<dyn StreamThread>>; 2]>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, direction: Direction, thread: Option<Arc<dyn StreamThread>>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots[direction.index()] = thread;
    }

    pub fn get(&self, direction: Direction) -> Option<Arc<dyn StreamThread>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots[direction.index()].clone()
    }

    pub fn take(&self, direction: Direction) -> Option<Arc<dyn StreamThread>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots[direction.index()].take()
    }

    /// Directions whose thread is currently running.
    pub fn running(&self) -> Vec<(Direction, Arc<dyn StreamThread>)> {
        Direction::ALL
            .into_iter()
            .filter_map(|d| self.get(d).filter(|t| t.is_running()).map(|t| (d, t)))
            .collect()
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ThreadRegistry")
            .field("rx", &slots[0].is_some())
            .field("tx", &slots[1].is_some())
            .finish()
    }
}

/// Runtime counters updated by a worker thread.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub samples: AtomicU64,
    pub underruns: AtomicU64,
    pub overruns: AtomicU64,
    pub fifo_filled: AtomicU64,
    pub fifo_size: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            samples: self.samples.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            fifo_filled: self.fifo_filled.load(Ordering::Relaxed),
            fifo_size: self.fifo_size.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub samples: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub fifo_filled: u64,
    pub fifo_size: u64,
}
