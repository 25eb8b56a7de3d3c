//! Buddy notifications
//!
//! Fire-and-forget messages from one instance to the other instance on the
//! same radio. A notification only updates the receiver's settings mirror;
//! it never causes the receiver to touch hardware.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::settings::Direction;

/// Report sent to the buddy after a device-wide change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuddyNotification {
    /// Sample clock or hard decimation changed
    RateChanged {
        dev_sample_rate: f64,
        log2_hard_decim: u32,
        /// Originator's center frequency, for display only
        center_frequency: u64,
        origin: Direction,
    },
    ClockSourceChanged { ext_clock: bool, ext_clock_freq: u32 },
    DeviceInfo { temperature: f32 },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MailboxError {
    #[error("{0} mailbox already has a listener")]
    AlreadyRegistered(Direction),
}

/// Inbound queues of both directions on one radio.
///
/// Queues are unbounded and FIFO, which gives per-originator ordering.
#[derive(Debug, Default)]
pub struct BuddyMailboxes {
    senders: Mutex<[Option<mpsc::UnboundedSender<BuddyNotification>>; 2]>,
}

impl BuddyMailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener for notifications addressed to `direction`.
    pub fn register(
        &self,
        direction: Direction,
    ) -> Result<mpsc::UnboundedReceiver<BuddyNotification>, MailboxError> {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = &mut senders[direction.index()];
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(MailboxError::AlreadyRegistered(direction));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        Ok(rx)
    }

    pub fn unregister(&self, direction: Direction) {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders[direction.index()] = None;
    }

    /// Deliver `notification` to the buddy of `origin`.
    ///
    /// Dropped silently when the buddy has no listener.
    pub fn notify_buddy(&self, origin: Direction, notification: BuddyNotification) {
        let target = origin.other();
        let sender = {
            let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
            senders[target.index()].clone()
        };
        match sender {
            Some(tx) => {
                if tx.send(notification).is_err() {
                    trace!("{} listener gone, dropped {:?}", target, notification);
                }
            }
            None => trace!("no {} listener, dropped {:?}", target, notification),
        }
    }
}
