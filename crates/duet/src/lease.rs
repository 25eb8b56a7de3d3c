//! Channel leases
//!
//! Acquiring a channel opens the radio if nobody has yet; releasing the last
//! channel closes it. Open references are the claimed directions, so the
//! handle is closed exactly once no matter how teardown is ordered.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::device::PhysicalDevice;
use crate::sdk::EXPECTED_CHANNELS;
use crate::settings::{Channel, ChannelSelector, Direction};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LeaseError {
    #[error("cannot open {path}: {reason}")]
    DeviceOpen { path: String, reason: String },

    #[error("channel {channel} is already acquired by the {holder} instance")]
    ChannelAlreadyAcquired { channel: Channel, holder: Direction },

    #[error("{direction} instance already holds channel {channel}")]
    DirectionHeld { direction: Direction, channel: Channel },
}

impl PhysicalDevice {
    /// Claim `channel` for the `direction` instance, opening the radio first
    /// if needed.
    ///
    /// Re-acquiring the channel already held by the same direction returns a
    /// lease that owns no open reference.
    pub fn acquire_channel(
        self: &Arc<Self>,
        direction: Direction,
        channel: Channel,
    ) -> Result<ChannelLease, LeaseError> {
        let mut slot = self.lock_slot();

        match slot.leases[direction.index()] {
            Some(held) if held == channel => {
                debug!("{} already holds channel {} on {}", direction, channel, self.path());
                return Ok(ChannelLease::new(Arc::clone(self), direction, channel, false));
            }
            Some(held) => {
                return Err(LeaseError::DirectionHeld {
                    direction,
                    channel: held,
                })
            }
            None => {}
        }
        let buddy = direction.other();
        if slot.leases[buddy.index()] == Some(channel) {
            return Err(LeaseError::ChannelAlreadyAcquired {
                channel,
                holder: buddy,
            });
        }

        if slot.handle.is_none() {
            let mut handle = self.sdk.open(self.path()).map_err(|e| LeaseError::DeviceOpen {
                path: self.path().to_string(),
                reason: e.to_string(),
            })?;
            let count = handle.channel_count();
            if count != EXPECTED_CHANNELS {
                handle.close();
                return Err(LeaseError::DeviceOpen {
                    path: self.path().to_string(),
                    reason: format!(
                        "device reports {} channels, expected {}",
                        count, EXPECTED_CHANNELS
                    ),
                });
            }
            info!("opened {}", self.path());
            slot.handle = Some(handle);
        }

        slot.leases[direction.index()] = Some(channel);
        let refs = slot.open_refs();
        drop(slot);

        let selector = self.claimed_channels();
        self.state().set_channels(selector);
        debug!(
            "{} acquired channel {} on {} (refs {}, channels {:?})",
            direction,
            channel,
            self.path(),
            refs,
            selector
        );
        Ok(ChannelLease::new(Arc::clone(self), direction, channel, true))
    }

    /// Drop the `direction` instance's claim. Closes the radio when no claim
    /// remains. Releasing an unclaimed direction is a no-op.
    pub fn release_channel(&self, direction: Direction) {
        let mut slot = self.lock_slot();
        let Some(channel) = slot.leases[direction.index()].take() else {
            return;
        };
        let refs = slot.open_refs();
        if refs == 0 {
            match slot.handle.take() {
                Some(mut handle) => {
                    handle.close();
                    info!("closed {}", self.path());
                }
                None => warn!("{} had claims but no open handle", self.path()),
            }
        }
        drop(slot);

        self.state().set_channels(self.claimed_channels());
        debug!(
            "{} released channel {} on {} (refs {})",
            direction,
            channel,
            self.path(),
            refs
        );
    }

    pub fn claimed_channels(&self) -> ChannelSelector {
        self.lock_slot()
            .leases
            .iter()
            .flatten()
            .fold(ChannelSelector::None, |sel, &c| sel.with(c))
    }
}

/// An instance's claim on one channel of a shared radio.
///
/// Dropping a lease that owns the open reference releases the claim.
#[derive(Debug)]
pub struct ChannelLease {
    device: Arc<PhysicalDevice>,
    direction: Direction,
    channel: Channel,
    owns_open_ref: bool,
}

impl ChannelLease {
    fn new(
        device: Arc<PhysicalDevice>,
        direction: Direction,
        channel: Channel,
        owns_open_ref: bool,
    ) -> Self {
        Self {
            device,
            direction,
            channel,
            owns_open_ref,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn owns_open_ref(&self) -> bool {
        self.owns_open_ref
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if std::mem::take(&mut self.owns_open_ref) {
            self.device.release_channel(self.direction);
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
