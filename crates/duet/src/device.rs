//! Physical radio ownership
//!
//! A `PhysicalDevice` is the one object both buddies share. It owns the SDK
//! handle (opened and closed by the lease logic in `lease.rs`), the negotiated
//! `SharedState`, the running-thread registry and the notification mailboxes.
//! Either instance can be dropped independently; the device lives until the
//! last `Arc` goes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use crate::notify::BuddyMailboxes;
use crate::sdk::{RadioHandle, RadioSdk, SdkError};
use crate::settings::Channel;
use crate::shared::SharedState;
use crate::thread::ThreadRegistry;

/// Handle plus per-direction channel claims. Open refs = claimed directions.
#[derive(Default)]
pub(crate) struct HandleSlot {
    pub(crate) handle: Option<Box<dyn RadioHandle>>,
    pub(crate) leases: [Option<Channel>; 2],
}

impl HandleSlot {
    pub(crate) fn open_refs(&self) -> usize {
        self.leases.iter().filter(|l| l.is_some()).count()
    }
}

pub struct PhysicalDevice {
    path: String,
    pub(crate) sdk: Arc<dyn RadioSdk>,
    pub(crate) slot: Mutex<HandleSlot>,
    state: SharedState,
    threads: ThreadRegistry,
    mailboxes: BuddyMailboxes,
    reconfigure: Mutex<()>,
}

impl PhysicalDevice {
    pub fn new(path: impl Into<String>, sdk: Arc<dyn RadioSdk>) -> Self {
        Self {
            path: path.into(),
            sdk,
            slot: Mutex::new(HandleSlot::default()),
            state: SharedState::new(),
            threads: ThreadRegistry::new(),
            mailboxes: BuddyMailboxes::new(),
            reconfigure: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn mailboxes(&self) -> &BuddyMailboxes {
        &self.mailboxes
    }

    pub(crate) fn lock_slot(&self) -> MutexGuard<'_, HandleSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serializes whole applies across both buddies.
    pub(crate) fn reconfigure_guard(&self) -> MutexGuard<'_, ()> {
        self.reconfigure.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.lock_slot().handle.is_some()
    }

    pub fn open_refs(&self) -> usize {
        self.lock_slot().open_refs()
    }

    /// Run `f` against the open handle.
    pub fn with_handle<T>(
        &self,
        f: impl FnOnce(&mut dyn RadioHandle) -> Result<T, SdkError>,
    ) -> Result<T, SdkError> {
        let mut slot = self.lock_slot();
        match slot.handle.as_deref_mut() {
            Some(handle) => f(handle),
            None => Err(SdkError::Closed),
        }
    }
}

impl std::fmt::Debug for PhysicalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDevice")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("threads", &self.threads)
            .finish()
    }
}

/// One `PhysicalDevice` per path, shared by whoever asks for that path.
pub struct DeviceRegistry {
    sdk: Arc<dyn RadioSdk>,
    devices: Mutex<HashMap<String, Weak<PhysicalDevice>>>,
}

impl DeviceRegistry {
    pub fn new(sdk: Arc<dyn RadioSdk>) -> Self {
        Self {
            sdk,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn sdk(&self) -> &Arc<dyn RadioSdk> {
        &self.sdk
    }

    /// The device for `path`, created on first request.
    pub fn device(&self, path: &str) -> Arc<PhysicalDevice> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = devices.get(path).and_then(Weak::upgrade) {
            return existing;
        }
        debug!("creating device entry for {}", path);
        let device = Arc::new(PhysicalDevice::new(path, Arc::clone(&self.sdk)));
        devices.insert(path.to_string(), Arc::downgrade(&device));
        devices.retain(|_, weak| weak.strong_count() > 0);
        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedSdk;

    #[test]
    fn test_registry_shares_by_path() {
        let registry = DeviceRegistry::new(Arc::new(SimulatedSdk::single("sim://xtrx0")));
        let a = registry.device("sim://xtrx0");
        let b = registry.device("sim://xtrx0");
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.device("sim://xtrx1");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_registry_recreates_after_drop() {
        let registry = DeviceRegistry::new(Arc::new(SimulatedSdk::single("sim://xtrx0")));
        let first = Arc::downgrade(&registry.device("sim://xtrx0"));
        assert!(first.upgrade().is_none());
        let again = registry.device("sim://xtrx0");
        assert_eq!(again.path(), "sim://xtrx0");
    }

    #[test]
    fn test_with_handle_closed() {
        let device = PhysicalDevice::new("sim://xtrx0", Arc::new(SimulatedSdk::single("sim://xtrx0")));
        assert_eq!(device.with_handle(|h| h.temperature()), Err(SdkError::Closed));
    }
}
