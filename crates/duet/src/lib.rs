//! Duet: buddy coordination for dual-channel SDR transceivers
//!
//! An XTRX-class radio has two logical channels sharing one RF front-end, one
//! clock tree and one sample-rate generator. Duet lets two independent
//! instances (one receive, one transmit) drive such a radio at the same time:
//!
//! - **Shared state** (`shared`): the negotiated device-wide settings, one per
//!   radio, behind a lock that only guards in-memory updates
//! - **Notifications** (`notify`): fire-and-forget messages telling the buddy
//!   what changed so its settings mirror stays truthful
//! - **Leases** (`lease`): reference-counted channel claims that open and
//!   close the radio
//! - **Apply engine** (`apply`): diffs settings, suspends disturbed streaming
//!   threads, makes the minimal hardware calls, resumes
//! - **Stream threads** (`thread`, `worker`): the four-call contract the
//!   engine drives, and the sample worker that implements it
//!
//! Hardware is reached only through the `sdk` traits; `sim` provides an
//! in-memory radio.

pub mod apply;
pub mod device;
pub mod instance;
pub mod lease;
pub mod notify;
pub mod recorder;
pub mod sdk;
pub mod settings;
pub mod shared;
pub mod sim;
pub mod thread;
pub mod worker;

pub use apply::{ApplyEngine, ApplyError, ApplyPhase, ApplyReport, SettingsDiff};
pub use device::{DeviceRegistry, PhysicalDevice};
pub use instance::{DeviceInstance, InstanceConfig, InstanceError, Report, StreamInfo};
pub use lease::{ChannelLease, LeaseError};
pub use notify::{BuddyMailboxes, BuddyNotification, MailboxError};
pub use recorder::{IqRecorder, RecorderError};
pub use sdk::{
    discover_channels, ChannelDescriptor, DiscoveredDevice, FilterKind, HardwareStreamStatus,
    IqSample, RadioHandle, RadioSdk, SdkError,
};
pub use settings::{
    AntennaPath, Channel, ChannelSelector, ConfigurationSnapshot, Direction, GainMode, GainStage,
    SettingsError,
};
pub use shared::{DirectionState, GlobalSettings, SharedDeviceState, SharedState};
pub use sim::{SdkCall, SdkCallKind, SimulatedSdk};
pub use thread::{StreamThread, StreamThreadError, ThreadRegistry, WorkerStats, WorkerStatsSnapshot};
pub use worker::{HostFifo, SampleWorker, SampleWorkerFactory, StreamThreadFactory, WorkerContext};
