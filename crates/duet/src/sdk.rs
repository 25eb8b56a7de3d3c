//! Native radio SDK contract
//!
//! The core never talks to hardware except through these two traits.
//! `RadioSdk` enumerates and opens devices by path; `RadioHandle` is the
//! opened device. A handle is owned by exactly one `PhysicalDevice` and every
//! call on it is serialized by that device's handle lock.

use serde::{Deserialize, Serialize};

use crate::settings::{AntennaPath, Channel, Direction, GainStage};

/// Number of logical channels an XTRX-class transceiver must expose.
pub const EXPECTED_CHANNELS: usize = 2;

/// Errors reported by the SDK.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SdkError {
    #[error("no device at {0}")]
    NoDevice(String),

    #[error("{call} failed: {message}")]
    Call { call: &'static str, message: String },

    #[error("device is not open")]
    Closed,
}

/// One entry from SDK discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Path accepted by `RadioSdk::open`
    pub path: String,
    /// Unique name reported by the hardware (serial or bus address)
    pub uniqname: String,
    pub channel_count: usize,
}

/// One selectable (device, channel) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub display_name: String,
    pub path: String,
    pub device_index: usize,
    pub channel: Channel,
}

/// Expand discovery output into one descriptor per logical channel.
pub fn discover_channels(sdk: &dyn RadioSdk) -> Vec<ChannelDescriptor> {
    let mut result = Vec::new();
    for (i, dev) in sdk.discover().iter().enumerate() {
        for (j, channel) in [Channel::A, Channel::B]
            .into_iter()
            .take(dev.channel_count.min(EXPECTED_CHANNELS))
            .enumerate()
        {
            result.push(ChannelDescriptor {
                display_name: format!("XTRX[{}:{}] {}", i, j, dev.uniqname),
                path: dev.path.clone(),
                device_index: i,
                channel,
            });
        }
    }
    result
}

/// Filter selector for `set_filter_bandwidth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    /// RF front-end analog lowpass
    Analog,
    /// Digital FIR in the TSP; bandwidth 0 bypasses it
    Digital,
}

/// Link-level status as reported by the hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareStreamStatus {
    pub dropped_packets: u64,
    /// Combined data rate of all streams in this direction (bytes/s)
    pub link_rate: f64,
    /// Current hardware sample timestamp
    pub timestamp: u64,
}

/// Interleaved complex 16-bit sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IqSample {
    pub i: i16,
    pub q: i16,
}

/// Device enumeration and open.
pub trait RadioSdk: Send + Sync {
    fn discover(&self) -> Vec<DiscoveredDevice>;

    fn open(&self, path: &str) -> Result<Box<dyn RadioHandle>, SdkError>;
}

/// An opened radio.
pub trait RadioHandle: Send {
    fn channel_count(&self) -> usize;

    fn close(&mut self);

    /// Program the sample clock. Returns the actual master rate.
    fn set_sample_rate(
        &mut self,
        rate: f64,
        master: f64,
        direction: Direction,
    ) -> Result<f64, SdkError>;

    fn set_reference_clock(&mut self, external: bool, frequency: u32) -> Result<(), SdkError>;

    /// Tune the LO. Returns the actual frequency.
    fn tune(&mut self, direction: Direction, frequency: u64) -> Result<u64, SdkError>;

    /// Set the baseband NCO offset; 0 disables mixing.
    fn tune_nco(
        &mut self,
        direction: Direction,
        channel: Channel,
        offset: i64,
    ) -> Result<(), SdkError>;

    /// `GainStage::Auto` hands the scalar to the SDK's own stage distribution.
    /// Returns the actual gain.
    fn set_gain(
        &mut self,
        direction: Direction,
        channel: Channel,
        stage: GainStage,
        db: f64,
    ) -> Result<f64, SdkError>;

    fn set_antenna(&mut self, direction: Direction, antenna: AntennaPath)
        -> Result<(), SdkError>;

    /// Returns the actual bandwidth.
    fn set_filter_bandwidth(
        &mut self,
        direction: Direction,
        channel: Channel,
        kind: FilterKind,
        hz: f64,
    ) -> Result<f64, SdkError>;

    fn set_power_mode(&mut self, mode: u32) -> Result<(), SdkError>;

    /// Die temperature in degrees Celsius.
    fn temperature(&mut self) -> Result<f32, SdkError>;

    fn stream_status(&mut self, direction: Direction) -> Result<HardwareStreamStatus, SdkError>;

    /// Pull received samples. Returns the count written into `buf`.
    fn read_samples(&mut self, channel: Channel, buf: &mut [IqSample]) -> Result<usize, SdkError>;

    /// Push samples for transmission. Returns the count consumed.
    fn write_samples(&mut self, channel: Channel, buf: &[IqSample]) -> Result<usize, SdkError>;
}
