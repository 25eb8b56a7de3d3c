//! Per-instance desired settings and the small enums they are built from.

use std::fmt;
use std::str::FromStr;

use duetconf::ChannelDefaults;
use serde::{Deserialize, Serialize};

/// Largest supported log2 hardware decimation/interpolation.
pub const MAX_LOG2_HARD_DECIM: u32 = 6;

/// Largest supported log2 host-side (soft) decimation.
pub const MAX_LOG2_SOFT_DECIM: u32 = 6;

/// Tunable LO range of the transceiver (Hz).
pub const LO_RANGE: (u64, u64) = (30_000_000, 3_800_000_000);

/// Device sample rate range (S/s).
pub const SAMPLE_RATE_RANGE: (f64, f64) = (100_000.0, 120_000_000.0);

/// Analog lowpass bandwidth range (Hz).
pub const LPF_RANGE: (f64, f64) = (500_000.0, 130_000_000.0);

/// Digital FIR bandwidth range (Hz).
pub const FIR_RANGE: (f64, f64) = (1_000.0, 56_000_000.0);

/// Which way samples flow for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Rx,
    Tx,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Rx, Direction::Tx];

    /// The buddy's direction.
    pub fn other(self) -> Self {
        match self {
            Direction::Rx => Direction::Tx,
            Direction::Tx => Direction::Rx,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Rx => 0,
            Direction::Tx => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Rx => "rx",
            Direction::Tx => "tx",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical channel on the physical radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub fn index(self) -> usize {
        match self {
            Channel::A => 0,
            Channel::B => 1,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::A => f.write_str("A"),
            Channel::B => f.write_str("B"),
        }
    }
}

impl FromStr for Channel {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" | "0" => Ok(Channel::A),
            "b" | "1" => Ok(Channel::B),
            _ => Err(SettingsError::Parse {
                field: "channel",
                value: s.to_string(),
            }),
        }
    }
}

/// Set of claimed logical channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelSelector {
    #[default]
    None,
    A,
    B,
    AB,
}

impl ChannelSelector {
    pub fn contains(self, channel: Channel) -> bool {
        matches!(
            (self, channel),
            (ChannelSelector::A, Channel::A)
                | (ChannelSelector::B, Channel::B)
                | (ChannelSelector::AB, _)
        )
    }

    pub fn with(self, channel: Channel) -> Self {
        Self::from_flags(
            self.contains(Channel::A) || channel == Channel::A,
            self.contains(Channel::B) || channel == Channel::B,
        )
    }

    pub fn without(self, channel: Channel) -> Self {
        Self::from_flags(
            self.contains(Channel::A) && channel != Channel::A,
            self.contains(Channel::B) && channel != Channel::B,
        )
    }

    fn from_flags(a: bool, b: bool) -> Self {
        match (a, b) {
            (false, false) => ChannelSelector::None,
            (true, false) => ChannelSelector::A,
            (false, true) => ChannelSelector::B,
            (true, true) => ChannelSelector::AB,
        }
    }
}

/// How RF gain is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainMode {
    /// One scalar, distributed over the stages by the SDK
    #[default]
    Auto,
    /// LNA, TIA and PGA set individually
    Manual,
}

impl FromStr for GainMode {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(GainMode::Auto),
            "manual" => Ok(GainMode::Manual),
            _ => Err(SettingsError::Parse {
                field: "gain_mode",
                value: s.to_string(),
            }),
        }
    }
}

/// A settable gain element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainStage {
    Auto,
    Lna,
    Tia,
    Pga,
}

impl GainStage {
    /// Accepted input range in dB (TIA is a 1-3 step index).
    pub fn range(self) -> (u32, u32) {
        match self {
            GainStage::Auto => (0, 70),
            GainStage::Lna => (0, 30),
            GainStage::Tia => (1, 3),
            GainStage::Pga => (0, 32),
        }
    }

    pub fn clamp(self, value: u32) -> u32 {
        let (lo, hi) = self.range();
        value.clamp(lo, hi)
    }
}

/// RF port selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AntennaPath {
    RxLow,
    RxHigh,
    RxWide,
    RxLowLoopback,
    RxWideLoopback,
    RxAuto,
    TxHigh,
    TxWide,
    TxAuto,
}

impl AntennaPath {
    pub fn default_for(direction: Direction) -> Self {
        match direction {
            Direction::Rx => AntennaPath::RxWide,
            Direction::Tx => AntennaPath::TxWide,
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            AntennaPath::TxHigh | AntennaPath::TxWide | AntennaPath::TxAuto => Direction::Tx,
            _ => Direction::Rx,
        }
    }
}

impl FromStr for AntennaPath {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = match s.to_ascii_lowercase().as_str() {
            "rx_low" | "lo" => AntennaPath::RxLow,
            "rx_high" | "hi" => AntennaPath::RxHigh,
            "rx_wide" | "wi" => AntennaPath::RxWide,
            "rx_low_loopback" => AntennaPath::RxLowLoopback,
            "rx_wide_loopback" => AntennaPath::RxWideLoopback,
            "rx_auto" => AntennaPath::RxAuto,
            "tx_high" => AntennaPath::TxHigh,
            "tx_wide" => AntennaPath::TxWide,
            "tx_auto" => AntennaPath::TxAuto,
            _ => {
                return Err(SettingsError::Parse {
                    field: "antenna",
                    value: s.to_string(),
                })
            }
        };
        Ok(path)
    }
}

/// Errors from building or validating settings.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid {field} value: {value:?}")]
    Parse { field: &'static str, value: String },

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("antenna {antenna:?} cannot be used for {direction}")]
    AntennaDirection {
        antenna: AntennaPath,
        direction: Direction,
    },
}

/// Desired settings for one instance.
///
/// Submitted by value; the apply engine never mutates a submitted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSnapshot {
    pub center_frequency: u64,
    /// Host-side sample rate before soft decimation (S/s)
    pub dev_sample_rate: f64,
    pub log2_hard_decim: u32,
    pub log2_soft_decim: u32,
    /// Analog lowpass bandwidth (Hz)
    pub lpf_bandwidth: f64,
    pub lpf_fir_enable: bool,
    /// Digital FIR bandwidth (Hz)
    pub lpf_fir_bandwidth: f64,
    pub gain_mode: GainMode,
    /// Auto-mode gain (dB)
    pub gain: u32,
    pub lna_gain: u32,
    pub tia_gain: u32,
    pub pga_gain: u32,
    pub antenna: AntennaPath,
    pub nco_enable: bool,
    /// NCO offset relative to the center frequency (Hz)
    pub nco_frequency: i64,
    pub ext_clock: bool,
    pub ext_clock_freq: u32,
    pub power_mode: u32,
    pub dc_block: bool,
    pub iq_correction: bool,
}

impl ConfigurationSnapshot {
    pub fn defaults_for(direction: Direction) -> Self {
        Self {
            center_frequency: 435_000_000,
            dev_sample_rate: 5_000_000.0,
            log2_hard_decim: 1,
            log2_soft_decim: 0,
            lpf_bandwidth: 4_500_000.0,
            lpf_fir_enable: false,
            lpf_fir_bandwidth: 2_500_000.0,
            gain_mode: GainMode::Auto,
            gain: 50,
            lna_gain: 15,
            tia_gain: 2,
            pga_gain: 16,
            antenna: AntennaPath::default_for(direction),
            nco_enable: false,
            nco_frequency: 0,
            ext_clock: false,
            ext_clock_freq: 0,
            power_mode: 1,
            dc_block: false,
            iq_correction: false,
        }
    }

    /// Build from a config file section; returns the channel to claim too.
    pub fn from_channel_defaults(
        direction: Direction,
        defaults: &ChannelDefaults,
    ) -> Result<(Channel, Self), SettingsError> {
        let channel = match &defaults.channel {
            Some(c) => c.parse()?,
            None => match direction {
                Direction::Rx => Channel::A,
                Direction::Tx => Channel::B,
            },
        };
        let antenna = match &defaults.antenna {
            Some(a) => a.parse()?,
            None => AntennaPath::default_for(direction),
        };

        let snapshot = Self {
            center_frequency: defaults.center_frequency,
            dev_sample_rate: defaults.dev_sample_rate,
            log2_hard_decim: defaults.log2_hard_decim,
            log2_soft_decim: defaults.log2_soft_decim,
            lpf_bandwidth: defaults.lpf_bandwidth,
            lpf_fir_enable: defaults.lpf_fir_enable,
            lpf_fir_bandwidth: defaults.lpf_fir_bandwidth,
            gain_mode: defaults.gain_mode.parse()?,
            gain: defaults.gain,
            lna_gain: defaults.lna_gain,
            tia_gain: defaults.tia_gain,
            pga_gain: defaults.pga_gain,
            antenna,
            nco_enable: defaults.nco_enable,
            nco_frequency: defaults.nco_frequency,
            ext_clock: defaults.ext_clock,
            ext_clock_freq: defaults.ext_clock_freq,
            power_mode: defaults.power_mode,
            dc_block: defaults.dc_block,
            iq_correction: defaults.iq_correction,
        };
        snapshot.validate(direction)?;
        Ok((channel, snapshot))
    }

    /// Sample-clock rate this snapshot asks for.
    pub fn master_rate(&self) -> f64 {
        self.dev_sample_rate * f64::from(1u32 << self.log2_hard_decim)
    }

    /// Rate delivered to (or taken from) the host after soft decimation.
    pub fn host_rate(&self) -> f64 {
        self.dev_sample_rate / f64::from(1u32 << self.log2_soft_decim)
    }

    pub fn validate(&self, direction: Direction) -> Result<(), SettingsError> {
        check_range("dev_sample_rate", self.dev_sample_rate, SAMPLE_RATE_RANGE)?;
        check_range("lpf_bandwidth", self.lpf_bandwidth, LPF_RANGE)?;
        if self.lpf_fir_enable {
            check_range("lpf_fir_bandwidth", self.lpf_fir_bandwidth, FIR_RANGE)?;
        }
        let (lo_min, lo_max) = LO_RANGE;
        if !(lo_min..=lo_max).contains(&self.center_frequency) {
            return Err(SettingsError::OutOfRange {
                field: "center_frequency",
                value: self.center_frequency.to_string(),
            });
        }
        if self.log2_hard_decim > MAX_LOG2_HARD_DECIM {
            return Err(SettingsError::OutOfRange {
                field: "log2_hard_decim",
                value: self.log2_hard_decim.to_string(),
            });
        }
        if self.log2_soft_decim > MAX_LOG2_SOFT_DECIM {
            return Err(SettingsError::OutOfRange {
                field: "log2_soft_decim",
                value: self.log2_soft_decim.to_string(),
            });
        }
        // NCO stays within half the sample clock either side of the LO
        if self.nco_frequency.unsigned_abs() as f64 > self.master_rate() / 2.0 {
            return Err(SettingsError::OutOfRange {
                field: "nco_frequency",
                value: self.nco_frequency.to_string(),
            });
        }
        if self.ext_clock && self.ext_clock_freq == 0 {
            return Err(SettingsError::OutOfRange {
                field: "ext_clock_freq",
                value: "0 with external clock enabled".to_string(),
            });
        }
        if self.antenna.direction() != direction {
            return Err(SettingsError::AntennaDirection {
                antenna: self.antenna,
                direction,
            });
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, (min, max): (f64, f64)) -> Result<(), SettingsError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(SettingsError::OutOfRange {
            field,
            value: value.to_string(),
        })
    }
}
