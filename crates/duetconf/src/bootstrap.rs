//! Bootstrap configuration - seeds each channel's first settings snapshot,
//! then the running instance owns them.

use serde::{Deserialize, Serialize};

/// Initial settings for one direction (RX or TX).
///
/// Enumerated values (`gain_mode`, `antenna`, `channel`) are kept as strings
/// here so this crate stays free of radio types; the daemon parses them.
/// `channel` and `antenna` left unset fall back to the direction's default
/// (channel A / wide-band RX port, channel B / wide-band TX port).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelDefaults {
    /// Logical channel: "a" or "b"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub center_frequency: u64,
    pub dev_sample_rate: f64,
    pub log2_hard_decim: u32,
    pub log2_soft_decim: u32,
    /// Analog lowpass bandwidth (Hz)
    pub lpf_bandwidth: f64,
    pub lpf_fir_enable: bool,
    /// Digital FIR bandwidth (Hz)
    pub lpf_fir_bandwidth: f64,
    /// "auto" or "manual"
    pub gain_mode: String,
    pub gain: u32,
    pub lna_gain: u32,
    pub tia_gain: u32,
    pub pga_gain: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub antenna: Option<String>,
    pub nco_enable: bool,
    pub nco_frequency: i64,
    pub ext_clock: bool,
    pub ext_clock_freq: u32,
    pub power_mode: u32,
    pub dc_block: bool,
    pub iq_correction: bool,
}

impl Default for ChannelDefaults {
    fn default() -> Self {
        Self {
            channel: None,
            center_frequency: 435_000_000,
            dev_sample_rate: 5_000_000.0,
            log2_hard_decim: 1,
            log2_soft_decim: 0,
            lpf_bandwidth: 4_500_000.0,
            lpf_fir_enable: false,
            lpf_fir_bandwidth: 2_500_000.0,
            gain_mode: "auto".to_string(),
            gain: 50,
            lna_gain: 15,
            tia_gain: 2,
            pga_gain: 16,
            antenna: None,
            nco_enable: false,
            nco_frequency: 0,
            ext_clock: false,
            ext_clock_freq: 0,
            power_mode: 1,
            dc_block: false,
            iq_correction: false,
        }
    }
}

/// Seeds for both directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub rx: ChannelDefaults,

    #[serde(default)]
    pub tx: ChannelDefaults,
}
