//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which radio to attach to and how to size host-side buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device path handed to the SDK's open call.
    /// Default: sim://xtrx0 (the in-process simulated radio)
    #[serde(default = "DeviceConfig::default_path")]
    pub path: String,

    /// Sample FIFO length in seconds of host-rate samples.
    /// Default: 0.25
    #[serde(default = "DeviceConfig::default_fifo_seconds")]
    pub fifo_seconds: f64,

    /// Directory for I/Q recordings.
    /// Default: ~/.local/share/duet/records
    #[serde(default = "DeviceConfig::default_record_dir")]
    pub record_dir: PathBuf,
}

impl DeviceConfig {
    fn default_path() -> String {
        "sim://xtrx0".to_string()
    }

    fn default_fifo_seconds() -> f64 {
        0.25
    }

    fn default_record_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/duet/records"))
            .unwrap_or_else(|| PathBuf::from(".local/share/duet/records"))
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            fifo_seconds: Self::default_fifo_seconds(),
            record_dir: Self::default_record_dir(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Filter directive used when RUST_LOG is unset.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// Status poll interval for stream info reports, in milliseconds.
    /// Default: 500
    #[serde(default = "TelemetryConfig::default_status_interval_ms")]
    pub status_interval_ms: u64,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_status_interval_ms() -> u64 {
        500
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            status_interval_ms: Self::default_status_interval_ms(),
        }
    }
}

/// All infrastructure settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}
