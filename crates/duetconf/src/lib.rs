//! Minimal configuration loading for duet.
//!
//! # Configuration Philosophy
//!
//! - **Infrastructure** (`InfraConfig`): which radio to open, FIFO sizing,
//!   where recordings go, logging. Fixed for the life of the process.
//!
//! - **Bootstrap** (`BootstrapConfig`): the first settings snapshot for each
//!   direction. After startup the running instances own their settings and
//!   the control layer changes them.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/duet/config.toml` (system)
//! 2. `~/.config/duet/config.toml` (user)
//! 3. `./duet.toml` (local override, or a path given on the command line)
//! 4. Environment variables (`DUET_*`)
//!
//! # Example Config
//!
//! ```toml
//! [device]
//! path = "pcie:///dev/xtrx0"
//! fifo_seconds = 0.25
//!
//! [telemetry]
//! log_level = "info,duet=debug"
//!
//! [rx]
//! channel = "a"
//! dev_sample_rate = 5000000.0
//! log2_hard_decim = 1
//! gain_mode = "auto"
//! gain = 50
//!
//! [tx]
//! channel = "b"
//! antenna = "tx_wide"
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, ChannelDefaults};
pub use infra::{DeviceConfig, InfraConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value in config file {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// Complete duet configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DuetConfig {
    #[serde(flatten)]
    pub infra: InfraConfig,

    #[serde(flatten)]
    pub bootstrap: BootstrapConfig,
}

impl DuetConfig {
    /// Load from all sources, with `config_path` replacing the local
    /// `./duet.toml`, and report which sources contributed.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = DuetConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# duet configuration\n\n");
        match toml::to_string_pretty(self) {
            Ok(body) => output.push_str(&body),
            Err(e) => output.push_str(&format!("# failed to render config: {}\n", e)),
        }
        output
    }
}
