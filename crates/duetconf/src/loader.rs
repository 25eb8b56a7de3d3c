//! Config file discovery, loading, and environment variable overlay.

use crate::bootstrap::ChannelDefaults;
use crate::infra::{DeviceConfig, TelemetryConfig};
use crate::{BootstrapConfig, ConfigError, DuetConfig, InfraConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Existing config files in load order: system, user, then `cli_path` if it
/// exists, else `./duet.toml`.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/duet/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("duet/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("duet.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<DuetConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from TOML string.
pub(crate) fn parse_toml(contents: &str, path: &Path) -> Result<DuetConfig, ConfigError> {
    let mut config: DuetConfig =
        toml::from_str(contents).map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    config.infra.device.record_dir =
        expand_path(&config.infra.device.record_dir.to_string_lossy());

    if !(config.infra.device.fifo_seconds > 0.0) {
        return Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            message: format!(
                "device.fifo_seconds must be positive, got {}",
                config.infra.device.fifo_seconds
            ),
        });
    }

    Ok(config)
}

fn pick<T: PartialEq>(base: T, overlay: T, default: T) -> T {
    if overlay != default {
        overlay
    } else {
        base
    }
}

/// Merge two configs, with `overlay` taking precedence where it differs
/// from the compiled defaults.
pub fn merge_configs(base: DuetConfig, overlay: DuetConfig) -> DuetConfig {
    let device_default = DeviceConfig::default();
    let telemetry_default = TelemetryConfig::default();

    DuetConfig {
        infra: InfraConfig {
            device: DeviceConfig {
                path: pick(
                    base.infra.device.path,
                    overlay.infra.device.path,
                    device_default.path,
                ),
                fifo_seconds: pick(
                    base.infra.device.fifo_seconds,
                    overlay.infra.device.fifo_seconds,
                    device_default.fifo_seconds,
                ),
                record_dir: pick(
                    base.infra.device.record_dir,
                    overlay.infra.device.record_dir,
                    device_default.record_dir,
                ),
            },
            telemetry: TelemetryConfig {
                log_level: pick(
                    base.infra.telemetry.log_level,
                    overlay.infra.telemetry.log_level,
                    telemetry_default.log_level,
                ),
                status_interval_ms: pick(
                    base.infra.telemetry.status_interval_ms,
                    overlay.infra.telemetry.status_interval_ms,
                    telemetry_default.status_interval_ms,
                ),
            },
        },
        // Channel sections replace as a whole
        bootstrap: BootstrapConfig {
            rx: pick(base.bootstrap.rx, overlay.bootstrap.rx, ChannelDefaults::default()),
            tx: pick(base.bootstrap.tx, overlay.bootstrap.tx, ChannelDefaults::default()),
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut DuetConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("DUET_DEVICE_PATH") {
        config.infra.device.path = v;
        sources.env_overrides.push("DUET_DEVICE_PATH".to_string());
    }
    if let Ok(v) = env::var("DUET_FIFO_SECONDS") {
        if let Ok(seconds) = v.parse::<f64>() {
            if seconds > 0.0 {
                config.infra.device.fifo_seconds = seconds;
                sources.env_overrides.push("DUET_FIFO_SECONDS".to_string());
            }
        }
    }
    if let Ok(v) = env::var("DUET_RECORD_DIR") {
        config.infra.device.record_dir = expand_path(&v);
        sources.env_overrides.push("DUET_RECORD_DIR".to_string());
    }
    if let Ok(v) = env::var("DUET_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("DUET_LOG_LEVEL".to_string());
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
