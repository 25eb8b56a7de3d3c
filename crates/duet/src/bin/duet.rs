//! Duet daemon binary
//!
//! Opens one radio, attaches a receive and a transmit instance to it, starts
//! both and logs their status until interrupted.
//!
//! Usage: `duet [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use duet::{
    discover_channels, ConfigurationSnapshot, DeviceInstance, DeviceRegistry, Direction,
    InstanceConfig, Report, SampleWorkerFactory, SimulatedSdk,
};
use duetconf::DuetConfig;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let (config, sources) = DuetConfig::load_with_sources_from(config_path.as_deref())
        .context("failed to load configuration")?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.infra.telemetry.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("duet {} starting", env!("CARGO_PKG_VERSION"));
    for file in &sources.files {
        info!("config: {}", file.display());
    }
    for var in &sources.env_overrides {
        info!("config override: {}", var);
    }
    tracing::debug!("effective config:\n{}", config.to_toml());

    let path = config.infra.device.path.clone();
    if !path.starts_with("sim://") {
        warn!("no hardware binding linked, simulating {}", path);
    }
    let sdk = Arc::new(SimulatedSdk::single(&path));
    for channel in discover_channels(sdk.as_ref()) {
        info!("found {} ({})", channel.display_name, channel.path);
    }

    let registry = DeviceRegistry::new(sdk);
    let device = registry.device(&path);
    let factory = Arc::new(SampleWorkerFactory);

    let mut instances = Vec::new();
    for (direction, defaults) in [
        (Direction::Rx, &config.bootstrap.rx),
        (Direction::Tx, &config.bootstrap.tx),
    ] {
        let (channel, settings) = ConfigurationSnapshot::from_channel_defaults(direction, defaults)
            .with_context(|| format!("invalid [{}] settings", direction))?;
        let instance = DeviceInstance::new(
            Arc::clone(&device),
            InstanceConfig {
                direction,
                channel,
                fifo_seconds: config.infra.device.fifo_seconds,
                record_dir: config.infra.device.record_dir.clone(),
            },
            settings,
            factory.clone(),
        )?;
        let reports = instance.subscribe_reports();
        tokio::spawn(log_reports(direction, reports));
        instances.push(instance);
    }

    for instance in &instances {
        instance
            .start()
            .with_context(|| format!("failed to start {} instance", instance.direction()))?;
    }

    let mut status = tokio::time::interval(Duration::from_millis(
        config.infra.telemetry.status_interval_ms.max(1),
    ));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = status.tick() => {
                for instance in &instances {
                    instance.process_notifications();
                    instance.stream_info();
                    if let Err(e) = instance.device_info() {
                        warn!("{} device info: {}", instance.direction(), e);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }

    for instance in &instances {
        instance.stop();
    }
    drop(instances);
    info!("duet shutdown complete");
    Ok(())
}

async fn log_reports(direction: Direction, mut reports: tokio::sync::mpsc::UnboundedReceiver<Report>) {
    while let Some(report) = reports.recv().await {
        match report {
            Report::StreamInfo { info } => info!(
                "{}: active {} fifo {}/{} under {} over {} rate {} link {:.0} B/s",
                direction,
                info.active,
                info.fifo_filled,
                info.fifo_size,
                info.underrun,
                info.overrun,
                info.sample_rate,
                info.link_rate
            ),
            Report::DeviceInfo { temperature } => {
                tracing::debug!("{}: temperature {:.1} C", direction, temperature)
            }
            Report::Buddy { notification } => info!("{}: buddy {:?}", direction, notification),
            Report::StartStop { running } => info!("{}: running {}", direction, running),
        }
    }
}
