//! Device instances
//!
//! A `DeviceInstance` is one direction of one radio as the control layer sees
//! it: submit settings, start and stop streaming, query stream and device
//! info, toggle recording, save and restore settings. Two instances (one RX,
//! one TX) can share a radio; they only meet through the `PhysicalDevice`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::apply::{ApplyEngine, ApplyError, ApplyReport};
use crate::device::PhysicalDevice;
use crate::lease::{ChannelLease, LeaseError};
use crate::notify::{BuddyNotification, MailboxError};
use crate::recorder::{IqRecorder, RecorderError};
use crate::sdk::SdkError;
use crate::settings::{Channel, ConfigurationSnapshot, Direction, SettingsError};
use crate::thread::{StreamThread, StreamThreadError, WorkerStats};
use crate::worker::{fifo_size, sample_fifo, HostFifo, StreamThreadFactory, WorkerContext};

/// Version written into settings blobs.
pub const SETTINGS_BLOB_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Thread(#[from] StreamThreadError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Sdk(#[from] SdkError),

    #[error("recording is only supported on receive instances")]
    RecordingUnsupported,

    #[error("settings blob is not valid: {0}")]
    Blob(#[from] serde_json::Error),

    #[error("unsupported settings blob version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    pub direction: Direction,
    pub channel: Channel,
    /// FIFO length in seconds of host-rate samples
    pub fifo_seconds: f64,
    pub record_dir: PathBuf,
}

/// Stream health, as shown by a status panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// False when the radio could not be queried
    pub success: bool,
    pub active: bool,
    pub fifo_filled: u64,
    pub fifo_size: u64,
    pub underrun: u64,
    pub overrun: u64,
    pub dropped_packets: u64,
    pub sample_rate: f64,
    pub link_rate: f64,
    pub timestamp: u64,
}

/// Messages for this instance's own control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Report {
    Buddy { notification: BuddyNotification },
    StreamInfo { info: StreamInfo },
    DeviceInfo { temperature: f32 },
    StartStop { running: bool },
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsBlob {
    version: u32,
    settings: ConfigurationSnapshot,
}

#[derive(Default)]
struct RunState {
    lease: Option<ChannelLease>,
    thread: Option<Arc<dyn StreamThread>>,
    host_fifo: Option<HostFifo>,
}

pub struct DeviceInstance {
    id: Uuid,
    config: InstanceConfig,
    device: Arc<PhysicalDevice>,
    engine: ApplyEngine,
    settings: Mutex<ConfigurationSnapshot>,
    factory: Arc<dyn StreamThreadFactory>,
    run: Mutex<RunState>,
    stats: Mutex<Arc<WorkerStats>>,
    recorder: Arc<Mutex<Option<IqRecorder>>>,
    inbox: Mutex<mpsc::UnboundedReceiver<BuddyNotification>>,
    reports: Mutex<Option<mpsc::UnboundedSender<Report>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceInstance {
    /// Attach a new instance to `device`. Only one instance per direction
    /// can be attached at a time.
    pub fn new(
        device: Arc<PhysicalDevice>,
        config: InstanceConfig,
        settings: ConfigurationSnapshot,
        factory: Arc<dyn StreamThreadFactory>,
    ) -> Result<Self, InstanceError> {
        settings.validate(config.direction)?;
        let inbox = device.mailboxes().register(config.direction)?;
        let id = Uuid::new_v4();
        info!(
            "{} instance {} attached to {} channel {}",
            config.direction,
            id,
            device.path(),
            config.channel
        );
        Ok(Self {
            id,
            engine: ApplyEngine::new(Arc::clone(&device), config.direction, config.channel),
            device,
            settings: Mutex::new(settings),
            factory,
            run: Mutex::new(RunState::default()),
            stats: Mutex::new(Arc::new(WorkerStats::default())),
            recorder: Arc::new(Mutex::new(None)),
            inbox: Mutex::new(inbox),
            reports: Mutex::new(None),
            config,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.config.direction
    }

    pub fn channel(&self) -> Channel {
        self.config.channel
    }

    pub fn device(&self) -> &Arc<PhysicalDevice> {
        &self.device
    }

    /// Current desired settings.
    pub fn settings(&self) -> ConfigurationSnapshot {
        lock(&self.settings).clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.run)
            .thread
            .as_ref()
            .is_some_and(|t| t.is_running())
    }

    /// Receive this instance's reports. A new subscription replaces the old.
    pub fn subscribe_reports(&self) -> mpsc::UnboundedReceiver<Report> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.reports) = Some(tx);
        rx
    }

    fn report(&self, report: Report) {
        if let Some(tx) = lock(&self.reports).as_ref() {
            let _ = tx.send(report);
        }
    }

    /// Submit settings. Applied now if this instance holds its channel,
    /// otherwise stored and applied on `start`. Returns the apply report when
    /// hardware was touched.
    pub fn configure(
        &self,
        snapshot: ConfigurationSnapshot,
        force: bool,
    ) -> Result<Option<ApplyReport>, InstanceError> {
        snapshot.validate(self.direction())?;
        let holding = lock(&self.run).lease.is_some();
        if !holding {
            debug!("{} not started, settings deferred", self.direction());
            *lock(&self.settings) = snapshot;
            return Ok(None);
        }

        let report = self.engine.apply(&snapshot, force)?;
        *lock(&self.settings) = snapshot;
        Ok(Some(report))
    }

    /// Claim the channel, force-apply the current settings and start
    /// streaming.
    pub fn start(&self) -> Result<(), InstanceError> {
        let mut run = lock(&self.run);
        if run.thread.as_ref().is_some_and(|t| t.is_running()) {
            return Ok(());
        }
        let direction = self.direction();

        // a thread that stopped on its own leaves the lease with us
        let fresh = match run.lease {
            Some(_) => None,
            None => Some(self.device.acquire_channel(direction, self.channel())?),
        };
        if let Some(stale) = run.thread.take() {
            stale.stop_work();
            run.host_fifo = None;
        }
        self.engine.apply(&self.settings(), true)?;

        let _reconfigure = self.device.reconfigure_guard();
        let rate = self.device.state().rate(direction);
        let size = fifo_size(rate, self.config.fifo_seconds);
        let (fifo, host) = sample_fifo(direction, size);
        let stats = Arc::new(WorkerStats::default());
        let thread = self.factory.create(WorkerContext {
            device: Arc::clone(&self.device),
            direction,
            channel: self.channel(),
            sample_rate: rate,
            fifo,
            fifo_size: size,
            stats: Arc::clone(&stats),
            recorder: Arc::clone(&self.recorder),
        });
        thread.set_device_sample_rate(rate);
        self.device.threads().set(direction, Some(Arc::clone(&thread)));
        if let Err(e) = thread.start_work() {
            self.device.threads().set(direction, None);
            return Err(e.into());
        }

        if let Some(lease) = fresh {
            run.lease = Some(lease);
        }
        run.thread = Some(thread);
        run.host_fifo = Some(host);
        *lock(&self.stats) = stats;
        info!(
            "{} instance started on {} channel {} @ {} S/s (fifo {})",
            direction,
            self.device.path(),
            self.channel(),
            rate,
            size
        );
        self.report(Report::StartStop { running: true });
        Ok(())
    }

    /// Stop streaming and release the channel. Stopping a stopped instance
    /// is a no-op.
    pub fn stop(&self) {
        let mut run = lock(&self.run);
        let Some(lease) = run.lease.take() else {
            return;
        };
        {
            let _reconfigure = self.device.reconfigure_guard();
            self.device.threads().take(self.direction());
            if let Some(thread) = run.thread.take() {
                thread.stop_work();
            }
            // a suspend left behind by a failed apply must not outlive us
            self.device.state().take_suspended(self.direction());
        }
        run.host_fifo = None;
        drop(run);

        if let Err(e) = self.set_recording(false) {
            warn!("failed to finalize recording: {}", e);
        }
        lease.release();
        info!("{} instance stopped", self.direction());
        self.report(Report::StartStop { running: false });
    }

    /// Host end of the sample FIFO, once per start.
    pub fn take_sample_fifo(&self) -> Option<HostFifo> {
        lock(&self.run).host_fifo.take()
    }

    /// FIFO and link status.
    pub fn stream_info(&self) -> StreamInfo {
        let direction = self.direction();
        let stats = lock(&self.stats).snapshot();
        let status = self.device.with_handle(|h| h.stream_status(direction));
        let info = StreamInfo {
            success: status.is_ok(),
            active: self.is_running(),
            fifo_filled: stats.fifo_filled,
            fifo_size: stats.fifo_size,
            underrun: stats.underruns,
            overrun: stats.overruns,
            dropped_packets: status.as_ref().map_or(0, |s| s.dropped_packets),
            sample_rate: self.device.state().rate(direction),
            link_rate: status.as_ref().map_or(0.0, |s| s.link_rate),
            timestamp: status.as_ref().map_or(0, |s| s.timestamp),
        };
        self.report(Report::StreamInfo { info });
        info
    }

    /// Read the die temperature and share it with the buddy.
    pub fn device_info(&self) -> Result<f32, InstanceError> {
        let temperature = self.device.with_handle(|h| h.temperature())?;
        self.report(Report::DeviceInfo { temperature });
        self.device
            .mailboxes()
            .notify_buddy(self.direction(), BuddyNotification::DeviceInfo { temperature });
        Ok(temperature)
    }

    /// Start or finish recording received IQ. Returns the file path.
    pub fn set_recording(&self, enable: bool) -> Result<Option<PathBuf>, InstanceError> {
        if self.direction() != Direction::Rx {
            return if enable {
                Err(InstanceError::RecordingUnsupported)
            } else {
                Ok(None)
            };
        }
        let mut recorder = lock(&self.recorder);
        match (enable, recorder.take()) {
            (true, Some(active)) => {
                let path = active.path().to_path_buf();
                *recorder = Some(active);
                Ok(Some(path))
            }
            (true, None) => {
                let rate = self.device.state().rate(Direction::Rx);
                let rec = IqRecorder::create(&self.config.record_dir, self.id, rate)?;
                let path = rec.path().to_path_buf();
                *recorder = Some(rec);
                Ok(Some(path))
            }
            (false, Some(active)) => Ok(Some(active.finalize()?)),
            (false, None) => Ok(None),
        }
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.recorder).is_some()
    }

    /// Fold queued buddy notifications into the settings mirror and forward
    /// them as reports. Returns how many were handled.
    pub fn process_notifications(&self) -> usize {
        let mut handled = 0;
        let mut inbox = lock(&self.inbox);
        while let Ok(notification) = inbox.try_recv() {
            self.adopt(&notification);
            self.report(Report::Buddy { notification });
            handled += 1;
        }
        handled
    }

    fn adopt(&self, notification: &BuddyNotification) {
        self.engine.adopt(notification);
        let mut settings = lock(&self.settings);
        match *notification {
            BuddyNotification::RateChanged {
                dev_sample_rate,
                log2_hard_decim,
                origin,
                ..
            } => {
                debug!(
                    "{} adopting rate {} hard 2^{} from {}",
                    self.direction(),
                    dev_sample_rate,
                    log2_hard_decim,
                    origin
                );
                settings.dev_sample_rate = dev_sample_rate;
                settings.log2_hard_decim = log2_hard_decim;
            }
            BuddyNotification::ClockSourceChanged {
                ext_clock,
                ext_clock_freq,
            } => {
                settings.ext_clock = ext_clock;
                settings.ext_clock_freq = ext_clock_freq;
            }
            BuddyNotification::DeviceInfo { .. } => {}
        }
    }

    /// Versioned settings blob.
    pub fn serialize(&self) -> Result<String, InstanceError> {
        let blob = SettingsBlob {
            version: SETTINGS_BLOB_VERSION,
            settings: self.settings(),
        };
        Ok(serde_json::to_string(&blob)?)
    }

    /// Restore a blob written by `serialize` and force-apply it.
    pub fn deserialize(&self, data: &str) -> Result<Option<ApplyReport>, InstanceError> {
        let blob: SettingsBlob = serde_json::from_str(data)?;
        if blob.version != SETTINGS_BLOB_VERSION {
            return Err(InstanceError::UnsupportedVersion(blob.version));
        }
        self.configure(blob.settings, true)
    }
}

impl Drop for DeviceInstance {
    fn drop(&mut self) {
        self.stop();
        self.device.mailboxes().unregister(self.direction());
        debug!("{} instance {} detached", self.direction(), self.id);
    }
}
