//! Configuration apply engine
//!
//! One engine per instance. An apply diffs the submitted snapshot against the
//! engine's last-applied mirror (local fields) and against the committed
//! shared state (global fields), suspends whichever threads the change
//! disturbs, issues the minimal hardware calls, commits the shared state once
//! every call succeeded, resumes, then tells the buddy.
//!
//! Whole applies are serialized per radio by the device's reconfigure lock,
//! so a second buddy re-diffs against whatever the first one committed. The
//! shared-state lock itself is only taken for in-memory updates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::device::PhysicalDevice;
use crate::notify::BuddyNotification;
use crate::sdk::{FilterKind, RadioHandle, SdkError};
use crate::settings::{Channel, ConfigurationSnapshot, Direction, GainMode, GainStage, SettingsError};
use crate::shared::{GlobalSettings, SharedDeviceState};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApplyError {
    #[error("{step} failed: {source}")]
    HardwareApply {
        step: &'static str,
        #[source]
        source: SdkError,
    },

    #[error("an apply is already in progress on this instance")]
    Busy,

    #[error("{direction} thread failed to resume: {message}")]
    ResumeFailed { direction: Direction, message: String },

    #[error(transparent)]
    InvalidSettings(#[from] SettingsError),
}

/// Shared-state updates held back until the hardware accepted the whole
/// apply.
#[derive(Debug, Default)]
struct PendingCommit {
    master_rate: Option<f64>,
    center_frequency: Option<u64>,
    nco_frequency: Option<i64>,
}

/// States an apply passed through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApplyPhase {
    Diffing,
    NoOp,
    GlobalChange,
    LocalChange,
    SuspendBuddy,
    HardwareUpdate,
    UpdateSharedState,
    ResumeBuddy,
    NotifyBuddy,
}

/// What one apply did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    pub phases: Vec<ApplyPhase>,
    pub hardware_calls: usize,
    pub rate_changed: bool,
    pub clock_changed: bool,
    /// Threads stopped and restarted around the change
    pub suspended: Vec<Direction>,
}

/// Field groups that differ between the current and the requested settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsDiff {
    // global
    pub dev_sample_rate: bool,
    pub log2_hard_decim: bool,
    pub clock: bool,
    // local
    pub log2_soft_decim: bool,
    pub center_frequency: bool,
    pub nco: bool,
    pub lpf_bandwidth: bool,
    pub lpf_fir: bool,
    pub gain_mode: bool,
    pub gain: bool,
    pub lna_gain: bool,
    pub tia_gain: bool,
    pub pga_gain: bool,
    pub antenna: bool,
    pub power_mode: bool,
    /// Host-side processing flags, stored only
    pub host_flags: bool,
}

impl SettingsDiff {
    /// Every field counts as changed.
    pub fn all() -> Self {
        Self {
            dev_sample_rate: true,
            log2_hard_decim: true,
            clock: true,
            log2_soft_decim: true,
            center_frequency: true,
            nco: true,
            lpf_bandwidth: true,
            lpf_fir: true,
            gain_mode: true,
            gain: true,
            lna_gain: true,
            tia_gain: true,
            pga_gain: true,
            antenna: true,
            power_mode: true,
            host_flags: true,
        }
    }

    /// Global fields are compared with the committed device state, local
    /// fields with this instance's last-applied settings.
    pub fn between(
        applied: Option<&ConfigurationSnapshot>,
        next: &ConfigurationSnapshot,
        committed: &SharedDeviceState,
        force: bool,
    ) -> Self {
        let Some(prev) = applied.filter(|_| !force) else {
            return Self::all();
        };
        let globals = &committed.globals;
        Self {
            dev_sample_rate: globals.dev_sample_rate != next.dev_sample_rate,
            log2_hard_decim: globals.log2_hard_decim != next.log2_hard_decim,
            clock: globals.ext_clock != next.ext_clock
                || globals.ext_clock_freq != next.ext_clock_freq,
            log2_soft_decim: prev.log2_soft_decim != next.log2_soft_decim,
            center_frequency: prev.center_frequency != next.center_frequency,
            nco: prev.nco_enable != next.nco_enable
                || (next.nco_enable && prev.nco_frequency != next.nco_frequency),
            lpf_bandwidth: prev.lpf_bandwidth != next.lpf_bandwidth,
            lpf_fir: prev.lpf_fir_enable != next.lpf_fir_enable
                || (next.lpf_fir_enable && prev.lpf_fir_bandwidth != next.lpf_fir_bandwidth),
            gain_mode: prev.gain_mode != next.gain_mode,
            gain: prev.gain != next.gain,
            lna_gain: prev.lna_gain != next.lna_gain,
            tia_gain: prev.tia_gain != next.tia_gain,
            pga_gain: prev.pga_gain != next.pga_gain,
            antenna: prev.antenna != next.antenna,
            power_mode: prev.power_mode != next.power_mode,
            host_flags: prev.dc_block != next.dc_block
                || prev.iq_correction != next.iq_correction
                || prev.nco_frequency != next.nco_frequency
                || prev.lpf_fir_bandwidth != next.lpf_fir_bandwidth,
        }
    }

    pub fn rate(&self) -> bool {
        self.dev_sample_rate || self.log2_hard_decim
    }

    pub fn global(&self) -> bool {
        self.rate() || self.clock
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Applies settings for one (direction, channel) on a shared radio.
#[derive(Debug)]
pub struct ApplyEngine {
    direction: Direction,
    channel: Channel,
    device: Arc<PhysicalDevice>,
    applied: Mutex<Option<ConfigurationSnapshot>>,
    busy: AtomicBool,
}

impl ApplyEngine {
    pub fn new(device: Arc<PhysicalDevice>, direction: Direction, channel: Channel) -> Self {
        Self {
            direction,
            channel,
            device,
            applied: Mutex::new(None),
            busy: AtomicBool::new(false),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Settings as last successfully applied.
    pub fn applied(&self) -> Option<ConfigurationSnapshot> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the mirror so the next apply treats every field as changed.
    pub fn invalidate(&self) {
        *self.applied.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Fold a buddy's global change into the mirror. Never touches hardware.
    pub fn adopt(&self, notification: &BuddyNotification) {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mirror) = applied.as_mut() else {
            return;
        };
        match *notification {
            BuddyNotification::RateChanged {
                dev_sample_rate,
                log2_hard_decim,
                ..
            } => {
                mirror.dev_sample_rate = dev_sample_rate;
                mirror.log2_hard_decim = log2_hard_decim;
            }
            BuddyNotification::ClockSourceChanged {
                ext_clock,
                ext_clock_freq,
            } => {
                mirror.ext_clock = ext_clock;
                mirror.ext_clock_freq = ext_clock_freq;
            }
            BuddyNotification::DeviceInfo { .. } => {}
        }
    }

    /// Apply `snapshot`. With `force`, every field is treated as changed.
    ///
    /// On failure the shared state keeps its last committed values and the
    /// mirror is left as it was; suspended threads are resumed either way.
    pub fn apply(
        &self,
        snapshot: &ConfigurationSnapshot,
        force: bool,
    ) -> Result<ApplyReport, ApplyError> {
        snapshot.validate(self.direction)?;
        let _busy = BusyGuard::try_acquire(&self.busy).ok_or(ApplyError::Busy)?;
        let _reconfigure = self.device.reconfigure_guard();

        let mut report = ApplyReport {
            phases: vec![ApplyPhase::Diffing],
            ..Default::default()
        };
        let committed = self.device.state().read();
        let diff = SettingsDiff::between(self.applied().as_ref(), snapshot, &committed, force);
        debug!("{} apply diff (force {}): {:?}", self.direction, force, diff);

        if diff.is_empty() {
            report.phases.push(ApplyPhase::NoOp);
            return Ok(report);
        }
        report.phases.push(if diff.global() {
            ApplyPhase::GlobalChange
        } else {
            ApplyPhase::LocalChange
        });

        let suspended = self.suspend(&diff, &mut report);
        let outcome = self
            .update(snapshot, &diff, &mut report)
            .map(|pending| self.commit(snapshot, &diff, pending, &mut report));
        let resumed = self.resume(&suspended, &mut report);

        outcome?;
        *self.applied.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        self.notify(snapshot, &diff, &mut report);
        resumed?;
        Ok(report)
    }

    /// Stop every running thread a global change disturbs, or just our own
    /// when only soft decimation moved.
    fn suspend(&self, diff: &SettingsDiff, report: &mut ApplyReport) -> Vec<Direction> {
        let running = self.device.threads().running();
        let targets: Vec<_> = if diff.global() {
            running
        } else if diff.log2_soft_decim {
            running
                .into_iter()
                .filter(|(d, _)| *d == self.direction)
                .collect()
        } else {
            Vec::new()
        };
        if targets.is_empty() {
            return Vec::new();
        }

        report.phases.push(ApplyPhase::SuspendBuddy);
        targets
            .into_iter()
            .map(|(dir, thread)| {
                thread.stop_work();
                self.device.state().mark_suspended(dir);
                debug!("{} apply: suspended {} thread", self.direction, dir);
                dir
            })
            .collect()
    }

    /// Restart suspended threads at their current derived rate.
    fn resume(&self, suspended: &[Direction], report: &mut ApplyReport) -> Result<(), ApplyError> {
        if suspended.is_empty() {
            return Ok(());
        }
        report.phases.push(ApplyPhase::ResumeBuddy);
        report.suspended = suspended.to_vec();

        let mut first_failure = None;
        for &dir in suspended {
            if !self.device.state().take_suspended(dir) {
                continue;
            }
            let Some(thread) = self.device.threads().get(dir) else {
                warn!("{} thread vanished while suspended", dir);
                continue;
            };
            thread.set_device_sample_rate(self.device.state().rate(dir));
            if let Err(e) = thread.start_work() {
                warn!("{} apply: {} thread failed to resume: {}", self.direction, dir, e);
                first_failure.get_or_insert(ApplyError::ResumeFailed {
                    direction: dir,
                    message: e.to_string(),
                });
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Issue every hardware call the diff needs. Nothing reaches the shared
    /// state until all of them succeed.
    fn update(
        &self,
        s: &ConfigurationSnapshot,
        diff: &SettingsDiff,
        report: &mut ApplyReport,
    ) -> Result<PendingCommit, ApplyError> {
        let dir = self.direction;
        let ch = self.channel;
        let mut pending = PendingCommit::default();
        report.phases.push(ApplyPhase::HardwareUpdate);

        if diff.global() {
            if diff.clock {
                self.call(report, "set_reference_clock", |h| {
                    h.set_reference_clock(s.ext_clock, s.ext_clock_freq)
                })?;
            }
            let master = self.call(report, "set_sample_rate", |h| {
                h.set_sample_rate(s.dev_sample_rate, s.master_rate(), dir)
            })?;
            pending.master_rate = Some(master);
        }

        if diff.center_frequency {
            let actual = self.call(report, "tune", |h| h.tune(dir, s.center_frequency))?;
            pending.center_frequency = Some(actual);
        }
        if diff.nco || (diff.rate() && s.nco_enable) {
            let offset = if s.nco_enable { s.nco_frequency } else { 0 };
            self.call(report, "tune_nco", |h| h.tune_nco(dir, ch, offset))?;
            pending.nco_frequency = Some(offset);
        }
        if diff.lpf_bandwidth {
            self.call(report, "set_filter_bandwidth", |h| {
                h.set_filter_bandwidth(dir, ch, FilterKind::Analog, s.lpf_bandwidth)
            })?;
        }
        if diff.lpf_fir {
            let bw = if s.lpf_fir_enable { s.lpf_fir_bandwidth } else { 0.0 };
            self.call(report, "set_filter_bandwidth", |h| {
                h.set_filter_bandwidth(dir, ch, FilterKind::Digital, bw)
            })?;
        }
        self.apply_gain(s, diff, report)?;
        if diff.antenna {
            self.call(report, "set_antenna", |h| h.set_antenna(dir, s.antenna))?;
        }
        if diff.power_mode {
            self.call(report, "set_power_mode", |h| h.set_power_mode(s.power_mode))?;
        }
        Ok(pending)
    }

    fn commit(
        &self,
        s: &ConfigurationSnapshot,
        diff: &SettingsDiff,
        pending: PendingCommit,
        report: &mut ApplyReport,
    ) {
        let dir = self.direction;
        let state = self.device.state();
        if let Some(master) = pending.master_rate {
            report.phases.push(ApplyPhase::UpdateSharedState);
            state.compare_and_update_global(GlobalSettings::from_snapshot(s), master);
            report.rate_changed = diff.rate();
            report.clock_changed = diff.clock;
            info!(
                "{} committed device rate {} (hard 2^{}, master {}, ext clock {})",
                dir, s.dev_sample_rate, s.log2_hard_decim, master, s.ext_clock
            );
        }
        if diff.log2_soft_decim {
            state.set_soft_decim(dir, s.log2_soft_decim);
        }
        if let Some(frequency) = pending.center_frequency {
            state.set_center_frequency(dir, frequency);
        }
        if let Some(offset) = pending.nco_frequency {
            state.set_nco_frequency(dir, offset);
        }
    }

    fn apply_gain(
        &self,
        s: &ConfigurationSnapshot,
        diff: &SettingsDiff,
        report: &mut ApplyReport,
    ) -> Result<(), ApplyError> {
        let stages: Vec<(GainStage, u32)> = match s.gain_mode {
            GainMode::Auto if diff.gain_mode || diff.gain => vec![(GainStage::Auto, s.gain)],
            GainMode::Auto => Vec::new(),
            GainMode::Manual => [
                (GainStage::Lna, s.lna_gain, diff.lna_gain),
                (GainStage::Tia, s.tia_gain, diff.tia_gain),
                (GainStage::Pga, s.pga_gain, diff.pga_gain),
            ]
            .into_iter()
            .filter(|&(_, _, changed)| changed || diff.gain_mode)
            .map(|(stage, value, _)| (stage, value))
            .collect(),
        };
        for (stage, value) in stages {
            let db = f64::from(stage.clamp(value));
            self.call(report, "set_gain", |h| {
                h.set_gain(self.direction, self.channel, stage, db)
            })?;
        }
        Ok(())
    }

    fn call<T>(
        &self,
        report: &mut ApplyReport,
        step: &'static str,
        f: impl FnOnce(&mut dyn RadioHandle) -> Result<T, SdkError>,
    ) -> Result<T, ApplyError> {
        report.hardware_calls += 1;
        debug!("{} apply: {}", self.direction, step);
        self.device
            .with_handle(f)
            .map_err(|source| ApplyError::HardwareApply { step, source })
    }

    fn notify(&self, s: &ConfigurationSnapshot, diff: &SettingsDiff, report: &mut ApplyReport) {
        if !diff.global() {
            return;
        }
        report.phases.push(ApplyPhase::NotifyBuddy);
        let mailboxes = self.device.mailboxes();
        if diff.rate() {
            mailboxes.notify_buddy(
                self.direction,
                BuddyNotification::RateChanged {
                    dev_sample_rate: s.dev_sample_rate,
                    log2_hard_decim: s.log2_hard_decim,
                    center_frequency: s.center_frequency,
                    origin: self.direction,
                },
            );
        }
        if diff.clock {
            mailboxes.notify_buddy(
                self.direction,
                BuddyNotification::ClockSourceChanged {
                    ext_clock: s.ext_clock,
                    ext_clock_freq: s.ext_clock_freq,
                },
            );
        }
    }
}
