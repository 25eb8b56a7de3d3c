//! In-memory radio
//!
//! `SimulatedSdk` behaves like a two-channel transceiver without touching any
//! hardware. Every configuration call is appended to a shared call log, and
//! any call kind can be made to fail once. The daemon uses it when no
//! hardware binding is linked; the tests use it everywhere.

use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use portable_atomic::AtomicF32;
use tracing::debug;

use crate::sdk::{
    DiscoveredDevice, FilterKind, HardwareStreamStatus, IqSample, RadioHandle, RadioSdk, SdkError,
};
use crate::settings::{AntennaPath, Channel, Direction, GainStage};

/// Offset of the generated test tone from the center frequency (Hz).
const TONE_OFFSET_HZ: f64 = 100_000.0;
const TONE_AMPLITUDE: f64 = 8_000.0;

/// A configuration call the simulated radio received.
#[derive(Debug, Clone, PartialEq)]
pub enum SdkCall {
    SetSampleRate { rate: f64, master: f64, direction: Direction },
    SetReferenceClock { external: bool, frequency: u32 },
    Tune { direction: Direction, frequency: u64 },
    TuneNco { direction: Direction, channel: Channel, offset: i64 },
    SetGain { direction: Direction, channel: Channel, stage: GainStage, db: f64 },
    SetAntenna { direction: Direction, antenna: AntennaPath },
    SetFilterBandwidth { direction: Direction, channel: Channel, kind: FilterKind, hz: f64 },
    SetPowerMode(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdkCallKind {
    SetSampleRate,
    SetReferenceClock,
    Tune,
    TuneNco,
    SetGain,
    SetAntenna,
    SetFilterBandwidth,
    SetPowerMode,
    Temperature,
}

impl SdkCallKind {
    pub fn name(self) -> &'static str {
        match self {
            SdkCallKind::SetSampleRate => "set_sample_rate",
            SdkCallKind::SetReferenceClock => "set_reference_clock",
            SdkCallKind::Tune => "tune",
            SdkCallKind::TuneNco => "tune_nco",
            SdkCallKind::SetGain => "set_gain",
            SdkCallKind::SetAntenna => "set_antenna",
            SdkCallKind::SetFilterBandwidth => "set_filter_bandwidth",
            SdkCallKind::SetPowerMode => "set_power_mode",
            SdkCallKind::Temperature => "temperature",
        }
    }
}

impl SdkCall {
    pub fn kind(&self) -> SdkCallKind {
        match self {
            SdkCall::SetSampleRate { .. } => SdkCallKind::SetSampleRate,
            SdkCall::SetReferenceClock { .. } => SdkCallKind::SetReferenceClock,
            SdkCall::Tune { .. } => SdkCallKind::Tune,
            SdkCall::TuneNco { .. } => SdkCallKind::TuneNco,
            SdkCall::SetGain { .. } => SdkCallKind::SetGain,
            SdkCall::SetAntenna { .. } => SdkCallKind::SetAntenna,
            SdkCall::SetFilterBandwidth { .. } => SdkCallKind::SetFilterBandwidth,
            SdkCall::SetPowerMode(_) => SdkCallKind::SetPowerMode,
        }
    }
}

#[derive(Debug)]
struct SimShared {
    calls: Mutex<Vec<SdkCall>>,
    failures: Mutex<Vec<SdkCallKind>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    temperature: AtomicF32,
}

impl SimShared {
    fn calls(&self) -> MutexGuard<'_, Vec<SdkCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log `call` and fail it if a failure was armed for its kind.
    fn record(&self, call: SdkCall) -> Result<(), SdkError> {
        let kind = call.kind();
        self.calls().push(call);
        self.check(kind)
    }

    fn check(&self, kind: SdkCallKind) -> Result<(), SdkError> {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = failures.iter().position(|k| *k == kind) {
            failures.remove(pos);
            return Err(SdkError::Call {
                call: kind.name(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Simulated SDK with a fixed device list.
#[derive(Debug)]
pub struct SimulatedSdk {
    devices: Vec<DiscoveredDevice>,
    shared: Arc<SimShared>,
}

impl SimulatedSdk {
    /// One two-channel radio at `path`.
    pub fn single(path: &str) -> Self {
        Self::with_devices(vec![(path, 2)])
    }

    pub fn with_devices(devices: Vec<(&str, usize)>) -> Self {
        let devices = devices
            .into_iter()
            .enumerate()
            .map(|(i, (path, channel_count))| DiscoveredDevice {
                path: path.to_string(),
                uniqname: format!("SIM{:04}", i),
                channel_count,
            })
            .collect();
        Self {
            devices,
            shared: Arc::new(SimShared {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                temperature: AtomicF32::new(42.5),
            }),
        }
    }

    /// Configuration calls received so far, across all handles.
    pub fn calls(&self) -> Vec<SdkCall> {
        self.shared.calls().clone()
    }

    pub fn clear_calls(&self) {
        self.shared.calls().clear();
    }

    /// Make the next call of `kind` fail.
    pub fn fail_once(&self, kind: SdkCallKind) {
        self.shared
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(kind);
    }

    pub fn set_temperature(&self, celsius: f32) {
        self.shared.temperature.store(celsius, Ordering::Relaxed);
    }

    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }
}

impl RadioSdk for SimulatedSdk {
    fn discover(&self) -> Vec<DiscoveredDevice> {
        self.devices.clone()
    }

    fn open(&self, path: &str) -> Result<Box<dyn RadioHandle>, SdkError> {
        let device = self
            .devices
            .iter()
            .find(|d| d.path == path)
            .ok_or_else(|| SdkError::NoDevice(path.to_string()))?;
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        debug!("sim: opened {}", path);
        Ok(Box::new(SimulatedRadio {
            channel_count: device.channel_count,
            shared: Arc::clone(&self.shared),
            rate: [0.0; 2],
            timestamp: [0; 2],
            phase: HashMap::new(),
            open: true,
        }))
    }
}

/// Handle returned by `SimulatedSdk::open`.
pub struct SimulatedRadio {
    channel_count: usize,
    shared: Arc<SimShared>,
    rate: [f64; 2],
    timestamp: [u64; 2],
    phase: HashMap<Channel, f64>,
    open: bool,
}

impl SimulatedRadio {
    fn ensure_open(&self) -> Result<(), SdkError> {
        if self.open {
            Ok(())
        } else {
            Err(SdkError::Closed)
        }
    }
}

impl RadioHandle for SimulatedRadio {
    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn close(&mut self) {
        if std::mem::take(&mut self.open) {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
            debug!("sim: closed");
        }
    }

    fn set_sample_rate(
        &mut self,
        rate: f64,
        master: f64,
        direction: Direction,
    ) -> Result<f64, SdkError> {
        self.ensure_open()?;
        self.shared.record(SdkCall::SetSampleRate {
            rate,
            master,
            direction,
        })?;
        self.rate = [rate; 2];
        Ok(if master > 0.0 { master } else { rate })
    }

    fn set_reference_clock(&mut self, external: bool, frequency: u32) -> Result<(), SdkError> {
        self.ensure_open()?;
        self.shared.record(SdkCall::SetReferenceClock {
            external,
            frequency,
        })
    }

    fn tune(&mut self, direction: Direction, frequency: u64) -> Result<u64, SdkError> {
        self.ensure_open()?;
        self.shared.record(SdkCall::Tune {
            direction,
            frequency,
        })?;
        Ok(frequency)
    }

    fn tune_nco(
        &mut self,
        direction: Direction,
        channel: Channel,
        offset: i64,
    ) -> Result<(), SdkError> {
        self.ensure_open()?;
        self.shared.record(SdkCall::TuneNco {
            direction,
            channel,
            offset,
        })
    }

    fn set_gain(
        &mut self,
        direction: Direction,
        channel: Channel,
        stage: GainStage,
        db: f64,
    ) -> Result<f64, SdkError> {
        self.ensure_open()?;
        self.shared.record(SdkCall::SetGain {
            direction,
            channel,
            stage,
            db,
        })?;
        let (lo, hi) = stage.range();
        Ok(db.clamp(f64::from(lo), f64::from(hi)))
    }

    fn set_antenna(&mut self, direction: Direction, antenna: AntennaPath) -> Result<(), SdkError> {
        self.ensure_open()?;
        self.shared.record(SdkCall::SetAntenna { direction, antenna })
    }

    fn set_filter_bandwidth(
        &mut self,
        direction: Direction,
        channel: Channel,
        kind: FilterKind,
        hz: f64,
    ) -> Result<f64, SdkError> {
        self.ensure_open()?;
        self.shared.record(SdkCall::SetFilterBandwidth {
            direction,
            channel,
            kind,
            hz,
        })?;
        Ok(hz)
    }

    fn set_power_mode(&mut self, mode: u32) -> Result<(), SdkError> {
        self.ensure_open()?;
        self.shared.record(SdkCall::SetPowerMode(mode))
    }

    fn temperature(&mut self) -> Result<f32, SdkError> {
        self.ensure_open()?;
        self.shared.check(SdkCallKind::Temperature)?;
        Ok(self.shared.temperature.load(Ordering::Relaxed))
    }

    fn stream_status(&mut self, direction: Direction) -> Result<HardwareStreamStatus, SdkError> {
        self.ensure_open()?;
        Ok(HardwareStreamStatus {
            dropped_packets: 0,
            // two i16 per sample
            link_rate: self.rate[direction.index()] * 4.0,
            timestamp: self.timestamp[direction.index()],
        })
    }

    fn read_samples(&mut self, channel: Channel, buf: &mut [IqSample]) -> Result<usize, SdkError> {
        self.ensure_open()?;
        let rate = self.rate[Direction::Rx.index()];
        let step = if rate > 0.0 { TAU * TONE_OFFSET_HZ / rate } else { 0.0 };
        let phase = self.phase.entry(channel).or_insert(0.0);
        for sample in buf.iter_mut() {
            *sample = IqSample {
                i: (phase.cos() * TONE_AMPLITUDE) as i16,
                q: (phase.sin() * TONE_AMPLITUDE) as i16,
            };
            *phase = (*phase + step) % TAU;
        }
        self.timestamp[Direction::Rx.index()] += buf.len() as u64;
        Ok(buf.len())
    }

    fn write_samples(&mut self, _channel: Channel, buf: &[IqSample]) -> Result<usize, SdkError> {
        self.ensure_open()?;
        self.timestamp[Direction::Tx.index()] += buf.len() as u64;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::discover_channels;

    #[test]
    fn test_discover_channels_names() {
        let sdk = SimulatedSdk::with_devices(vec![("sim://xtrx0", 2), ("sim://xtrx1", 2)]);
        let channels = discover_channels(&sdk);
        assert_eq!(channels.len(), 4);
        assert_eq!(channels[0].display_name, "XTRX[0:0] SIM0000");
        assert_eq!(channels[3].display_name, "XTRX[1:1] SIM0001");
        assert_eq!(channels[3].channel, Channel::B);
        assert_eq!(channels[2].path, "sim://xtrx1");
    }

    #[test]
    fn test_fail_once() {
        let sdk = SimulatedSdk::single("sim://xtrx0");
        let mut handle = sdk.open("sim://xtrx0").unwrap();
        sdk.fail_once(SdkCallKind::Tune);

        assert!(handle.tune(Direction::Rx, 100).is_err());
        assert_eq!(handle.tune(Direction::Rx, 100), Ok(100));
        assert_eq!(sdk.calls().len(), 2);
    }

    #[test]
    fn test_sample_rate_and_status() {
        let sdk = SimulatedSdk::single("sim://xtrx0");
        let mut handle = sdk.open("sim://xtrx0").unwrap();
        let master = handle
            .set_sample_rate(10e6, 20e6, Direction::Rx)
            .unwrap();
        assert_eq!(master, 20e6);

        let mut buf = vec![IqSample::default(); 256];
        assert_eq!(handle.read_samples(Channel::A, &mut buf).unwrap(), 256);
        assert!(buf.iter().any(|s| s.i != 0));

        let status = handle.stream_status(Direction::Rx).unwrap();
        assert_eq!(status.timestamp, 256);
        assert_eq!(status.link_rate, 40e6);
    }

    #[test]
    fn test_close_counts_once() {
        let sdk = SimulatedSdk::single("sim://xtrx0");
        let mut handle = sdk.open("sim://xtrx0").unwrap();
        handle.close();
        handle.close();
        assert_eq!(sdk.close_count(), 1);
        assert_eq!(handle.temperature(), Err(SdkError::Closed));
    }
}
