//! Buddy coordination scenarios: two instances on one simulated radio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use duet::{
    ApplyEngine, ApplyError, ApplyPhase, BuddyNotification, Channel, ChannelLease,
    ConfigurationSnapshot, DeviceInstance, Direction, GainMode, GainStage, InstanceConfig,
    LeaseError, PhysicalDevice, Report, SampleWorkerFactory, SdkCall, SdkCallKind, SimulatedSdk,
    StreamThread, StreamThreadError,
};
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Stop,
    Start,
    Rate(f64),
}

/// Records every call the engine makes.
#[derive(Default)]
struct MockThread {
    running: AtomicBool,
    fail_start: AtomicBool,
    events: Mutex<Vec<Event>>,
}

impl MockThread {
    fn running() -> Arc<Self> {
        let t = Self::default();
        t.running.store(true, Ordering::SeqCst);
        Arc::new(t)
    }

    fn stopped() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl StreamThread for MockThread {
    fn start_work(&self) -> Result<(), StreamThreadError> {
        self.events.lock().unwrap().push(Event::Start);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(StreamThreadError::Worker("device busy".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_work(&self) {
        self.events.lock().unwrap().push(Event::Stop);
        self.running.store(false, Ordering::SeqCst);
    }

    fn set_device_sample_rate(&self, rate: f64) {
        assert!(
            !self.running.load(Ordering::SeqCst),
            "rate pushed to a running thread"
        );
        self.events.lock().unwrap().push(Event::Rate(rate));
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct Rig {
    sdk: Arc<SimulatedSdk>,
    device: Arc<PhysicalDevice>,
    rx: ApplyEngine,
    tx: ApplyEngine,
    _leases: Vec<ChannelLease>,
}

impl Rig {
    /// RX on channel A and TX on channel B, both with defaults applied.
    fn new() -> Self {
        let sdk = Arc::new(SimulatedSdk::single("sim://xtrx0"));
        let device = Arc::new(PhysicalDevice::new("sim://xtrx0", sdk.clone()));
        let leases = vec![
            device.acquire_channel(Direction::Rx, Channel::A).unwrap(),
            device.acquire_channel(Direction::Tx, Channel::B).unwrap(),
        ];
        let rx = ApplyEngine::new(device.clone(), Direction::Rx, Channel::A);
        let tx = ApplyEngine::new(device.clone(), Direction::Tx, Channel::B);
        rx.apply(&rx_defaults(), false).unwrap();
        tx.apply(&tx_defaults(), false).unwrap();
        sdk.clear_calls();
        Self {
            sdk,
            device,
            rx,
            tx,
            _leases: leases,
        }
    }

    fn attach(&self, direction: Direction, thread: Arc<MockThread>) {
        self.device.threads().set(direction, Some(thread));
    }
}

fn rx_defaults() -> ConfigurationSnapshot {
    ConfigurationSnapshot::defaults_for(Direction::Rx)
}

fn tx_defaults() -> ConfigurationSnapshot {
    ConfigurationSnapshot::defaults_for(Direction::Tx)
}

#[test]
fn test_identical_snapshot_twice_makes_no_hardware_calls() {
    let rig = Rig::new();
    let mut snap = rx_defaults();
    snap.center_frequency = 2_400_000_000;
    snap.gain_mode = GainMode::Manual;
    snap.nco_enable = true;
    snap.nco_frequency = -125_000;

    rig.rx.apply(&snap, false).unwrap();
    rig.sdk.clear_calls();

    let report = rig.rx.apply(&snap, false).unwrap();
    assert_eq!(report.hardware_calls, 0);
    assert!(rig.sdk.calls().is_empty());
}

#[test]
fn test_scenario_running_originator_stopped_buddy() {
    let rig = Rig::new();
    let x = MockThread::running();
    let y = MockThread::stopped();
    rig.attach(Direction::Rx, x.clone());
    rig.attach(Direction::Tx, y.clone());
    let mut y_inbox = rig.device.mailboxes().register(Direction::Tx).unwrap();

    let mut snap = rx_defaults();
    snap.dev_sample_rate = 10_000_000.0;
    snap.log2_hard_decim = 1;
    let report = rig.rx.apply(&snap, true).unwrap();

    let state = rig.device.state().read();
    assert_eq!(state.master_rate, 20_000_000.0);
    assert!(state.rates_consistent());

    match y_inbox.try_recv().unwrap() {
        BuddyNotification::RateChanged {
            dev_sample_rate,
            log2_hard_decim,
            origin,
            ..
        } => {
            assert_eq!(dev_sample_rate, 10_000_000.0);
            assert_eq!(log2_hard_decim, 1);
            assert_eq!(origin, Direction::Rx);
        }
        other => panic!("expected RateChanged, got {:?}", other),
    }

    assert_eq!(
        x.events(),
        vec![Event::Stop, Event::Rate(10_000_000.0), Event::Start]
    );
    assert!(x.is_running());
    assert!(y.events().is_empty());
    assert_eq!(report.suspended, vec![Direction::Rx]);
    assert_eq!(
        report.phases,
        vec![
            ApplyPhase::Diffing,
            ApplyPhase::GlobalChange,
            ApplyPhase::SuspendBuddy,
            ApplyPhase::HardwareUpdate,
            ApplyPhase::UpdateSharedState,
            ApplyPhase::ResumeBuddy,
            ApplyPhase::NotifyBuddy,
        ]
    );
}

#[test]
fn test_running_buddy_cycles_once_and_gets_new_rate() {
    let rig = Rig::new();
    let buddy = MockThread::running();
    rig.attach(Direction::Tx, buddy.clone());

    let mut tx = tx_defaults();
    tx.log2_soft_decim = 1;
    rig.tx.apply(&tx, false).unwrap();
    assert_eq!(
        buddy.events(),
        vec![Event::Stop, Event::Rate(2_500_000.0), Event::Start]
    );
    buddy.events.lock().unwrap().clear();

    let mut rx = rx_defaults();
    rx.dev_sample_rate = 8_000_000.0;
    rx.log2_hard_decim = 2;
    rig.rx.apply(&rx, false).unwrap();

    let input_rate = rig.device.state().read().input_rate();
    assert_eq!(input_rate, 4_000_000.0);
    assert_eq!(
        buddy.events(),
        vec![Event::Stop, Event::Rate(input_rate), Event::Start]
    );
    let starts = buddy
        .events()
        .iter()
        .filter(|e| **e == Event::Start)
        .count();
    assert_eq!(starts, 1);
    assert!(buddy.is_running());
}

#[test]
fn test_soft_decimation_only_suspends_own_thread() {
    let rig = Rig::new();
    let own = MockThread::running();
    let buddy = MockThread::running();
    rig.attach(Direction::Rx, own.clone());
    rig.attach(Direction::Tx, buddy.clone());

    let mut snap = rx_defaults();
    snap.log2_soft_decim = 3;
    let report = rig.rx.apply(&snap, false).unwrap();

    assert_eq!(report.phases[1], ApplyPhase::LocalChange);
    assert_eq!(own.events(), vec![Event::Stop, Event::Rate(625_000.0), Event::Start]);
    assert!(buddy.events().is_empty());
    assert!(rig.sdk.calls().is_empty());
}

#[test]
fn test_rate_invariant_holds_over_decimation_ranges() {
    let rig = Rig::new();
    for hard in 0..=duet::settings::MAX_LOG2_HARD_DECIM {
        for soft in 0..=duet::settings::MAX_LOG2_SOFT_DECIM {
            let mut snap = rx_defaults();
            snap.dev_sample_rate = 3_840_000.0;
            snap.log2_hard_decim = hard;
            snap.log2_soft_decim = soft;
            rig.rx.apply(&snap, false).unwrap();

            let state = rig.device.state().read();
            assert!(state.rates_consistent(), "hard {} soft {}", hard, soft);
            let expected = state.master_rate
                / f64::from(1u32 << hard)
                / f64::from(1u32 << soft);
            assert_eq!(state.output_rate(), expected);
        }
    }
}

#[test]
fn test_manual_then_auto_gain_issues_only_auto_call() {
    let rig = Rig::new();
    let mut manual = rx_defaults();
    manual.gain_mode = GainMode::Manual;
    manual.lna_gain = 10;
    manual.tia_gain = 2;
    manual.pga_gain = 5;
    rig.rx.apply(&manual, false).unwrap();

    let gain_calls: Vec<_> = rig
        .sdk
        .calls()
        .into_iter()
        .filter(|c| c.kind() == SdkCallKind::SetGain)
        .collect();
    assert_eq!(gain_calls.len(), 3);
    rig.sdk.clear_calls();

    let mut auto = manual.clone();
    auto.gain_mode = GainMode::Auto;
    auto.gain = 15;
    rig.rx.apply(&auto, false).unwrap();

    assert_eq!(
        rig.sdk.calls(),
        vec![SdkCall::SetGain {
            direction: Direction::Rx,
            channel: Channel::A,
            stage: GainStage::Auto,
            db: 15.0,
        }]
    );
}

#[test]
fn test_hardware_failure_keeps_master_rate_and_resumes_buddy() {
    let rig = Rig::new();
    let buddy = MockThread::running();
    rig.attach(Direction::Tx, buddy.clone());
    let mut tx_inbox = rig.device.mailboxes().register(Direction::Tx).unwrap();
    let before = rig.device.state().read();

    let mut snap = rx_defaults();
    snap.dev_sample_rate = 12_000_000.0;
    rig.sdk.fail_once(SdkCallKind::SetSampleRate);
    let err = rig.rx.apply(&snap, false).unwrap_err();

    assert!(matches!(
        err,
        ApplyError::HardwareApply {
            step: "set_sample_rate",
            ..
        }
    ));
    let after = rig.device.state().read();
    assert_eq!(after.master_rate, before.master_rate);
    assert_eq!(after.globals, before.globals);
    assert!(!after.tx.thread_was_running);

    assert!(buddy.is_running());
    assert_eq!(
        buddy.events(),
        vec![Event::Stop, Event::Rate(before.input_rate()), Event::Start]
    );
    assert!(tx_inbox.try_recv().is_err());

    // the failed change is retried in full next time
    rig.sdk.clear_calls();
    rig.rx.apply(&snap, false).unwrap();
    assert!(rig
        .sdk
        .calls()
        .iter()
        .any(|c| c.kind() == SdkCallKind::SetSampleRate));
}

#[test]
fn test_local_failure_after_rate_change_commits_nothing() {
    let rig = Rig::new();
    let buddy = MockThread::running();
    rig.attach(Direction::Tx, buddy.clone());
    let mut tx_inbox = rig.device.mailboxes().register(Direction::Tx).unwrap();
    let before = rig.device.state().read();

    let mut snap = rx_defaults();
    snap.dev_sample_rate = 12_000_000.0;
    snap.center_frequency = 2_400_000_000;
    rig.sdk.fail_once(SdkCallKind::Tune);
    let err = rig.rx.apply(&snap, false).unwrap_err();

    assert!(matches!(err, ApplyError::HardwareApply { step: "tune", .. }));
    let after = rig.device.state().read();
    assert_eq!(after.master_rate, before.master_rate);
    assert_eq!(after.globals, before.globals);
    assert_eq!(after.rx.center_frequency, before.rx.center_frequency);
    assert!(after.rates_consistent());

    // resumed at the rate it had before
    assert_eq!(
        buddy.events(),
        vec![Event::Stop, Event::Rate(before.input_rate()), Event::Start]
    );
    assert!(tx_inbox.try_recv().is_err());

    rig.rx.apply(&snap, false).unwrap();
    assert_eq!(rig.device.state().read().master_rate, 24_000_000.0);
    assert!(matches!(
        tx_inbox.try_recv().unwrap(),
        BuddyNotification::RateChanged { .. }
    ));
}

#[test]
fn test_failed_resume_is_reported() {
    let rig = Rig::new();
    let buddy = MockThread::running();
    buddy.fail_start.store(true, Ordering::SeqCst);
    rig.attach(Direction::Tx, buddy.clone());
    let mut tx_inbox = rig.device.mailboxes().register(Direction::Tx).unwrap();

    let mut snap = rx_defaults();
    snap.dev_sample_rate = 6_000_000.0;
    let err = rig.rx.apply(&snap, false).unwrap_err();
    assert_eq!(
        err,
        ApplyError::ResumeFailed {
            direction: Direction::Tx,
            message: "worker failed: device busy".to_string(),
        }
    );
    // hardware change itself went through
    assert_eq!(rig.device.state().read().master_rate, 12_000_000.0);
    assert!(!rig.device.state().read().tx.thread_was_running);
    assert!(!buddy.is_running());
    // the committed rate still reaches the buddy
    assert!(matches!(
        tx_inbox.try_recv().unwrap(),
        BuddyNotification::RateChanged { .. }
    ));
}

#[test]
fn test_clock_change_programs_reference_before_rate() {
    let rig = Rig::new();
    let mut rx_inbox = rig.device.mailboxes().register(Direction::Rx).unwrap();

    let mut snap = tx_defaults();
    snap.ext_clock = true;
    snap.ext_clock_freq = 10_000_000;
    let report = rig.tx.apply(&snap, false).unwrap();
    assert!(report.clock_changed);
    assert!(!report.rate_changed);

    let kinds: Vec<_> = rig.sdk.calls().iter().map(|c| c.kind()).collect();
    assert_eq!(
        kinds,
        vec![SdkCallKind::SetReferenceClock, SdkCallKind::SetSampleRate]
    );
    assert_eq!(
        rx_inbox.try_recv().unwrap(),
        BuddyNotification::ClockSourceChanged {
            ext_clock: true,
            ext_clock_freq: 10_000_000
        }
    );
    assert!(rx_inbox.try_recv().is_err());
}

#[test]
fn test_concurrent_applies_rediff_against_committed_state() {
    let rig = Arc::new(Rig::new());
    let barrier = Arc::new(Barrier::new(2));

    let mut rx = rx_defaults();
    rx.dev_sample_rate = 10_000_000.0;
    let mut tx = tx_defaults();
    tx.dev_sample_rate = 10_000_000.0;

    std::thread::scope(|s| {
        let r = rig.clone();
        let b = barrier.clone();
        s.spawn(move || {
            b.wait();
            r.rx.apply(&rx, false).unwrap();
        });
        let r = rig.clone();
        let b = barrier.clone();
        s.spawn(move || {
            b.wait();
            r.tx.apply(&tx, false).unwrap();
        });
    });

    let rate_calls = rig
        .sdk
        .calls()
        .iter()
        .filter(|c| c.kind() == SdkCallKind::SetSampleRate)
        .count();
    assert_eq!(rate_calls, 1);
    let state = rig.device.state().read();
    assert_eq!(state.globals.dev_sample_rate, 10_000_000.0);
    assert!(state.rates_consistent());
}

#[test]
fn test_channel_exclusive_and_refcounted_close() {
    let sdk = Arc::new(SimulatedSdk::single("sim://xtrx0"));
    let device = Arc::new(PhysicalDevice::new("sim://xtrx0", sdk.clone()));

    let a = device.acquire_channel(Direction::Rx, Channel::A).unwrap();
    let err = assert_err!(device.acquire_channel(Direction::Tx, Channel::A));
    assert!(matches!(err, LeaseError::ChannelAlreadyAcquired { .. }));
    let b = device.acquire_channel(Direction::Tx, Channel::B).unwrap();

    drop(a);
    drop(b);
    device.release_channel(Direction::Rx);
    assert_eq!(sdk.open_count(), 1);
    assert_eq!(sdk.close_count(), 1);
}

fn instance(device: &Arc<PhysicalDevice>, direction: Direction, channel: Channel) -> DeviceInstance {
    DeviceInstance::new(
        device.clone(),
        InstanceConfig {
            direction,
            channel,
            fifo_seconds: 0.05,
            record_dir: std::env::temp_dir(),
        },
        ConfigurationSnapshot::defaults_for(direction),
        Arc::new(SampleWorkerFactory),
    )
    .unwrap()
}

#[tokio::test]
async fn test_instances_keep_buddy_mirror_truthful() {
    let sdk = Arc::new(SimulatedSdk::single("sim://xtrx0"));
    let device = Arc::new(PhysicalDevice::new("sim://xtrx0", sdk.clone()));
    let rx = instance(&device, Direction::Rx, Channel::A);
    let tx = instance(&device, Direction::Tx, Channel::B);
    let mut tx_reports = tx.subscribe_reports();

    assert_ok!(rx.start());
    assert_ok!(tx.start());
    assert!(rx.is_running());
    assert!(tx.is_running());

    let mut snap = rx.settings();
    snap.dev_sample_rate = 10_000_000.0;
    rx.configure(snap, false).unwrap();

    assert!(tx.process_notifications() >= 1);
    assert_eq!(tx.settings().dev_sample_rate, 10_000_000.0);
    assert!(tx.is_running());
    assert_eq!(tx.stream_info().sample_rate, 10_000_000.0);

    let mut saw_buddy = false;
    while let Ok(report) = tx_reports.try_recv() {
        if let Report::Buddy {
            notification: BuddyNotification::RateChanged { origin, .. },
        } = report
        {
            assert_eq!(origin, Direction::Rx);
            saw_buddy = true;
        }
    }
    assert!(saw_buddy);

    // tx adopted the rate, so resubmitting its own settings changes nothing
    sdk.clear_calls();
    let report = tx.configure(tx.settings(), false).unwrap().unwrap();
    assert_eq!(report.hardware_calls, 0);

    rx.stop();
    assert!(device.is_open());
    tx.stop();
    assert!(!device.is_open());
    assert_eq!(sdk.close_count(), 1);
}

#[tokio::test]
async fn test_device_info_reaches_buddy() {
    let sdk = Arc::new(SimulatedSdk::single("sim://xtrx0"));
    let device = Arc::new(PhysicalDevice::new("sim://xtrx0", sdk.clone()));
    let rx = instance(&device, Direction::Rx, Channel::A);
    let tx = instance(&device, Direction::Tx, Channel::B);
    let mut tx_reports = tx.subscribe_reports();

    rx.start().unwrap();
    sdk.set_temperature(38.0);
    assert_eq!(rx.device_info().unwrap(), 38.0);

    // forced start announced rate and clock, then the temperature
    assert_eq!(tx.process_notifications(), 3);
    let first = tx_reports.recv().await.unwrap();
    assert!(matches!(
        first,
        Report::Buddy {
            notification: BuddyNotification::RateChanged { .. }
        }
    ));
    let mut temperatures = Vec::new();
    while let Ok(report) = tx_reports.try_recv() {
        if let Report::Buddy {
            notification: BuddyNotification::DeviceInfo { temperature },
        } = report
        {
            temperatures.push(temperature);
        }
    }
    assert_eq!(temperatures, vec![38.0]);
    drop(tx);
    drop(rx);
    assert_eq!(sdk.close_count(), 1);
}
