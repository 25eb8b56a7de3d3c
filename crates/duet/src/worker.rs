//! Sample workers
//!
//! A `SampleWorker` moves IQ blocks between the radio and a lock-free SPSC
//! FIFO on its own named thread, paced to the host sample rate. The FIFO end
//! it owns travels into the thread on start and comes back out of `join` on
//! stop, so a worker can be suspended and resumed any number of times.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use portable_atomic::AtomicF64;
use tracing::{debug, error, info};

use crate::device::PhysicalDevice;
use crate::recorder::IqRecorder;
use crate::sdk::IqSample;
use crate::settings::{Channel, Direction};
use crate::thread::{StreamThread, StreamThreadError, WorkerStats, WorkerStatsSnapshot};

/// Smallest FIFO, in samples.
pub const MIN_FIFO_SAMPLES: usize = 48_000;

const TICK: Duration = Duration::from_millis(10);

/// Largest block moved per tick.
const MAX_BLOCK: usize = 1 << 16;

/// `max(rate * seconds, MIN_FIFO_SAMPLES)`
pub fn fifo_size(rate: f64, seconds: f64) -> usize {
    let wanted = (rate * seconds).ceil();
    if wanted.is_finite() && wanted > MIN_FIFO_SAMPLES as f64 {
        wanted as usize
    } else {
        MIN_FIFO_SAMPLES
    }
}

/// Worker side of the sample FIFO.
pub enum SampleFifo {
    /// RX: the worker fills the FIFO
    Capture(rtrb::Producer<IqSample>),
    /// TX: the worker drains the FIFO
    Playback(rtrb::Consumer<IqSample>),
}

/// Host side of the sample FIFO, handed to whoever consumes or produces IQ.
pub enum HostFifo {
    Capture(rtrb::Consumer<IqSample>),
    Playback(rtrb::Producer<IqSample>),
}

impl std::fmt::Debug for HostFifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostFifo::Capture(c) => write!(f, "HostFifo::Capture({} queued)", c.slots()),
            HostFifo::Playback(p) => write!(f, "HostFifo::Playback({} free)", p.slots()),
        }
    }
}

/// Build both ends of a FIFO for `direction`.
pub fn sample_fifo(direction: Direction, size: usize) -> (SampleFifo, HostFifo) {
    let (producer, consumer) = rtrb::RingBuffer::new(size);
    match direction {
        Direction::Rx => (SampleFifo::Capture(producer), HostFifo::Capture(consumer)),
        Direction::Tx => (SampleFifo::Playback(consumer), HostFifo::Playback(producer)),
    }
}

/// Everything a worker needs to run.
pub struct WorkerContext {
    pub device: Arc<PhysicalDevice>,
    pub direction: Direction,
    pub channel: Channel,
    pub sample_rate: f64,
    pub fifo: SampleFifo,
    pub fifo_size: usize,
    pub stats: Arc<WorkerStats>,
    pub recorder: Arc<Mutex<Option<IqRecorder>>>,
}

/// Builds streaming threads for instances.
pub trait StreamThreadFactory: Send + Sync {
    fn create(&self, ctx: WorkerContext) -> Arc<dyn StreamThread>;
}

/// Factory for real `SampleWorker`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleWorkerFactory;

impl StreamThreadFactory for SampleWorkerFactory {
    fn create(&self, ctx: WorkerContext) -> Arc<dyn StreamThread> {
        Arc::new(SampleWorker::new(ctx))
    }
}

struct Shared {
    device: Arc<PhysicalDevice>,
    direction: Direction,
    channel: Channel,
    running: AtomicBool,
    rate: AtomicF64,
    stats: Arc<WorkerStats>,
    recorder: Arc<Mutex<Option<IqRecorder>>>,
}

pub struct SampleWorker {
    shared: Arc<Shared>,
    fifo: Mutex<Option<SampleFifo>>,
    handle: Mutex<Option<JoinHandle<SampleFifo>>>,
}

impl SampleWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        ctx.stats
            .fifo_size
            .store(ctx.fifo_size as u64, Ordering::Relaxed);
        Self {
            shared: Arc::new(Shared {
                device: ctx.device,
                direction: ctx.direction,
                channel: ctx.channel,
                running: AtomicBool::new(false),
                rate: AtomicF64::new(ctx.sample_rate),
                stats: ctx.stats,
                recorder: ctx.recorder,
            }),
            fifo: Mutex::new(Some(ctx.fifo)),
            handle: Mutex::new(None),
        }
    }

    fn handle(&self) -> MutexGuard<'_, Option<JoinHandle<SampleFifo>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join a finished thread and park its FIFO end.
    fn reap(&self, handle: JoinHandle<SampleFifo>) {
        match handle.join() {
            Ok(fifo) => {
                *self.fifo.lock().unwrap_or_else(PoisonError::into_inner) = Some(fifo);
            }
            Err(_) => error!("{} worker thread panicked", self.shared.direction),
        }
    }
}

impl StreamThread for SampleWorker {
    fn start_work(&self) -> Result<(), StreamThreadError> {
        let mut slot = self.handle();
        if let Some(handle) = slot.take() {
            if self.shared.running.load(Ordering::Acquire) {
                *slot = Some(handle);
                return Ok(());
            }
            self.reap(handle);
        }

        let fifo = self
            .fifo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(StreamThreadError::FifoUnavailable)?;

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let name = format!("duet-{}-worker", self.shared.direction);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run_worker(shared, fifo))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                StreamThreadError::Spawn(e.to_string())
            })?;
        *slot = Some(handle);

        info!(
            "{} worker started on channel {} @ {} S/s",
            self.shared.direction,
            self.shared.channel,
            self.shared.rate.load(Ordering::Relaxed)
        );
        Ok(())
    }

    fn stop_work(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle().take() {
            debug!("waiting for {} worker to stop", self.shared.direction);
            self.reap(handle);
            info!("{} worker stopped", self.shared.direction);
        }
    }

    fn set_device_sample_rate(&self, rate: f64) {
        self.shared.rate.store(rate, Ordering::Relaxed);
        debug!("{} worker rate set to {}", self.shared.direction, rate);
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn stats(&self) -> Option<WorkerStatsSnapshot> {
        Some(self.shared.stats.snapshot())
    }
}

impl Drop for SampleWorker {
    fn drop(&mut self) {
        self.stop_work();
    }
}

fn run_worker(shared: Arc<Shared>, mut fifo: SampleFifo) -> SampleFifo {
    let mut block: Vec<IqSample> = Vec::new();
    let mut due = 0.0f64;
    let mut last = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        thread::sleep(TICK);
        let now = Instant::now();
        due += shared.rate.load(Ordering::Relaxed) * (now - last).as_secs_f64();
        last = now;

        let n = (due as usize).min(MAX_BLOCK);
        if n == 0 {
            continue;
        }
        due -= n as f64;

        let result = match &mut fifo {
            SampleFifo::Capture(producer) => capture(&shared, producer, &mut block, n),
            SampleFifo::Playback(consumer) => playback(&shared, consumer, &mut block, n),
        };
        if let Err(e) = result {
            error!("{} worker stopping: {}", shared.direction, e);
            break;
        }
    }

    shared.running.store(false, Ordering::Release);
    fifo
}

fn capture(
    shared: &Shared,
    producer: &mut rtrb::Producer<IqSample>,
    block: &mut Vec<IqSample>,
    n: usize,
) -> Result<(), crate::sdk::SdkError> {
    block.resize(n, IqSample::default());
    let got = shared
        .device
        .with_handle(|h| h.read_samples(shared.channel, &mut block[..]))?;
    let samples = filled(block, got);

    {
        let mut recorder = shared.recorder.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rec) = recorder.as_mut() {
            if let Err(e) = rec.write(samples) {
                error!("recording stopped: {}", e);
                *recorder = None;
            }
        }
    }

    let mut dropped = false;
    for &s in samples {
        if producer.push(s).is_err() {
            dropped = true;
            break;
        }
    }
    let stats = &shared.stats;
    if dropped {
        stats.overruns.fetch_add(1, Ordering::Relaxed);
    }
    stats.samples.fetch_add(samples.len() as u64, Ordering::Relaxed);
    let size = stats.fifo_size.load(Ordering::Relaxed);
    stats
        .fifo_filled
        .store(size.saturating_sub(producer.slots() as u64), Ordering::Relaxed);
    Ok(())
}

/// The part of `block` a read reported as filled, never past its end.
fn filled(block: &[IqSample], got: usize) -> &[IqSample] {
    &block[..got.min(block.len())]
}

fn playback(
    shared: &Shared,
    consumer: &mut rtrb::Consumer<IqSample>,
    block: &mut Vec<IqSample>,
    n: usize,
) -> Result<(), crate::sdk::SdkError> {
    block.clear();
    while block.len() < n {
        match consumer.pop() {
            Ok(s) => block.push(s),
            Err(_) => break,
        }
    }
    let stats = &shared.stats;
    if block.len() < n {
        stats.underruns.fetch_add(1, Ordering::Relaxed);
        block.resize(n, IqSample::default());
    }
    let sent = shared
        .device
        .with_handle(|h| h.write_samples(shared.channel, &block[..]))?;
    stats.samples.fetch_add(sent as u64, Ordering::Relaxed);
    stats
        .fifo_filled
        .store(consumer.slots() as u64, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedSdk;

    #[test]
    fn test_filled_clamps_overlong_read_count() {
        let block = vec![IqSample::default(); 8];
        assert_eq!(filled(&block, 3).len(), 3);
        assert_eq!(filled(&block, 8).len(), 8);
        assert_eq!(filled(&block, 4096).len(), 8);
    }

    fn rx_worker() -> (SampleWorker, HostFifo, crate::lease::ChannelLease, Arc<WorkerStats>) {
        let sdk = Arc::new(SimulatedSdk::single("sim://xtrx0"));
        let device = Arc::new(PhysicalDevice::new("sim://xtrx0", sdk));
        let lease = device.acquire_channel(Direction::Rx, Channel::A).unwrap();
        device
            .with_handle(|h| h.set_sample_rate(1e6, 2e6, Direction::Rx))
            .unwrap();
        let (fifo, host) = sample_fifo(Direction::Rx, MIN_FIFO_SAMPLES);
        let stats = Arc::new(WorkerStats::default());
        let worker = SampleWorker::new(WorkerContext {
            device,
            direction: Direction::Rx,
            channel: Channel::A,
            sample_rate: 1e6,
            fifo,
            fifo_size: MIN_FIFO_SAMPLES,
            stats: stats.clone(),
            recorder: Arc::new(Mutex::new(None)),
        });
        (worker, host, lease, stats)
    }

    #[test]
    fn test_fifo_size_floor() {
        assert_eq!(fifo_size(1_000.0, 0.25), MIN_FIFO_SAMPLES);
        assert_eq!(fifo_size(10e6, 0.25), 2_500_000);
        assert_eq!(fifo_size(f64::NAN, 0.25), MIN_FIFO_SAMPLES);
    }

    #[test]
    fn test_capture_fills_fifo_and_restarts() {
        let (worker, host, _lease, stats) = rx_worker();
        assert!(!worker.is_running());

        worker.start_work().unwrap();
        assert!(worker.is_running());
        thread::sleep(Duration::from_millis(60));
        worker.stop_work();
        assert!(!worker.is_running());

        let HostFifo::Capture(consumer) = host else {
            panic!("rx host side must be a consumer");
        };
        assert!(consumer.slots() > 0);
        assert!(stats.snapshot().samples > 0);

        // the FIFO end came back, so it can start again
        worker.start_work().unwrap();
        worker.stop_work();
    }

    #[test]
    fn test_worker_exits_when_device_closes() {
        let (worker, _host, lease, _stats) = rx_worker();
        worker.start_work().unwrap();
        lease.release();
        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_running());
    }
}
