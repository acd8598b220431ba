//! Paced frame production on a dedicated capture thread.
//!
//! State machine: Idle -> Initializing -> Capturing -> (Reinitializing ->
//! Capturing)* -> Stopped. The capture backend and the scaler are created on
//! the capture thread and never leave it; frames cross to the consumer only
//! through the lock-free ring buffer.

use crate::backend::{CaptureBackend, CaptureDevice, CaptureError};
use parking_lot::Mutex;
use retrace_core::limits::{BACKPRESSURE_QUARTERS, DROP_LOG_INTERVAL};
use retrace_core::{
    CaptureConfig, Consumer, CpuScaler, FramePool, Producer, Result, RetraceError, RingBuffer,
    Scaler, ScalingMode, VideoFrame,
};
use retrace_gpu::GpuScaler;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pause between re-open attempts after access loss.
const REINIT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Skipped acquisitions back off for this long instead of a full interval.
const BACKPRESSURE_BACKOFF: Duration = Duration::from_millis(2);

/// When the loop falls this many intervals behind, the deadline resyncs to now.
const RESYNC_INTERVALS: u32 = 4;

/// Lifecycle of a [`FrameSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    Idle = 0,
    Initializing = 1,
    Capturing = 2,
    Reinitializing = 3,
    Stopped = 4,
}

impl CaptureState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Capturing,
            3 => Self::Reinitializing,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Counters describing what the capture loop did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames published to the queue
    pub captured: u64,
    /// Frames captured but discarded because the queue was full
    pub dropped: u64,
    /// Ticks skipped because the queue was nearly full
    pub skipped: u64,
    /// Ticks where the scaler produced nothing
    pub scaler_dropped: u64,
    /// Acquisitions that saw no new display content
    pub timeouts: u64,
    /// Recoveries from lost capture access
    pub reinits: u64,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    scaler_dropped: AtomicU64,
    timeouts: AtomicU64,
    reinits: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            captured: self.captured.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            scaler_dropped: self.scaler_dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            reinits: self.reinits.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.captured,
            &self.dropped,
            &self.skipped,
            &self.scaler_dropped,
            &self.timeouts,
            &self.reinits,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// State shared between the owner and the capture thread.
struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    counters: Counters,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CaptureState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn fail(&self, message: String) {
        error!("Capture stopped: {}", message);
        *self.last_error.lock() = Some(message);
        self.set_state(CaptureState::Stopped);
    }
}

/// Produces scaled frames at a fixed rate from a capture device.
pub struct FrameSource {
    config: CaptureConfig,
    device: Arc<dyn CaptureDevice>,
    pool: Arc<FramePool>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Create an idle source with its own frame pool.
    pub fn new(config: CaptureConfig, device: Arc<dyn CaptureDevice>) -> Self {
        let pool = Arc::new(FramePool::new(
            config.width,
            config.height,
            config.pixel_format,
            config.pool_ceiling,
        ));
        Self::with_pool(config, device, pool)
    }

    /// Create an idle source that draws frames from `pool`.
    pub fn with_pool(config: CaptureConfig, device: Arc<dyn CaptureDevice>, pool: Arc<FramePool>) -> Self {
        Self {
            config,
            device,
            pool,
            shared: Arc::new(Shared {
                state: AtomicU8::new(CaptureState::Idle as u8),
                stop: AtomicBool::new(false),
                counters: Counters::default(),
                last_error: Mutex::new(None),
            }),
            thread: None,
        }
    }

    /// Acquire capture resources and start the capture thread.
    ///
    /// Blocks until the thread has opened the device and built its scaler.
    /// On failure no thread is left running and the source stays `Idle`.
    pub fn start(&mut self) -> Result<FrameStream> {
        match self.state() {
            CaptureState::Idle | CaptureState::Stopped => {}
            state => {
                return Err(RetraceError::Capture(format!(
                    "cannot start capture while {:?}",
                    state
                )))
            }
        }
        // A source that stopped on its own still has a finished thread to reap.
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }

        let (producer, consumer) = RingBuffer::with_capacity(self.config.queue_capacity)?;

        self.shared.stop.store(false, Ordering::Release);
        self.shared.counters.reset();
        *self.shared.last_error.lock() = None;
        self.shared.set_state(CaptureState::Initializing);

        let (init_tx, init_rx) = crossbeam_channel::bounded(1);
        let worker = WorkerSetup {
            config: self.config.clone(),
            device: Arc::clone(&self.device),
            pool: Arc::clone(&self.pool),
            shared: Arc::clone(&self.shared),
            producer,
        };

        let handle = std::thread::Builder::new()
            .name("retrace-capture".to_string())
            .spawn(move || worker.run(init_tx))
            .map_err(|e| {
                self.shared.set_state(CaptureState::Idle);
                RetraceError::Capture(format!("Failed to spawn capture thread: {}", e))
            })?;

        let init = init_rx.recv().unwrap_or_else(|_| {
            Err(RetraceError::Internal(
                "capture thread exited during initialization".to_string(),
            ))
        });

        match init {
            Ok(()) => {
                self.thread = Some(handle);
                info!(
                    device = self.device.name(),
                    width = self.config.width,
                    height = self.config.height,
                    rate = %self.config.frame_rate,
                    "Capture started"
                );
                Ok(FrameStream {
                    consumer,
                    pool: Arc::clone(&self.pool),
                })
            }
            Err(e) => {
                let _ = handle.join();
                self.shared.set_state(CaptureState::Idle);
                error!("Capture start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop the capture thread and release capture resources. Idempotent.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
            let stats = self.stats();
            info!(
                captured = stats.captured,
                dropped = stats.dropped,
                skipped = stats.skipped,
                reinits = stats.reinits,
                "Capture stopped"
            );
        }
        if self.state() != CaptureState::Idle {
            self.shared.set_state(CaptureState::Stopped);
        }
    }

    pub fn state(&self) -> CaptureState {
        self.shared.state()
    }

    /// Whether the capture thread is producing (or recovering).
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            CaptureState::Capturing | CaptureState::Reinitializing
        )
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.counters.snapshot()
    }

    /// Why the capture thread stopped on its own, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Consumer side of a running [`FrameSource`].
pub struct FrameStream {
    consumer: Consumer<VideoFrame>,
    pool: Arc<FramePool>,
}

impl FrameStream {
    /// Pop the oldest captured frame, if any. Never blocks.
    pub fn get_frame(&mut self) -> Option<VideoFrame> {
        self.consumer.pop()
    }

    /// Pop up to `max` frames into `out`. Returns how many were moved.
    pub fn get_frames(&mut self, out: &mut Vec<VideoFrame>, max: usize) -> usize {
        self.consumer.pop_batch(out, max)
    }

    /// Hand a consumed frame back for reuse.
    pub fn recycle(&self, frame: VideoFrame) {
        self.pool.release(frame);
    }

    /// Approximate number of queued frames.
    pub fn len(&self) -> usize {
        self.consumer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }
}

/// Everything the capture thread needs, moved into it at spawn.
struct WorkerSetup {
    config: CaptureConfig,
    device: Arc<dyn CaptureDevice>,
    pool: Arc<FramePool>,
    shared: Arc<Shared>,
    producer: Producer<VideoFrame>,
}

impl WorkerSetup {
    fn run(self, init_tx: crossbeam_channel::Sender<Result<()>>) {
        let opened = self
            .device
            .open()
            .map_err(RetraceError::from)
            .and_then(|backend| {
                let scaler = make_scaler(self.config.scaling, self.config.width, self.config.height)?;
                Ok((backend, scaler))
            });

        let (backend, scaler) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                let _ = init_tx.send(Err(e));
                return;
            }
        };

        self.shared.set_state(CaptureState::Capturing);
        let _ = init_tx.send(Ok(()));

        let mut worker = CaptureWorker {
            config: self.config,
            device: self.device,
            pool: self.pool,
            shared: self.shared,
            producer: self.producer,
            backend: Some(backend),
            scaler,
            frame_number: 0,
            started: Instant::now(),
        };
        worker.run();
    }
}

/// Build the scaler for `mode` on the current thread.
fn make_scaler(mode: ScalingMode, width: u32, height: u32) -> Result<Box<dyn Scaler>> {
    match mode {
        ScalingMode::Cpu => Ok(Box::new(CpuScaler::new())),
        ScalingMode::Gpu => Ok(Box::new(GpuScaler::new_blocking(width, height)?)),
        ScalingMode::Auto => match GpuScaler::new_blocking(width, height) {
            Ok(scaler) => Ok(Box::new(scaler)),
            Err(e) => {
                warn!("GPU scaling unavailable, using CPU: {}", e);
                Ok(Box::new(CpuScaler::new()))
            }
        },
    }
}

/// Result of one capture tick, computed while the backend is borrowed.
enum Tick {
    Produced(VideoFrame),
    NoFrame,
    AccessLost(String),
    ScalerLost(String),
    Fatal(String),
}

struct CaptureWorker {
    config: CaptureConfig,
    device: Arc<dyn CaptureDevice>,
    pool: Arc<FramePool>,
    shared: Arc<Shared>,
    producer: Producer<VideoFrame>,
    backend: Option<Box<dyn CaptureBackend>>,
    scaler: Box<dyn Scaler>,
    /// Next frame number; survives reinitialization
    frame_number: u64,
    started: Instant,
}

impl CaptureWorker {
    fn run(&mut self) {
        let interval = self.config.frame_rate.frame_interval();
        let backpressure_at = self.producer.capacity() * BACKPRESSURE_QUARTERS / 4;
        let mut deadline = Instant::now();

        debug!(scaler = self.scaler.name(), "Capture loop running");

        while !self.shared.stop_requested() {
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            } else if now - deadline > interval * RESYNC_INTERVALS {
                debug!("Capture loop fell behind, resyncing pacing");
                deadline = now;
            }
            deadline += interval;

            if self.producer.len() >= backpressure_at {
                self.shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(BACKPRESSURE_BACKOFF);
                continue;
            }

            match self.tick() {
                Tick::Produced(frame) => self.publish(frame),
                Tick::NoFrame => {}
                Tick::AccessLost(reason) => {
                    warn!("Capture access lost: {}", reason);
                    if !self.reinitialize(false) {
                        return;
                    }
                    deadline = Instant::now();
                }
                Tick::ScalerLost(reason) => {
                    warn!("Scaler device lost: {}", reason);
                    if !self.reinitialize(true) {
                        return;
                    }
                    deadline = Instant::now();
                }
                Tick::Fatal(reason) => {
                    self.shared.fail(reason);
                    return;
                }
            }
        }

        self.backend = None;
        self.shared.set_state(CaptureState::Stopped);
    }

    fn tick(&mut self) -> Tick {
        let Some(backend) = self.backend.as_mut() else {
            return Tick::AccessLost("no capture session".to_string());
        };

        let image = match backend.acquire(self.config.acquire_timeout()) {
            Ok(image) => image,
            Err(CaptureError::Timeout) => {
                self.shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Tick::NoFrame;
            }
            Err(CaptureError::AccessLost(reason)) => return Tick::AccessLost(reason),
            Err(CaptureError::Failed(reason)) => return Tick::Fatal(reason),
        };

        let mut frame = self.pool.acquire();
        match self.scaler.scale(&image, &mut frame) {
            Ok(true) => {
                frame.timestamp = self.started.elapsed();
                Tick::Produced(frame)
            }
            Ok(false) => {
                self.shared.counters.scaler_dropped.fetch_add(1, Ordering::Relaxed);
                self.pool.release(frame);
                Tick::NoFrame
            }
            Err(RetraceError::DeviceLost(reason)) => {
                self.pool.release(frame);
                Tick::ScalerLost(reason)
            }
            Err(e) => {
                self.pool.release(frame);
                Tick::Fatal(format!("scaling failed: {}", e))
            }
        }
    }

    fn publish(&mut self, mut frame: VideoFrame) {
        frame.frame_number = self.frame_number;
        match self.producer.push(frame) {
            Ok(()) => {
                self.frame_number += 1;
                self.shared.counters.captured.fetch_add(1, Ordering::Relaxed);
            }
            Err(frame) => {
                self.pool.release(frame);
                let dropped = self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % DROP_LOG_INTERVAL == 1 {
                    warn!(dropped, "Capture queue full, dropping frames");
                }
            }
        }
    }

    /// Tear down and reopen capture resources in place.
    ///
    /// Returns false when the loop must exit (stop requested or recovery
    /// failed `max_reinit_attempts` times in a row).
    fn reinitialize(&mut self, rebuild_scaler: bool) -> bool {
        self.shared.set_state(CaptureState::Reinitializing);
        self.shared.counters.reinits.fetch_add(1, Ordering::Relaxed);
        self.backend = None;

        let attempts = self.config.max_reinit_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if self.shared.stop_requested() {
                self.shared.set_state(CaptureState::Stopped);
                return false;
            }

            match self.reopen(rebuild_scaler) {
                Ok(()) => {
                    info!(
                        attempt,
                        next_frame = self.frame_number,
                        "Capture reinitialized"
                    );
                    self.shared.set_state(CaptureState::Capturing);
                    return true;
                }
                Err(e) => {
                    warn!(attempt, attempts, "Capture reinitialization failed: {}", e);
                    last_error = e.to_string();
                    std::thread::sleep(REINIT_RETRY_DELAY);
                }
            }
        }

        self.shared.fail(format!(
            "capture could not be reinitialized after {} attempts: {}",
            attempts, last_error
        ));
        false
    }

    fn reopen(&mut self, rebuild_scaler: bool) -> Result<()> {
        if rebuild_scaler {
            self.scaler = make_scaler(self.config.scaling, self.config.width, self.config.height)?;
        }
        self.backend = Some(self.device.open()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticDisplay;
    use retrace_core::FrameRate;

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            width: 64,
            height: 36,
            frame_rate: FrameRate::from_fps(200),
            scaling: ScalingMode::Cpu,
            queue_capacity: 16,
            pool_ceiling: 8,
            acquire_timeout_ms: 5,
            max_reinit_attempts: 3,
            ..CaptureConfig::default()
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_start_produces_numbered_frames() {
        let display = Arc::new(SyntheticDisplay::new(128, 72));
        let mut source = FrameSource::new(test_config(), display);
        let mut stream = source.start().unwrap();
        assert_eq!(source.state(), CaptureState::Capturing);

        let mut frames = Vec::new();
        assert!(wait_for(|| {
            stream.get_frames(&mut frames, 8);
            frames.len() >= 5
        }));

        for pair in frames.windows(2) {
            assert!(pair[1].frame_number > pair[0].frame_number);
        }
        assert_eq!(frames[0].width, 64);
        assert_eq!(frames[0].data.len(), 64 * 36 * 3);

        source.stop();
        assert_eq!(source.state(), CaptureState::Stopped);
    }

    #[test]
    fn test_start_failure_stays_idle() {
        let display = SyntheticDisplay::new(32, 32);
        display.controls().fail_next_opens(1);
        let mut source = FrameSource::new(test_config(), Arc::new(display));

        assert!(source.start().is_err());
        assert_eq!(source.state(), CaptureState::Idle);
        assert!(!source.is_running());
    }

    #[test]
    fn test_stop_twice_is_safe() {
        let display = Arc::new(SyntheticDisplay::new(32, 32));
        let mut source = FrameSource::new(test_config(), display);
        let _stream = source.start().unwrap();
        source.stop();
        source.stop();
        assert_eq!(source.state(), CaptureState::Stopped);
    }

    #[test]
    fn test_full_queue_skips_acquisition() {
        let display = Arc::new(SyntheticDisplay::new(32, 32));
        let mut source = FrameSource::new(test_config(), display);
        let stream = source.start().unwrap();

        // Nobody drains the stream: the queue fills to the backpressure mark.
        assert!(wait_for(|| source.stats().skipped > 0));
        assert!(stream.len() >= 16 * 3 / 4);
        source.stop();
    }

    #[test]
    fn test_access_loss_recovers_with_monotonic_numbers() {
        let display = SyntheticDisplay::new(32, 32);
        let controls = display.controls();
        let mut source = FrameSource::new(test_config(), Arc::new(display));
        let mut stream = source.start().unwrap();

        let mut seen = Vec::new();
        let drain = |stream: &mut FrameStream, seen: &mut Vec<u64>| {
            while let Some(frame) = stream.get_frame() {
                seen.push(frame.frame_number);
                stream.recycle(frame);
            }
        };

        assert!(wait_for(|| {
            drain(&mut stream, &mut seen);
            seen.len() >= 3
        }));
        controls.lose_access();
        assert!(wait_for(|| source.stats().reinits == 1));
        let before = seen.len();
        assert!(wait_for(|| {
            drain(&mut stream, &mut seen);
            seen.len() >= before + 3
        }));

        assert_eq!(controls.open_count(), 2);
        assert!(source.is_running());
        for pair in seen.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        source.stop();
    }

    #[test]
    fn test_repeated_reinit_failure_stops() {
        let display = SyntheticDisplay::new(32, 32);
        let controls = display.controls();
        let mut source = FrameSource::new(test_config(), Arc::new(display));
        let _stream = source.start().unwrap();

        controls.fail_next_opens(u32::MAX);
        controls.lose_access();

        assert!(wait_for(|| source.state() == CaptureState::Stopped));
        assert!(source.last_error().is_some());
        source.stop();
    }
}
