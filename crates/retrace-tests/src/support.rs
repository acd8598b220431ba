//! Shared fixtures for the integration tests.

use parking_lot::Mutex;
use retrace_core::{RecorderConfig, Result, RetraceError, ScalingMode, VideoFrame};
use retrace_engine::Engine;
use retrace_media::{ClipRange, ClipTrimmer, ExportMethod, FrameSink, SinkFactory, StreamSpec};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Small CPU-scaled recording that writes its files under `dir`.
pub fn small_config(dir: &Path) -> RecorderConfig {
    let mut config = RecorderConfig::default();
    config.capture.width = 32;
    config.capture.height = 18;
    config.capture.scaling = ScalingMode::Cpu;
    config.capture.queue_capacity = 8;
    config.capture.acquire_timeout_ms = 5;
    config.encoder.flush_grace_ms = 0;
    config.encoder.container_path = dir.join("session.ts");
    config.clip.attempt_window = 2;
    config.clip.output_dir = dir.join("clips");
    config
}

/// Poll `cond` for up to five seconds.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

pub fn wait_for_forwarded(engine: &Engine, count: u64) -> bool {
    wait_for(|| engine.stats().frames_forwarded >= count)
}

pub fn assert_gap_free(numbers: &[u64]) {
    for (i, n) in numbers.iter().enumerate() {
        assert_eq!(*n, i as u64, "frame numbers {:?}", numbers);
    }
}

// ── Slow sink ───────────────────────────────────────────────────

/// Sink that takes `delay` per frame, so the encoder queue fills up.
#[derive(Clone)]
pub struct SlowSinkFactory {
    delay: Duration,
    numbers: Arc<Mutex<Vec<u64>>>,
}

impl SlowSinkFactory {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            numbers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn frame_numbers(&self) -> Vec<u64> {
        self.numbers.lock().clone()
    }
}

impl SinkFactory for SlowSinkFactory {
    fn launch(&self, _spec: &StreamSpec) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(SlowSink {
            delay: self.delay,
            numbers: Arc::clone(&self.numbers),
        }))
    }
}

struct SlowSink {
    delay: Duration,
    numbers: Arc<Mutex<Vec<u64>>>,
}

impl FrameSink for SlowSink {
    fn write_frame(&mut self, frame: &VideoFrame) -> io::Result<()> {
        std::thread::sleep(self.delay);
        self.numbers.lock().push(frame.frame_number);
        Ok(())
    }

    fn take_audio_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        None
    }

    fn close(&mut self, _grace: Duration) -> io::Result<()> {
        Ok(())
    }
}

// ── Trimmer ─────────────────────────────────────────────────────

/// Trimmer that records every call and can be switched to fail.
#[derive(Default)]
pub struct RecordingTrimmer {
    pub calls: Mutex<Vec<(ClipRange, PathBuf, ExportMethod)>>,
    pub failing: AtomicBool,
}

impl RecordingTrimmer {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn last_range(&self) -> Option<ClipRange> {
        self.calls.lock().last().map(|(range, _, _)| *range)
    }
}

impl ClipTrimmer for RecordingTrimmer {
    fn trim(&self, _container: &Path, range: ClipRange, output: &Path, method: ExportMethod) -> Result<()> {
        self.calls.lock().push((range, output.to_path_buf(), method));
        if self.failing.load(Ordering::Acquire) {
            return Err(RetraceError::Export(format!("{} refused", method)));
        }
        std::fs::write(output, b"clip")?;
        Ok(())
    }
}
