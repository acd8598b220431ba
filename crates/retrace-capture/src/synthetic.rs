//! Test-pattern capture device.
//!
//! Produces moving colour bars without touching the display. Faults can be
//! injected through [`SyntheticControls`] while a capture thread is running.

use crate::backend::{CaptureBackend, CaptureDevice, CaptureError};
use retrace_core::CapturedImage;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BARS: [[u8; 4]; 8] = [
    [255, 255, 255, 255], // white
    [0, 255, 255, 255],   // yellow
    [255, 255, 0, 255],   // cyan
    [0, 255, 0, 255],     // green
    [255, 0, 255, 255],   // magenta
    [0, 0, 255, 255],     // red
    [255, 0, 0, 255],     // blue
    [0, 0, 0, 255],       // black
];

/// Fault injection and counters shared with a [`SyntheticDisplay`].
#[derive(Debug, Default)]
pub struct SyntheticControls {
    lose_access: AtomicBool,
    failing_opens: AtomicU32,
    timeouts_pending: AtomicU32,
    opens: AtomicU32,
    frames: AtomicU64,
}

impl SyntheticControls {
    /// Make the next acquisition report lost access.
    pub fn lose_access(&self) {
        self.lose_access.store(true, Ordering::Release);
    }

    /// Make the next `count` opens fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::Release);
    }

    /// Make the next `count` acquisitions time out.
    pub fn time_out_next(&self, count: u32) {
        self.timeouts_pending.store(count, Ordering::Release);
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::Acquire)
    }

    /// Images handed out so far.
    pub fn frames_generated(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Capture device that renders a scrolling colour-bar pattern.
#[derive(Debug, Clone)]
pub struct SyntheticDisplay {
    width: u32,
    height: u32,
    controls: Arc<SyntheticControls>,
}

impl SyntheticDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            controls: Arc::new(SyntheticControls::default()),
        }
    }

    /// Handle for injecting faults into this device.
    pub fn controls(&self) -> Arc<SyntheticControls> {
        Arc::clone(&self.controls)
    }
}

impl CaptureDevice for SyntheticDisplay {
    fn open(&self) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        if SyntheticControls::take_one(&self.controls.failing_opens) {
            return Err(CaptureError::Failed("synthetic display unavailable".into()));
        }
        self.controls.opens.fetch_add(1, Ordering::AcqRel);

        let pitch = self.width as usize * 4;
        Ok(Box::new(SyntheticBackend {
            width: self.width,
            height: self.height,
            pitch,
            buffer: vec![0u8; pitch * self.height as usize],
            tick: 0,
            controls: Arc::clone(&self.controls),
        }))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

struct SyntheticBackend {
    width: u32,
    height: u32,
    pitch: usize,
    buffer: Vec<u8>,
    tick: u32,
    controls: Arc<SyntheticControls>,
}

impl SyntheticBackend {
    fn render(&mut self) {
        let bar_width = (self.width / BARS.len() as u32).max(1);
        let shift = self.tick;
        let row_len = self.width as usize * 4;
        let split = self.pitch.min(self.buffer.len());
        let (first, rest) = self.buffer.split_at_mut(split);

        for (x, px) in first[..row_len].chunks_exact_mut(4).enumerate() {
            let bar = ((x as u32 + shift) / bar_width) as usize % BARS.len();
            px.copy_from_slice(&BARS[bar]);
        }
        for row in rest.chunks_exact_mut(self.pitch) {
            row[..row_len].copy_from_slice(&first[..row_len]);
        }
    }
}

impl CaptureBackend for SyntheticBackend {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn acquire(&mut self, _timeout: Duration) -> Result<CapturedImage<'_>, CaptureError> {
        if self.controls.lose_access.swap(false, Ordering::AcqRel) {
            return Err(CaptureError::AccessLost("synthetic access lost".into()));
        }
        if SyntheticControls::take_one(&self.controls.timeouts_pending) {
            return Err(CaptureError::Timeout);
        }

        self.tick = self.tick.wrapping_add(4);
        self.render();
        self.controls.frames.fetch_add(1, Ordering::AcqRel);

        CapturedImage::new(&self.buffer, self.width, self.height, self.pitch)
            .ok_or_else(|| CaptureError::Failed("synthetic buffer size mismatch".into()))
    }
}
