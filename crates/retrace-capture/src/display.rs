//! Primary display capture through `scrap`.
//!
//! Uses DXGI desktop duplication on Windows, CoreGraphics on macOS and X11
//! shared memory on Linux. `scrap` never blocks, so acquisition polls until
//! the timeout expires.

use crate::backend::{CaptureBackend, CaptureDevice, CaptureError};
use retrace_core::CapturedImage;
use scrap::{Capturer, Display};
use std::time::{Duration, Instant};
use tracing::info;

/// Delay between polls while waiting for a changed frame.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// The primary display.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScreenDisplay;

impl ScreenDisplay {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureDevice for ScreenDisplay {
    fn open(&self) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        let display = Display::primary()
            .map_err(|e| CaptureError::Failed(format!("No primary display: {}", e)))?;
        let capturer = Capturer::new(display)
            .map_err(|e| CaptureError::Failed(format!("Cannot duplicate display: {}", e)))?;

        let width = capturer.width() as u32;
        let height = capturer.height() as u32;
        info!(width, height, "Display capture opened");

        Ok(Box::new(ScreenBackend {
            capturer,
            width,
            height,
            pitch: width as usize * 4,
            buffer: Vec::new(),
        }))
    }

    fn name(&self) -> &str {
        "display"
    }
}

struct ScreenBackend {
    capturer: Capturer,
    width: u32,
    height: u32,
    pitch: usize,
    /// Last frame copied out of the duplication surface
    buffer: Vec<u8>,
}

impl CaptureBackend for ScreenBackend {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn acquire(&mut self, timeout: Duration) -> Result<CapturedImage<'_>, CaptureError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.capturer.frame() {
                Ok(frame) => {
                    // Rows may be padded past width * 4.
                    self.pitch = frame.len() / self.height.max(1) as usize;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(&frame);
                    break;
                }
                Err(e) => match CaptureError::from_io(e) {
                    CaptureError::Timeout if Instant::now() < deadline => {
                        std::thread::sleep(POLL_INTERVAL);
                    }
                    other => return Err(other),
                },
            }
        }

        CapturedImage::new(&self.buffer, self.width, self.height, self.pitch).ok_or_else(|| {
            CaptureError::AccessLost(format!(
                "Frame of {} bytes does not cover {}x{}",
                self.buffer.len(),
                self.width,
                self.height
            ))
        })
    }
}
