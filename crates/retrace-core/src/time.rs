//! Frame rate representation.
//!
//! Frame numbers are the only clock shared between the capture pipeline and
//! the container file, so conversions between frame indices and seconds all
//! go through [`FrameRate`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Frame rate as a rational number (e.g., 30000/1001 for 29.97 fps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    /// Numerator (e.g., 30000)
    pub numerator: u32,
    /// Denominator (e.g., 1001)
    pub denominator: u32,
}

impl FrameRate {
    /// Create a new frame rate.
    #[inline]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Whole-number frame rate.
    #[inline]
    pub const fn from_fps(fps: u32) -> Self {
        Self::new(fps, 1)
    }

    /// Convert to frames per second as f64.
    #[inline]
    pub fn to_fps_f64(self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Wall-clock interval between two frames.
    pub fn frame_interval(self) -> Duration {
        Duration::from_secs_f64(self.denominator as f64 / self.numerator as f64)
    }

    /// Position of a frame in the stream, in seconds.
    #[inline]
    pub fn frame_to_seconds(self, frame_number: u64) -> f64 {
        frame_number as f64 * self.denominator as f64 / self.numerator as f64
    }

    /// Frame index that is showing at `seconds` (floored).
    pub fn seconds_to_frame(self, seconds: f64) -> u64 {
        if seconds <= 0.0 {
            return 0;
        }
        (seconds * self.to_fps_f64()).floor() as u64
    }

    /// Frame rate as passed to ffmpeg (`30` or `30000/1001`).
    pub fn ffmpeg_rate(self) -> String {
        if self.denominator == 1 {
            self.numerator.to_string()
        } else {
            format!("{}/{}", self.numerator, self.denominator)
        }
    }

    /// Frames in one second, rounded up. Used for GOP sizes and queue sizing.
    pub fn frames_per_second_ceil(self) -> u32 {
        self.numerator.div_ceil(self.denominator.max(1))
    }

    pub fn is_valid(self) -> bool {
        self.numerator > 0 && self.denominator > 0
    }

    /// Common frame rates
    pub const FPS_24: Self = Self::new(24, 1);
    pub const FPS_29_97: Self = Self::new(30000, 1001);
    pub const FPS_30: Self = Self::new(30, 1);
    pub const FPS_60: Self = Self::new(60, 1);
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::FPS_30
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fps = self.to_fps_f64();
        if (fps - fps.round()).abs() < 0.001 {
            write!(f, "{} fps", fps.round() as u32)
        } else {
            write!(f, "{:.3} fps", fps)
        }
    }
}
