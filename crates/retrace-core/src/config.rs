//! Recorder configuration.
//!
//! Owned by the host's settings layer and handed to the engine at
//! construction. Stored as JSON; every field has a default so partial files
//! load cleanly.

use crate::error::{Result, RetraceError};
use crate::frame::PixelFormat;
use crate::time::FrameRate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where captured images are downscaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    /// Always scale on the CPU.
    Cpu,
    /// Require the GPU pipeline; failure to set it up fails the capture start.
    Gpu,
    /// Try the GPU pipeline, fall back to the CPU.
    #[default]
    Auto,
}

/// How many markers an export needs before it is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPolicy {
    /// The ledger must hold a full window of markers.
    #[default]
    RequireFull,
    /// A single marker is enough.
    RequireAny,
}

impl ExportPolicy {
    /// Number of markers required for a ledger of `window` entries.
    pub fn required_markers(self, window: usize) -> usize {
        match self {
            Self::RequireFull => window.max(1),
            Self::RequireAny => 1,
        }
    }
}

/// Video capture settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Output width after scaling
    pub width: u32,
    /// Output height after scaling
    pub height: u32,
    pub frame_rate: FrameRate,
    pub pixel_format: PixelFormat,
    pub scaling: ScalingMode,
    /// Slots in the capture ring buffer (power of two)
    pub queue_capacity: usize,
    /// Idle frame buffers kept for reuse
    pub pool_ceiling: usize,
    /// How long one acquisition waits for new display content
    pub acquire_timeout_ms: u64,
    /// Consecutive failed re-opens after device loss before giving up
    pub max_reinit_attempts: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: FrameRate::FPS_30,
            pixel_format: PixelFormat::Rgb24,
            scaling: ScalingMode::Auto,
            queue_capacity: 64,
            pool_ceiling: 16,
            acquire_timeout_ms: 100,
            max_reinit_attempts: 5,
        }
    }
}

impl CaptureConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Size in bytes of one output frame.
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

/// Encoder subprocess settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Explicit ffmpeg binary; searched on PATH when unset
    pub ffmpeg_path: Option<PathBuf>,
    pub video_bitrate_mbps: u32,
    /// Prefer the hardware H.264 encoder, falling back to software
    pub hardware_acceleration: bool,
    /// Frames buffered between the forwarding thread and the pipe writer
    pub queue_capacity: usize,
    pub flush_timeout_ms: u64,
    /// Extra wait after the queue drains so ffmpeg can mux what it was given
    pub flush_grace_ms: u64,
    /// How long to wait for ffmpeg to exit before killing it
    pub stop_grace_ms: u64,
    /// The continuously growing session recording
    pub container_path: PathBuf,
    /// Leave the container on disk when the session stops
    pub keep_container: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            video_bitrate_mbps: 5,
            hardware_acceleration: true,
            queue_capacity: 8,
            flush_timeout_ms: 2000,
            flush_grace_ms: 500,
            stop_grace_ms: 5000,
            container_path: std::env::temp_dir().join("retrace_session.ts"),
            keep_container: false,
        }
    }
}

impl EncoderConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn flush_grace(&self) -> Duration {
        Duration::from_millis(self.flush_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Clip export settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipSettings {
    /// Number of attempts kept in the ledger (W)
    pub attempt_window: usize,
    pub min_duration_secs: f64,
    /// Subtracted from the clip start, never below zero
    pub lead_in_secs: f64,
    /// Added to the clip duration
    pub trail_secs: f64,
    pub policy: ExportPolicy,
    /// Directory for suggested clip filenames
    pub output_dir: PathBuf,
}

impl Default for ClipSettings {
    fn default() -> Self {
        Self {
            attempt_window: 5,
            min_duration_secs: 2.0,
            lead_in_secs: 0.5,
            trail_secs: 0.5,
            policy: ExportPolicy::RequireFull,
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("Retrace")
}

/// Audio capture and mix settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub enabled: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub game_volume: f32,
    pub mic_volume: f32,
    /// Capture the default input device and mix it in
    pub microphone: bool,
    /// Audio chunks buffered before the encoder drops new ones
    pub queue_capacity: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 48_000,
            channels: 2,
            game_volume: 0.7,
            mic_volume: 0.3,
            microphone: false,
            queue_capacity: 64,
        }
    }
}

/// Top-level recorder configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
    pub clip: ClipSettings,
    pub audio: AudioSettings,
}

impl RecorderConfig {
    /// Parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| RetraceError::Config(format!("Invalid config: {}", e)))
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| RetraceError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let config = Self::from_json(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(RetraceError::Config(format!(
                "capture size must be non-zero, got {}x{}",
                capture.width, capture.height
            )));
        }
        if !capture.frame_rate.is_valid() {
            return Err(RetraceError::Config("frame rate must be positive".into()));
        }
        if capture.queue_capacity < 2 || !capture.queue_capacity.is_power_of_two() {
            return Err(RetraceError::Config(format!(
                "capture queue capacity must be a power of two >= 2, got {}",
                capture.queue_capacity
            )));
        }

        let encoder = &self.encoder;
        if encoder.queue_capacity == 0 {
            return Err(RetraceError::Config("encoder queue capacity must be non-zero".into()));
        }
        if encoder.video_bitrate_mbps == 0 {
            return Err(RetraceError::Config("video bitrate must be non-zero".into()));
        }
        if encoder.container_path.as_os_str().is_empty() {
            return Err(RetraceError::Config("container path is empty".into()));
        }

        let clip = &self.clip;
        if clip.attempt_window == 0 {
            return Err(RetraceError::Config("attempt window must hold at least one marker".into()));
        }
        for (name, value) in [
            ("min_duration_secs", clip.min_duration_secs),
            ("lead_in_secs", clip.lead_in_secs),
            ("trail_secs", clip.trail_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(RetraceError::Config(format!("{name} must be >= 0, got {value}")));
            }
        }

        let audio = &self.audio;
        for (name, value) in [("game_volume", audio.game_volume), ("mic_volume", audio.mic_volume)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RetraceError::Config(format!("{name} must be within 0..=1, got {value}")));
            }
        }
        if audio.enabled && (audio.sample_rate == 0 || audio.channels == 0) {
            return Err(RetraceError::Config("audio format must be non-zero".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RecorderConfig::default();
        config.validate().unwrap();
        assert_eq!(config.capture.width, 1280);
        assert_eq!(config.capture.height, 720);
        assert_eq!(config.capture.frame_rate, FrameRate::FPS_30);
        assert_eq!(config.clip.attempt_window, 5);
        assert_eq!(config.clip.policy, ExportPolicy::RequireFull);
        assert_eq!(config.audio.game_volume, 0.7);
        assert_eq!(config.audio.mic_volume, 0.3);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = br#"{ "capture": { "width": 1920, "height": 1080 }, "clip": { "policy": "require_any" } }"#;
        let config = RecorderConfig::from_json(json).unwrap();
        assert_eq!(config.capture.width, 1920);
        assert_eq!(config.capture.queue_capacity, 64);
        assert_eq!(config.clip.policy, ExportPolicy::RequireAny);
        assert_eq!(config.clip.attempt_window, 5);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RecorderConfig::default();
        config.capture.queue_capacity = 48;
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.clip.attempt_window = 0;
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.clip.lead_in_secs = -1.0;
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.audio.mic_volume = 1.5;
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.capture.frame_rate = FrameRate::new(0, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_required_markers() {
        assert_eq!(ExportPolicy::RequireFull.required_markers(5), 5);
        assert_eq!(ExportPolicy::RequireAny.required_markers(5), 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retrace.json");

        let mut config = RecorderConfig::default();
        config.encoder.video_bitrate_mbps = 12;
        config.capture.scaling = ScalingMode::Cpu;
        config.save(&path).unwrap();

        let loaded = RecorderConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RecorderConfig::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, RetraceError::Io(_)));
    }
}
