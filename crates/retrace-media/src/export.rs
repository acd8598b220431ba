//! Clip export from the live session container.
//!
//! The attempt ledger decides which stretch of the recording to keep; a
//! [`ClipTrimmer`] cuts that stretch out of the growing container into an
//! independent file. Stream copy is tried first, with one re-encode attempt
//! if it fails.

use crate::encoder::Encoder;
use retrace_core::{AttemptLedger, AttemptMarker, ClipSettings, FrameRate, Result, RetraceError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Clip range ──────────────────────────────────────────────────

/// Time span of a clip within the session container, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipRange {
    pub start: f64,
    pub duration: f64,
}

impl ClipRange {
    /// Range covering the attempts between `oldest_frame` and `newest_frame`.
    ///
    /// The minimum duration is applied before the lead-in and trailing pad,
    /// and the start never goes below zero.
    pub fn from_markers(
        oldest_frame: u64,
        newest_frame: u64,
        frame_rate: FrameRate,
        settings: &ClipSettings,
    ) -> Self {
        let start = frame_rate.frame_to_seconds(oldest_frame);
        let end = frame_rate.frame_to_seconds(newest_frame);
        let duration = (end - start).max(settings.min_duration_secs);
        let start = (start - settings.lead_in_secs).max(0.0);
        Self {
            start,
            duration: duration + settings.trail_secs,
        }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

impl fmt::Display for ClipRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s +{:.3}s", self.start, self.duration)
    }
}

// ── Trimming ────────────────────────────────────────────────────

/// How a clip was cut out of the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMethod {
    /// Packets copied as-is; fast, cuts land on keyframes
    StreamCopy,
    /// Decoded and re-encoded; slower, frame-accurate
    Reencode,
}

impl fmt::Display for ExportMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamCopy => f.write_str("stream copy"),
            Self::Reencode => f.write_str("re-encode"),
        }
    }
}

/// Cuts a time range out of a media file.
pub trait ClipTrimmer: Send + Sync {
    fn trim(&self, container: &Path, range: ClipRange, output: &Path, method: ExportMethod) -> Result<()>;
}

// ── Export ──────────────────────────────────────────────────────

/// Outcome of a successful export.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipReport {
    pub output: PathBuf,
    pub range: ClipRange,
    pub method: ExportMethod,
    /// Markers the range was computed from
    pub markers_used: usize,
    pub first_attempt: AttemptMarker,
    pub last_attempt: AttemptMarker,
}

/// Turns the ledger's attempt window into a clip file.
#[derive(Clone)]
pub struct ClipExporter {
    trimmer: Arc<dyn ClipTrimmer>,
    settings: ClipSettings,
    frame_rate: FrameRate,
    container: PathBuf,
}

impl ClipExporter {
    pub fn new(
        trimmer: Arc<dyn ClipTrimmer>,
        settings: ClipSettings,
        frame_rate: FrameRate,
        container: impl Into<PathBuf>,
    ) -> Self {
        Self {
            trimmer,
            settings,
            frame_rate,
            container: container.into(),
        }
    }

    /// Markers required before an export may run.
    pub fn required_markers(&self) -> usize {
        self.settings.policy.required_markers(self.settings.attempt_window)
    }

    /// Export the ledger's current window to `output`.
    ///
    /// Nothing is written at `output` unless the ledger satisfies the export
    /// policy and the encoder has been flushed.
    pub fn export(&self, ledger: &AttemptLedger, encoder: &Encoder, output: &Path) -> Result<ClipReport> {
        let markers = ledger.snapshot();
        let need = self.required_markers();
        if markers.len() < need {
            return Err(RetraceError::InsufficientMarkers {
                have: markers.len(),
                need,
            });
        }
        let (Some(newest), Some(oldest)) = (markers.first(), markers.last()) else {
            return Err(RetraceError::InsufficientMarkers { have: 0, need });
        };

        if same_path(output, &self.container) {
            return Err(RetraceError::Export(format!(
                "Refusing to overwrite the live recording at {}",
                output.display()
            )));
        }

        if !encoder.flush() {
            warn!("Exporting without a complete flush; the newest frames may be missing");
        }

        let range = ClipRange::from_markers(oldest.frame_number, newest.frame_number, self.frame_rate, &self.settings);
        info!(
            first = oldest.frame_number,
            last = newest.frame_number,
            markers = markers.len(),
            %range,
            "Exporting clip"
        );

        if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let method = self.trim_with_fallback(range, output)?;
        info!(output = %output.display(), %method, "Clip exported");

        Ok(ClipReport {
            output: output.to_path_buf(),
            range,
            method,
            markers_used: markers.len(),
            first_attempt: oldest.clone(),
            last_attempt: newest.clone(),
        })
    }

    fn trim_with_fallback(&self, range: ClipRange, output: &Path) -> Result<ExportMethod> {
        match self.trimmer.trim(&self.container, range, output, ExportMethod::StreamCopy) {
            Ok(()) => return Ok(ExportMethod::StreamCopy),
            Err(e) => {
                warn!("Stream copy failed, re-encoding: {}", e);
                remove_partial(output);
            }
        }
        match self.trimmer.trim(&self.container, range, output, ExportMethod::Reencode) {
            Ok(()) => Ok(ExportMethod::Reencode),
            Err(e) => {
                remove_partial(output);
                Err(RetraceError::Export(format!("Both trim attempts failed: {}", e)))
            }
        }
    }
}

/// Delete whatever a failed trim left at `output`.
fn remove_partial(output: &Path) {
    match std::fs::remove_file(output) {
        Ok(()) => debug!(output = %output.display(), "Removed partial clip"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(output = %output.display(), "Failed to remove partial clip: {}", e),
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
