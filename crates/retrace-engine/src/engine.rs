//! The recording engine.
//!
//! One [`Engine`] is owned by the host and handed to every hook; there is
//! no process-wide state. A session runs three threads of its own (capture,
//! forwarding, encoder writer) and stops them all when it ends.

use crate::forward::{self, ForwardState};
use crate::naming;
use retrace_audio::{mix_game_and_mic, AudioChunk, MicBuffer, MixLevels};
use retrace_capture::{CaptureDevice, CaptureState, CaptureStats, FrameSource};
use retrace_core::{AttemptLedger, AttemptMarker, FramePool, RecorderConfig, Result, RetraceError};
use retrace_media::{
    ClipExporter, ClipReport, ClipTrimmer, Encoder, EncoderStats, FfmpegSinkFactory, FfmpegTrimmer, SinkFactory,
    StreamSpec,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// Microphone samples buffered, in seconds of audio.
const MIC_BUFFER_SECS: usize = 2;

/// Snapshot of what the engine has done this session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub recording: bool,
    pub capture_state: Option<CaptureState>,
    pub capture: CaptureStats,
    pub encoder: EncoderStats,
    /// Frames accepted by the encoder this session
    pub frames_forwarded: u64,
    /// Frames the encoder queue turned away
    pub frames_rejected: u64,
    pub attempts: usize,
}

struct Session {
    source: FrameSource,
    encoder: Arc<Encoder>,
    exporter: ClipExporter,
    forward: Arc<ForwardState>,
    forwarder: Option<JoinHandle<()>>,
    #[cfg(feature = "microphone")]
    microphone: Option<retrace_audio::MicrophoneCapture>,
}

/// Replay recorder owned by the host.
pub struct Engine {
    config: RecorderConfig,
    device: Arc<dyn CaptureDevice>,
    sink_factory: Arc<dyn SinkFactory>,
    trimmer: Arc<dyn ClipTrimmer>,
    ledger: Arc<AttemptLedger>,
    mic: Arc<MicBuffer>,
    session: Option<Session>,
}

impl Engine {
    /// Engine recording the primary display through ffmpeg.
    #[cfg(feature = "display")]
    pub fn new(config: RecorderConfig) -> Result<Self> {
        let ffmpeg = config.encoder.ffmpeg_path.clone();
        Self::with_components(
            config,
            Arc::new(retrace_capture::ScreenDisplay::new()),
            Arc::new(FfmpegSinkFactory::new(ffmpeg.clone())),
            Arc::new(FfmpegTrimmer::new(ffmpeg)),
        )
    }

    /// Display capture is not compiled in; use [`Engine::with_ffmpeg`] or
    /// [`Engine::with_components`] with an explicit capture device.
    #[cfg(not(feature = "display"))]
    pub fn new(config: RecorderConfig) -> Result<Self> {
        config.validate()?;
        Err(RetraceError::Config(
            "built without display capture; supply a capture device".to_string(),
        ))
    }

    /// Engine recording `device` through ffmpeg.
    pub fn with_ffmpeg(config: RecorderConfig, device: Arc<dyn CaptureDevice>) -> Result<Self> {
        let ffmpeg = config.encoder.ffmpeg_path.clone();
        Self::with_components(
            config,
            device,
            Arc::new(FfmpegSinkFactory::new(ffmpeg.clone())),
            Arc::new(FfmpegTrimmer::new(ffmpeg)),
        )
    }

    /// Engine with every external collaborator injected.
    pub fn with_components(
        config: RecorderConfig,
        device: Arc<dyn CaptureDevice>,
        sink_factory: Arc<dyn SinkFactory>,
        trimmer: Arc<dyn ClipTrimmer>,
    ) -> Result<Self> {
        config.validate()?;
        let ledger = Arc::new(AttemptLedger::new(config.clip.attempt_window));
        let mic_capacity = config.audio.sample_rate as usize * config.audio.channels as usize * MIC_BUFFER_SECS;
        Ok(Self {
            device,
            sink_factory,
            trimmer,
            ledger,
            mic: Arc::new(MicBuffer::new(mic_capacity)),
            session: None,
            config,
        })
    }

    /// Start capturing and encoding.
    ///
    /// On failure nothing is left running. Attempts from a previous session
    /// are discarded since frame numbering restarts at zero.
    pub fn session_start(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(RetraceError::SessionActive);
        }

        let capture = &self.config.capture;
        let pool = Arc::new(FramePool::new(
            capture.width,
            capture.height,
            capture.pixel_format,
            capture.pool_ceiling,
        ));

        let spec = StreamSpec::from_config(&self.config);
        let encoder = Arc::new(Encoder::start(
            self.sink_factory.as_ref(),
            spec,
            &self.config.encoder,
            Arc::clone(&pool),
        )?);

        let mut source = FrameSource::with_pool(capture.clone(), Arc::clone(&self.device), pool);
        let stream = match source.start() {
            Ok(stream) => stream,
            Err(e) => {
                encoder.stop();
                self.remove_container();
                return Err(e);
            }
        };

        self.ledger.clear();
        self.mic.clear();

        let state = Arc::new(ForwardState::default());
        let forwarder = {
            let encoder = Arc::clone(&encoder);
            let state = Arc::clone(&state);
            std::thread::Builder::new()
                .name("retrace-forward".to_string())
                .spawn(move || forward::run(stream, encoder, state))
        };
        let forwarder = match forwarder {
            Ok(handle) => handle,
            Err(e) => {
                source.stop();
                encoder.stop();
                self.remove_container();
                return Err(RetraceError::Internal(format!("Failed to spawn forwarding thread: {}", e)));
            }
        };

        let exporter = ClipExporter::new(
            Arc::clone(&self.trimmer),
            self.config.clip.clone(),
            self.config.capture.frame_rate,
            self.config.encoder.container_path.clone(),
        );

        self.session = Some(Session {
            source,
            encoder,
            exporter,
            forward: state,
            forwarder: Some(forwarder),
            #[cfg(feature = "microphone")]
            microphone: self.start_microphone(),
        });
        self.warn_if_microphone_unavailable();

        info!(
            container = %self.config.encoder.container_path.display(),
            window = self.config.clip.attempt_window,
            "Recording session started"
        );
        Ok(())
    }

    /// Stop the session and join its threads. Idempotent.
    pub fn session_stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        session.source.stop();
        session.forward.stop.store(true, Ordering::Release);
        if let Some(handle) = session.forwarder.take() {
            if handle.join().is_err() {
                error!("Forwarding thread panicked");
            }
        }
        session.encoder.stop();
        #[cfg(feature = "microphone")]
        {
            if let Some(mut mic) = session.microphone.take() {
                mic.stop();
            }
        }

        info!(
            frames = session.forward.accepted.load(Ordering::Relaxed),
            "Recording session stopped"
        );
        drop(session);
        self.remove_container();
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Record an attempt at the current position of the recording.
    pub fn record_attempt(&self, label: &str, sequence: u64) -> Result<AttemptMarker> {
        let session = self.session.as_ref().ok_or(RetraceError::NoSession)?;
        let frame = session.forward.accepted.load(Ordering::Acquire);
        Ok(self.ledger.record(frame, label, sequence))
    }

    /// Export the recent attempts to `output`, blocking until done.
    pub fn request_export(&self, output: &Path) -> Result<ClipReport> {
        let session = self.session.as_ref().ok_or(RetraceError::NoSession)?;
        session.exporter.export(&self.ledger, &session.encoder, output)
    }

    /// Export on a worker thread.
    pub fn request_export_in_background(&self, output: impl Into<PathBuf>) -> Result<ExportHandle> {
        let session = self.session.as_ref().ok_or(RetraceError::NoSession)?;
        let exporter = session.exporter.clone();
        let encoder = Arc::clone(&session.encoder);
        let ledger = Arc::clone(&self.ledger);
        let output = output.into();

        let thread = std::thread::Builder::new()
            .name("retrace-export".to_string())
            .spawn(move || exporter.export(&ledger, &encoder, &output))
            .map_err(|e| RetraceError::Internal(format!("Failed to spawn export thread: {}", e)))?;
        Ok(ExportHandle { thread })
    }

    /// Where the next clip would go, named after the attempts it covers.
    pub fn generate_suggested_filename(&self) -> PathBuf {
        let bounds = self.ledger.bounds();
        naming::suggested_filename(
            &self.config.clip.output_dir,
            bounds.as_ref().map(|(newest, oldest)| (newest, oldest)),
            chrono::Local::now(),
        )
    }

    /// Mix game audio with buffered microphone samples and queue it.
    ///
    /// Returns `false` if the chunk was not accepted.
    pub fn submit_audio(&self, game_samples: &[f32]) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        if !session.encoder.has_audio() {
            return false;
        }

        let audio = &self.config.audio;
        let mic = if audio.microphone { self.mic.take(game_samples.len()) } else { Vec::new() };
        let levels = MixLevels::from(audio);
        let mixed = mix_game_and_mic(game_samples, &mic, levels.game, levels.mic);
        session
            .encoder
            .submit_audio_chunk(AudioChunk::new(mixed, audio.channels, audio.sample_rate))
            .is_ok()
    }

    /// Microphone samples waiting to be mixed; hosts with their own input
    /// capture push into it directly.
    pub fn microphone_buffer(&self) -> &Arc<MicBuffer> {
        &self.mic
    }

    pub fn ledger(&self) -> &AttemptLedger {
        &self.ledger
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            attempts: self.ledger.len(),
            ..EngineStats::default()
        };
        if let Some(session) = &self.session {
            stats.recording = true;
            stats.capture_state = Some(session.source.state());
            stats.capture = session.source.stats();
            stats.encoder = session.encoder.stats();
            stats.frames_forwarded = session.forward.accepted.load(Ordering::Relaxed);
            stats.frames_rejected = session.forward.rejected.load(Ordering::Relaxed);
        }
        stats
    }

    /// Why capture stopped on its own during this session, if it did.
    pub fn capture_error(&self) -> Option<String> {
        self.session.as_ref().and_then(|s| s.source.last_error())
    }

    fn remove_container(&self) {
        let encoder = &self.config.encoder;
        if encoder.keep_container || !encoder.container_path.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&encoder.container_path) {
            warn!(path = %encoder.container_path.display(), "Failed to remove session container: {}", e);
        }
    }

    #[cfg(feature = "microphone")]
    fn start_microphone(&self) -> Option<retrace_audio::MicrophoneCapture> {
        let audio = &self.config.audio;
        if !(audio.enabled && audio.microphone) {
            return None;
        }
        match retrace_audio::MicrophoneCapture::start(Arc::clone(&self.mic), audio.channels, audio.sample_rate) {
            Ok(mic) => Some(mic),
            Err(e) => {
                warn!("Recording without microphone: {}", e);
                None
            }
        }
    }

    fn warn_if_microphone_unavailable(&self) {
        let audio = &self.config.audio;
        if cfg!(not(feature = "microphone")) && audio.enabled && audio.microphone {
            warn!("Built without microphone capture; only pushed microphone samples are mixed");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.session_stop();
    }
}

/// A clip export running on its own thread.
pub struct ExportHandle {
    thread: JoinHandle<Result<ClipReport>>,
}

impl ExportHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the export to finish.
    pub fn join(self) -> Result<ClipReport> {
        self.thread
            .join()
            .unwrap_or_else(|_| Err(RetraceError::Internal("export thread panicked".to_string())))
    }
}
