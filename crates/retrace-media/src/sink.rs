//! Frame sinks: where the encoder writer threads deliver raw bytes.
//!
//! A sink is launched once per recording session and receives every
//! accepted frame in order. [`crate::FfmpegSinkFactory`] pipes into an
//! external ffmpeg process; [`MemorySinkFactory`] keeps everything in memory
//! so the pipeline can be exercised without spawning processes.

use parking_lot::Mutex;
use retrace_core::{FrameRate, PixelFormat, RecorderConfig, Result, VideoFrame};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Raw audio layout fed alongside the video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Everything a sink needs to know about the stream it will receive.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: FrameRate,
    /// `None` for a video-only recording
    pub audio: Option<AudioFormat>,
    /// The continuously growing container
    pub container: PathBuf,
    pub video_bitrate_mbps: u32,
    pub hardware_acceleration: bool,
    /// Audio chunks queued before new ones are dropped
    pub audio_queue_capacity: usize,
}

impl StreamSpec {
    pub fn from_config(config: &RecorderConfig) -> Self {
        let audio = config.audio.enabled.then(|| AudioFormat {
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
        });
        Self {
            width: config.capture.width,
            height: config.capture.height,
            pixel_format: config.capture.pixel_format,
            frame_rate: config.capture.frame_rate,
            audio,
            container: config.encoder.container_path.clone(),
            video_bitrate_mbps: config.encoder.video_bitrate_mbps,
            hardware_acceleration: config.encoder.hardware_acceleration,
            audio_queue_capacity: config.audio.queue_capacity,
        }
    }

    /// Bytes of one frame as written to the sink (no row padding).
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

/// Destination of one session's raw frames.
pub trait FrameSink: Send {
    /// Write one frame's visible pixels.
    fn write_frame(&mut self, frame: &VideoFrame) -> io::Result<()>;

    /// Hand out the raw `f32le` audio input, if the stream has one.
    ///
    /// Called at most once, before any frame is written.
    fn take_audio_writer(&mut self) -> Option<Box<dyn Write + Send>>;

    /// Close the inputs and wait up to `grace` for the sink to finish.
    fn close(&mut self, grace: Duration) -> io::Result<()>;
}

/// Launches a sink at session start.
pub trait SinkFactory: Send + Sync {
    fn launch(&self, spec: &StreamSpec) -> Result<Box<dyn FrameSink>>;
}

/// Write the visible rows of `frame`, skipping any row padding.
pub fn write_frame_rows<W: Write + ?Sized>(out: &mut W, frame: &VideoFrame) -> io::Result<()> {
    if frame.is_packed() {
        let len = frame.row_bytes() * frame.height as usize;
        return out.write_all(&frame.data[..len]);
    }
    for y in 0..frame.height {
        out.write_all(frame.row(y))?;
    }
    Ok(())
}

/// What a [`MemorySink`] has received so far.
#[derive(Debug, Default)]
pub struct MemoryRecording {
    /// Frame numbers in write order
    pub frame_numbers: Vec<u64>,
    /// Concatenated frame bytes
    pub video: Vec<u8>,
    /// Concatenated `f32le` audio bytes
    pub audio: Vec<u8>,
    pub launches: usize,
    pub closed: bool,
}

#[derive(Debug, Default)]
struct MemoryShared {
    recording: Mutex<MemoryRecording>,
    fail_after: Mutex<Option<usize>>,
    fail_launch: Mutex<bool>,
}

/// Factory for in-memory sinks sharing one [`MemoryRecording`].
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    shared: Arc<MemoryShared>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make frame writes fail once `frames` frames have been written.
    pub fn fail_after(&self, frames: usize) {
        *self.shared.fail_after.lock() = Some(frames);
    }

    /// Make the next launches fail as if the encoder could not be spawned.
    pub fn fail_launch(&self, fail: bool) {
        *self.shared.fail_launch.lock() = fail;
    }

    /// Run `f` against the recording.
    pub fn with_recording<R>(&self, f: impl FnOnce(&MemoryRecording) -> R) -> R {
        f(&self.shared.recording.lock())
    }

    pub fn frame_numbers(&self) -> Vec<u64> {
        self.with_recording(|r| r.frame_numbers.clone())
    }
}

impl SinkFactory for MemorySinkFactory {
    fn launch(&self, spec: &StreamSpec) -> Result<Box<dyn FrameSink>> {
        if *self.shared.fail_launch.lock() {
            return Err(retrace_core::RetraceError::Encoder(
                "in-memory sink refused to launch".to_string(),
            ));
        }
        let mut recording = self.shared.recording.lock();
        recording.launches += 1;
        recording.closed = false;
        Ok(Box::new(MemorySink {
            shared: Arc::clone(&self.shared),
            has_audio: spec.audio.is_some(),
            scratch: Vec::with_capacity(spec.frame_size()),
        }))
    }
}

/// Sink that appends everything to a shared [`MemoryRecording`].
#[derive(Debug)]
pub struct MemorySink {
    shared: Arc<MemoryShared>,
    has_audio: bool,
    scratch: Vec<u8>,
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, frame: &VideoFrame) -> io::Result<()> {
        let written = self.shared.recording.lock().frame_numbers.len();
        if let Some(limit) = *self.shared.fail_after.lock() {
            if written >= limit {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
            }
        }

        self.scratch.clear();
        write_frame_rows(&mut self.scratch, frame)?;
        let mut recording = self.shared.recording.lock();
        recording.frame_numbers.push(frame.frame_number);
        recording.video.extend_from_slice(&self.scratch);
        Ok(())
    }

    fn take_audio_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        if !std::mem::take(&mut self.has_audio) {
            return None;
        }
        Some(Box::new(MemoryAudioWriter {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn close(&mut self, _grace: Duration) -> io::Result<()> {
        self.shared.recording.lock().closed = true;
        Ok(())
    }
}

struct MemoryAudioWriter {
    shared: Arc<MemoryShared>,
}

impl Write for MemoryAudioWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.recording.lock().audio.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
