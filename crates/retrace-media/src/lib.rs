//! Retrace Media - encoding and clip export through ffmpeg
//!
//! This crate handles:
//! - The session encoder: non-blocking frame and audio queues drained by
//!   writer threads into a frame sink
//! - Frame sinks: an ffmpeg recording process, or memory for tests
//! - Clip export: trimming the attempt window out of the live container

pub mod encoder;
pub mod export;
pub mod ffmpeg;
pub mod sink;

pub use encoder::{Encoder, EncoderStats};
pub use export::{ClipExporter, ClipRange, ClipReport, ClipTrimmer, ExportMethod};
pub use ffmpeg::{locate_ffmpeg, FfmpegSink, FfmpegSinkFactory, FfmpegTrimmer, VideoCodec};
pub use sink::{
    write_frame_rows, AudioFormat, FrameSink, MemoryRecording, MemorySink, MemorySinkFactory, SinkFactory,
    StreamSpec,
};
