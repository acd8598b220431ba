//! Retrace Core - Foundation types for the replay recorder
//!
//! This crate provides the types shared by every pipeline stage:
//! - Frame buffers, pixel formats and the frame pool
//! - The lock-free frame ring buffer between capture and forwarding
//! - Frame rate arithmetic
//! - The attempt ledger that drives clip export
//! - Recorder configuration
//! - The scaler interface and the CPU scaler

pub mod config;
pub mod error;
pub mod frame;
pub mod ledger;
pub mod pool;
pub mod ring_buffer;
pub mod scale;
pub mod time;

pub use config::{
    AudioSettings, CaptureConfig, ClipSettings, EncoderConfig, ExportPolicy, RecorderConfig,
    ScalingMode,
};
pub use error::{Result, RetraceError};
pub use frame::{CapturedImage, PixelFormat, VideoFrame};
pub use ledger::{AttemptLedger, AttemptMarker};
pub use pool::FramePool;
pub use ring_buffer::{Consumer, Producer, RingBuffer};
pub use scale::{CpuScaler, Scaler};
pub use time::FrameRate;

/// Limits shared across the pipeline.
pub mod limits {
    /// Largest number of frames popped from the capture queue per forwarding pass
    pub const FORWARD_BATCH: usize = 8;

    /// Backpressure threshold: skip acquisition while the queue is at least this full (numerator / 4)
    pub const BACKPRESSURE_QUARTERS: usize = 3;

    /// Log dropped-frame counters every this many drops
    pub const DROP_LOG_INTERVAL: u64 = 64;
}
