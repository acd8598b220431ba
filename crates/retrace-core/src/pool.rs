//! Frame buffer pool for allocation-free capture.
//!
//! Avoids allocating a frame-sized buffer per captured frame by keeping
//! a bounded stack of idle buffers of one fixed size.

use crate::frame::{PixelFormat, VideoFrame};
use parking_lot::Mutex;
use std::time::Duration;

/// Pool of reusable frame buffers of a single size.
pub struct FramePool {
    width: u32,
    height: u32,
    format: PixelFormat,
    /// Idle buffers ready to be handed out.
    free: Mutex<Vec<Vec<u8>>>,
    /// Maximum number of idle buffers kept around.
    ceiling: usize,
}

impl FramePool {
    /// Create a pool producing `width`x`height` frames in `format`.
    pub fn new(width: u32, height: u32, format: PixelFormat, ceiling: usize) -> Self {
        Self {
            width,
            height,
            format,
            free: Mutex::new(Vec::with_capacity(ceiling)),
            ceiling,
        }
    }

    /// Size in bytes of every buffer this pool hands out.
    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    /// Take a frame from the pool or allocate a new one.
    ///
    /// Metadata is reset; pixel contents are whatever the previous owner left.
    pub fn acquire(&self) -> VideoFrame {
        let recycled = self.free.lock().pop();
        let size = self.frame_size();
        let data = match recycled {
            Some(buffer) => buffer,
            None => vec![0u8; size],
        };

        VideoFrame {
            data,
            width: self.width,
            height: self.height,
            pitch: self.width as usize * self.format.bytes_per_pixel(),
            format: self.format,
            frame_number: 0,
            timestamp: Duration::ZERO,
        }
    }

    /// Return a frame to the pool for reuse.
    ///
    /// Frames of a different size are dropped, as are frames arriving when
    /// the pool already holds `ceiling` idle buffers.
    pub fn release(&self, frame: VideoFrame) {
        if frame.data.len() != self.frame_size() {
            return; // buffer is dropped
        }

        let mut free = self.free.lock();
        if free.len() >= self.ceiling {
            return; // buffer is dropped
        }
        free.push(frame.data);
    }

    /// Number of idle buffers in the pool.
    pub fn idle_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Maximum number of idle buffers retained.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Drop all idle buffers.
    pub fn clear(&self) {
        self.free.lock().clear();
    }
}
