//! Frame buffer types for captured video frames in CPU memory.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pixel layout of frames handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit packed RGB (24 bits per pixel)
    #[default]
    Rgb24,
    /// 8-bit packed BGRA (32 bits per pixel), the native desktop layout
    Bgra8,
}

impl PixelFormat {
    /// Bytes per pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb24 => 3,
            Self::Bgra8 => 4,
        }
    }

    /// Name of this layout for ffmpeg's `-pixel_format` option.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Rgb24 => "rgb24",
            Self::Bgra8 => "bgra",
        }
    }

    /// Calculate total bytes needed for a tightly packed frame of this format.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }

    /// Write one BGRA source pixel into `dst` in this layout.
    #[inline]
    pub fn store_bgra(self, bgra: &[u8], dst: &mut [u8]) {
        match self {
            Self::Rgb24 => {
                dst[0] = bgra[2];
                dst[1] = bgra[1];
                dst[2] = bgra[0];
            }
            Self::Bgra8 => dst[..4].copy_from_slice(&bgra[..4]),
        }
    }
}

/// One captured, scaled frame.
///
/// The byte buffer has a fixed capacity of `pitch * height`; buffers are
/// recycled through [`crate::FramePool`] so the capture loop does not
/// allocate per frame. Exactly one pipeline stage owns a frame at a time.
#[derive(Debug)]
pub struct VideoFrame {
    /// Pixel data, `pitch * height` bytes
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bytes per row (may include padding)
    pub pitch: usize,
    /// Pixel layout of `data`
    pub format: PixelFormat,
    /// Monotonic frame number assigned by the stage that last renumbered it
    pub frame_number: u64,
    /// Capture time relative to session start
    pub timestamp: Duration,
}

impl VideoFrame {
    /// Allocate a zeroed, tightly packed frame.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let pitch = width as usize * format.bytes_per_pixel();
        Self {
            data: vec![0u8; pitch * height as usize],
            width,
            height,
            pitch,
            format,
            frame_number: 0,
            timestamp: Duration::ZERO,
        }
    }

    /// Bytes of visible pixels per row (pitch without padding).
    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Get a row of pixel data.
    #[inline]
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.pitch;
        &self.data[start..start + self.row_bytes()]
    }

    /// Get a mutable row of pixel data.
    #[inline]
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.pitch;
        let len = self.row_bytes();
        &mut self.data[start..start + len]
    }

    /// Whether rows can be written to the encoder in one contiguous slice.
    pub fn is_packed(&self) -> bool {
        self.pitch == self.row_bytes()
    }

    /// Total memory usage of this frame in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.capacity()
    }
}

/// A borrowed BGRA image as delivered by a capture backend.
#[derive(Debug, Clone, Copy)]
pub struct CapturedImage<'a> {
    /// BGRA pixel rows, `pitch * height` bytes
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes per source row
    pub pitch: usize,
}

impl<'a> CapturedImage<'a> {
    /// Wrap a BGRA buffer, checking that it covers `height` rows of `pitch` bytes.
    pub fn new(data: &'a [u8], width: u32, height: u32, pitch: usize) -> Option<Self> {
        if width == 0 || height == 0 || pitch < width as usize * 4 {
            return None;
        }
        if data.len() < pitch * (height as usize - 1) + width as usize * 4 {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
            pitch,
        })
    }

    /// BGRA bytes of the pixel at (x, y).
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> &'a [u8] {
        let offset = y as usize * self.pitch + x as usize * 4;
        &self.data[offset..offset + 4]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb24_frame_size() {
        let frame = VideoFrame::new(1280, 720, PixelFormat::Rgb24);
        assert_eq!(frame.pitch, 1280 * 3);
        assert_eq!(frame.data.len(), 1280 * 720 * 3);
        assert!(frame.is_packed());
    }

    #[test]
    fn test_store_bgra_swizzles_for_rgb() {
        let mut out = [0u8; 3];
        PixelFormat::Rgb24.store_bgra(&[10, 20, 30, 255], &mut out);
        assert_eq!(out, [30, 20, 10]);

        let mut out = [0u8; 4];
        PixelFormat::Bgra8.store_bgra(&[10, 20, 30, 255], &mut out);
        assert_eq!(out, [10, 20, 30, 255]);
    }

    #[test]
    fn test_captured_image_rejects_short_buffer() {
        let data = vec![0u8; 16];
        assert!(CapturedImage::new(&data, 2, 2, 8).is_some());
        assert!(CapturedImage::new(&data, 2, 3, 8).is_none());
        assert!(CapturedImage::new(&data, 4, 2, 8).is_none());
    }

    #[test]
    fn test_ffmpeg_names() {
        assert_eq!(PixelFormat::Rgb24.ffmpeg_name(), "rgb24");
        assert_eq!(PixelFormat::Bgra8.ffmpeg_name(), "bgra");
    }
}
