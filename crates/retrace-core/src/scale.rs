//! Downscaling of captured desktop images into output frames.

use crate::error::{Result, RetraceError};
use crate::frame::{CapturedImage, VideoFrame};

/// Converts a captured BGRA image into an output frame of fixed size.
///
/// Implementations live on the capture thread and are not shared.
pub trait Scaler {
    /// Scale `image` into `frame`, converting to the frame's pixel format.
    ///
    /// Returns `Ok(false)` when this tick produced no frame (for example the
    /// GPU readback could not be mapped). Errors are fatal to the scaler.
    fn scale(&mut self, image: &CapturedImage<'_>, frame: &mut VideoFrame) -> Result<bool>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Nearest-neighbour scaler running on the CPU.
#[derive(Debug, Default)]
pub struct CpuScaler {
    /// Source column for each output column, cached per (src, dst) width pair
    x_map: Vec<u32>,
    mapped_widths: (u32, u32),
}

impl CpuScaler {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_column_map(&mut self, src_width: u32, dst_width: u32) {
        if self.mapped_widths != (src_width, dst_width) || self.x_map.len() != dst_width as usize {
            self.x_map = (0..dst_width)
                .map(|x| source_index(x, src_width, dst_width))
                .collect();
            self.mapped_widths = (src_width, dst_width);
        }
    }
}

#[inline]
fn source_index(dst: u32, src_len: u32, dst_len: u32) -> u32 {
    let idx = (dst as u64 * src_len as u64 / dst_len as u64) as u32;
    idx.min(src_len - 1)
}

impl Scaler for CpuScaler {
    fn scale(&mut self, image: &CapturedImage<'_>, frame: &mut VideoFrame) -> Result<bool> {
        if frame.width == 0 || frame.height == 0 {
            return Err(RetraceError::InvalidParameter("output frame has zero size".into()));
        }

        let bpp = frame.format.bytes_per_pixel();
        let format = frame.format;
        let (dst_width, dst_height) = (frame.width, frame.height);
        self.update_column_map(image.width, dst_width);
        let x_map = &self.x_map;

        for y in 0..dst_height {
            let src_y = source_index(y, image.height, dst_height);
            let row = frame.row_mut(y);
            for (x, &src_x) in x_map.iter().enumerate() {
                let px = image.pixel(src_x, src_y);
                format.store_bgra(px, &mut row[x * bpp..(x + 1) * bpp]);
            }
        }
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "cpu"
    }
}
