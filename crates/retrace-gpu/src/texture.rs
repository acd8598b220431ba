//! GPU texture management.

use retrace_core::{CapturedImage, Result, RetraceError};

/// A GPU texture together with its default view.
pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
}

impl GpuTexture {
    /// Create a new GPU texture with the given dimensions.
    pub fn new(
        device: &wgpu::Device,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
        label: Option<&str>,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label,
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            texture,
            view,
            width,
            height,
            format,
        }
    }

    /// Create a texture that receives captured desktop images (BGRA).
    pub fn capture_source(device: &wgpu::Device, width: u32, height: u32) -> Self {
        Self::new(
            device,
            width,
            height,
            wgpu::TextureFormat::Bgra8Unorm,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            Some("Capture Source Texture"),
        )
    }

    /// Create a target-resolution render target that can be copied out.
    pub fn render_target(device: &wgpu::Device, width: u32, height: u32) -> Self {
        Self::new(
            device,
            width,
            height,
            wgpu::TextureFormat::Rgba8Unorm,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            Some("Scale Target"),
        )
    }

    /// Upload a captured BGRA image to this texture.
    pub fn upload_image(&self, queue: &wgpu::Queue, image: &CapturedImage<'_>) -> Result<()> {
        if self.format != wgpu::TextureFormat::Bgra8Unorm {
            return Err(RetraceError::Gpu(
                "Captured images can only be uploaded to BGRA textures".to_string(),
            ));
        }

        if image.width != self.width || image.height != self.height {
            return Err(RetraceError::Gpu(format!(
                "Image size {}x{} doesn't match texture size {}x{}",
                image.width, image.height, self.width, self.height
            )));
        }

        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            image.data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(image.pitch as u32),
                rows_per_image: Some(self.height),
            },
            self.extent(),
        );

        Ok(())
    }

    pub fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }

    /// Memory usage estimate in bytes.
    pub fn memory_size(&self) -> usize {
        (self.width * self.height) as usize * 4
    }
}
