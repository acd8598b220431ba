//! GPU scaling pipeline.
//!
//! Each tick: upload the captured BGRA image into a source texture, draw a
//! fullscreen triangle sampling it into a target-resolution render target,
//! copy the target into a mappable staging buffer and repack its padded rows
//! into the output frame.

use crate::context::GpuContext;
use crate::texture::GpuTexture;
use retrace_core::{CapturedImage, PixelFormat, Result, RetraceError, Scaler, VideoFrame};
use std::time::Duration;
use tracing::{debug, info, warn};

const SCALE_SHADER: &str = include_str!("shaders/scale.wgsl");

/// Upper bound on waiting for the staging buffer after the queue is idle.
const MAP_TIMEOUT: Duration = Duration::from_millis(250);

/// Row pitch of an RGBA texture copy, rounded up to the copy alignment.
pub fn padded_bytes_per_row(width: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (width * 4).div_ceil(align) * align
}

/// Copy RGBA rows with `padded_row` pitch into `frame`, converting to its format.
pub fn repack_rgba_rows(src: &[u8], padded_row: usize, frame: &mut VideoFrame) {
    let width = frame.width as usize;
    let format = frame.format;
    for y in 0..frame.height {
        let start = y as usize * padded_row;
        let src_row = &src[start..start + width * 4];
        let dst_row = frame.row_mut(y);
        match format {
            PixelFormat::Rgb24 => {
                for (s, d) in src_row.chunks_exact(4).zip(dst_row.chunks_exact_mut(3)) {
                    d.copy_from_slice(&s[..3]);
                }
            }
            PixelFormat::Bgra8 => {
                for (s, d) in src_row.chunks_exact(4).zip(dst_row.chunks_exact_mut(4)) {
                    d[0] = s[2];
                    d[1] = s[1];
                    d[2] = s[0];
                    d[3] = s[3];
                }
            }
        }
    }
}

struct SourceBinding {
    texture: GpuTexture,
    bind_group: wgpu::BindGroup,
}

/// Downscales captured images on the GPU.
pub struct GpuScaler {
    context: GpuContext,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    /// Recreated whenever the captured image size changes
    source: Option<SourceBinding>,
    target: GpuTexture,
    readback: wgpu::Buffer,
    padded_row: u32,
}

impl GpuScaler {
    /// Build the pipeline for `width`x`height` output frames.
    pub fn new(context: GpuContext, width: u32, height: u32) -> Result<Self> {
        let max = context.max_texture_dimension();
        if width == 0 || height == 0 || width > max || height > max {
            return Err(RetraceError::Gpu(format!(
                "Target size {}x{} outside device limits (max {})",
                width, height, max
            )));
        }

        let device = &context.device;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Scale Shader"),
            source: wgpu::ShaderSource::Wgsl(SCALE_SHADER.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Scale Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Scale Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Scale Pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Scale Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let target = GpuTexture::render_target(device, width, height);
        let padded_row = padded_bytes_per_row(width);
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Scale Readback"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        info!(width, height, "GPU scaler ready");

        Ok(Self {
            context,
            pipeline,
            bind_group_layout,
            sampler,
            source: None,
            target,
            readback,
            padded_row,
        })
    }

    /// Acquire a GPU and build the pipeline (blocking).
    pub fn new_blocking(width: u32, height: u32) -> Result<Self> {
        Self::new(GpuContext::new_blocking()?, width, height)
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    fn ensure_source(&mut self, width: u32, height: u32) {
        match &self.source {
            Some(source) if source.texture.width == width && source.texture.height == height => {}
            _ => {
                debug!(width, height, "Allocating capture source texture");
                let device = &self.context.device;
                let texture = GpuTexture::capture_source(device, width, height);
                let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Scale Bind Group"),
                    layout: &self.bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&texture.view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::Sampler(&self.sampler),
                        },
                    ],
                });
                self.source = Some(SourceBinding {
                    texture,
                    bind_group,
                });
            }
        }
    }

    /// Record the draw and the target-to-staging copy, then submit.
    fn render_and_copy(&self, bind_group: &wgpu::BindGroup) {
        let device = &self.context.device;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Scale Encoder"),
        });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Scale Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.draw(0..3, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.readback,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_row),
                    rows_per_image: Some(self.target.height),
                },
            },
            self.target.extent(),
        );

        self.context.queue.submit(Some(encoder.finish()));
    }

    /// Map the staging buffer and repack it into `frame`.
    ///
    /// Returns false when the buffer could not be mapped this tick.
    fn read_back(&self, frame: &mut VideoFrame) -> bool {
        let slice = self.readback.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.context.device.poll(wgpu::Maintain::Wait);

        match rx.recv_timeout(MAP_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Staging buffer map failed: {}", e);
                return false;
            }
            Err(_) => {
                warn!("Staging buffer map timed out");
                self.readback.unmap();
                return false;
            }
        }

        {
            let mapped = slice.get_mapped_range();
            repack_rgba_rows(&mapped, self.padded_row as usize, frame);
        }
        self.readback.unmap();
        true
    }
}

impl Scaler for GpuScaler {
    fn scale(&mut self, image: &CapturedImage<'_>, frame: &mut VideoFrame) -> Result<bool> {
        if self.context.is_lost() {
            return Err(RetraceError::DeviceLost("GPU device lost".to_string()));
        }
        if frame.width != self.target.width || frame.height != self.target.height {
            return Err(RetraceError::InvalidParameter(format!(
                "Frame size {}x{} doesn't match scaler target {}x{}",
                frame.width, frame.height, self.target.width, self.target.height
            )));
        }

        let max = self.context.max_texture_dimension();
        if image.width > max || image.height > max {
            return Err(RetraceError::Gpu(format!(
                "Captured image {}x{} exceeds device texture limit {}",
                image.width, image.height, max
            )));
        }

        self.ensure_source(image.width, image.height);
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| RetraceError::Internal("capture source texture missing".to_string()))?;
        source.texture.upload_image(&self.context.queue, image)?;

        self.render_and_copy(&source.bind_group);
        Ok(self.read_back(frame))
    }

    fn name(&self) -> &'static str {
        "gpu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_bytes_per_row() {
        assert_eq!(padded_bytes_per_row(1280), 5120);
        assert_eq!(padded_bytes_per_row(100), 512);
        assert_eq!(padded_bytes_per_row(1), 256);
    }

    #[test]
    fn test_repack_strips_padding_and_converts() {
        // 2x2 RGBA image with 256-byte padded rows.
        let padded = 256usize;
        let mut src = vec![0u8; padded * 2];
        src[0..8].copy_from_slice(&[1, 2, 3, 255, 4, 5, 6, 255]);
        src[padded..padded + 8].copy_from_slice(&[7, 8, 9, 255, 10, 11, 12, 255]);

        let mut rgb = VideoFrame::new(2, 2, PixelFormat::Rgb24);
        repack_rgba_rows(&src, padded, &mut rgb);
        assert_eq!(rgb.data, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);

        let mut bgra = VideoFrame::new(2, 2, PixelFormat::Bgra8);
        repack_rgba_rows(&src, padded, &mut bgra);
        assert_eq!(&bgra.data[0..4], &[3, 2, 1, 255]);
    }

    #[test]
    #[ignore] // Needs a GPU adapter. Run with: cargo test -p retrace-gpu -- --ignored
    fn test_gpu_scale_solid_color() {
        let mut scaler = GpuScaler::new_blocking(64, 36).unwrap();

        // Solid BGRA (B=10, G=20, R=30) at 128x72.
        let data: Vec<u8> = [10u8, 20, 30, 255].repeat(128 * 72);
        let image = CapturedImage::new(&data, 128, 72, 128 * 4).unwrap();
        let mut frame = VideoFrame::new(64, 36, PixelFormat::Rgb24);

        assert!(scaler.scale(&image, &mut frame).unwrap());
        assert_eq!(&frame.row(10)[30..33], &[30, 20, 10]);
    }
}
