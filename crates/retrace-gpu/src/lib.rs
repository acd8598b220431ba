//! Retrace GPU - wgpu-based frame scaling
//!
//! Owns the GPU device used by the capture thread and the render pipeline
//! that resamples captured desktop images to the recording resolution.

pub mod context;
pub mod scaler;
pub mod texture;

pub use context::GpuContext;
pub use scaler::GpuScaler;
pub use texture::GpuTexture;
