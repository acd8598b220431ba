//! Retrace Capture - display acquisition and paced frame production
//!
//! [`FrameSource`] runs the capture thread: it opens a [`CaptureDevice`],
//! scales each acquired image to the recording resolution and publishes the
//! frames through a lock-free ring buffer to a [`FrameStream`].

pub mod backend;
#[cfg(feature = "display")]
pub mod display;
pub mod source;
pub mod synthetic;

pub use backend::{CaptureBackend, CaptureDevice, CaptureError};
#[cfg(feature = "display")]
pub use display::ScreenDisplay;
pub use source::{CaptureState, CaptureStats, FrameSource, FrameStream};
pub use synthetic::{SyntheticControls, SyntheticDisplay};
