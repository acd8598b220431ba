//! Capture device abstraction.
//!
//! A [`CaptureDevice`] is a shareable description of where frames come from;
//! it opens a [`CaptureBackend`] on the capture thread. Backends hold the
//! platform duplication handles and are never moved across threads.

use retrace_core::{CapturedImage, RetraceError};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed acquisition, classified for the capture loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// No new display content within the timeout; not an error for the loop.
    #[error("no new frame within the acquisition timeout")]
    Timeout,

    /// The capture session was invalidated and must be reopened.
    #[error("capture access lost: {0}")]
    AccessLost(String),

    #[error("capture failed: {0}")]
    Failed(String),
}

impl CaptureError {
    /// Classify an OS-level capture error.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::InvalidData => Self::AccessLost(err.to_string()),
            _ => Self::Failed(err.to_string()),
        }
    }
}

impl From<CaptureError> for RetraceError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::AccessLost(msg) => RetraceError::DeviceLost(msg),
            other => RetraceError::Capture(other.to_string()),
        }
    }
}

/// An open capture session on the capture thread.
pub trait CaptureBackend {
    /// Native size of captured images.
    fn size(&self) -> (u32, u32);

    /// Wait up to `timeout` for new display content.
    fn acquire(&mut self, timeout: Duration) -> Result<CapturedImage<'_>, CaptureError>;
}

/// Opens capture sessions. Shared between the owner and the capture thread.
pub trait CaptureDevice: Send + Sync {
    /// Acquire capture resources. Called on the capture thread, again after
    /// access loss.
    fn open(&self) -> Result<Box<dyn CaptureBackend>, CaptureError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let timeout = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(CaptureError::from_io(timeout), CaptureError::Timeout);

        let lost = io::Error::new(io::ErrorKind::ConnectionReset, "access lost");
        assert!(matches!(CaptureError::from_io(lost), CaptureError::AccessLost(_)));

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(CaptureError::from_io(other), CaptureError::Failed(_)));
    }

    #[test]
    fn test_access_lost_maps_to_device_lost() {
        let err: RetraceError = CaptureError::AccessLost("mode change".into()).into();
        assert!(matches!(err, RetraceError::DeviceLost(_)));
    }
}
