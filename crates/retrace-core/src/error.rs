//! Error types for Retrace.

use thiserror::Error;

/// Main error type for Retrace operations.
#[derive(Error, Debug)]
pub enum RetraceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Capture device lost: {0}")]
    DeviceLost(String),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Not enough attempts recorded: {have} of {need}")]
    InsufficientMarkers { have: usize, need: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("A recording session is already running")]
    SessionActive,

    #[error("No recording session is running")]
    NoSession,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Retrace operations.
pub type Result<T> = std::result::Result<T, RetraceError>;
