//! Error types for the capture pipeline

use thiserror::Error;

use crate::capture::PixelFormat;

/// Result type alias using PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors reported by a hardware frame source
#[derive(Debug, Error)]
pub enum SourceError {
    /// The transport is gone. Sticky: every later call reports it again.
    #[error("Capture device disconnected")]
    Disconnected,

    /// Acquire was called while the stream is off
    #[error("Stream is not running")]
    NotStreaming,

    /// The device refused the requested format
    #[error("Format negotiation failed: {0}")]
    Format(String),

    /// I/O error talking to the device
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Whether the error ends the session
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Disconnected)
    }
}

/// Pixel conversion errors
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Source frame too short: expected {expected} bytes, got {actual}")]
    ShortFrame { expected: usize, actual: usize },

    #[error("Cannot convert {from:?} into {to:?}")]
    Unsupported { from: PixelFormat, to: PixelFormat },

    #[error("MJPEG decode failed: {0}")]
    Decode(String),

    #[error("Invalid geometry {width}x{height}")]
    Geometry { width: u32, height: u32 },
}

/// Still-image encode errors
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("No still-image destination buffer in job")]
    MissingDestination,

    #[error("No auxiliary source buffer in job")]
    MissingSource,

    #[error("Encoded image ({needed} bytes) does not fit buffer capacity {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Convert(#[from] ConvertError),
}

impl From<image::ImageError> for EncodeError {
    fn from(err: image::ImageError) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Device registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No free capture device")]
    Exhausted,

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Device {0} is in use by another session")]
    InUse(String),

    #[error("Device {0} is not owned by this session")]
    NotOwner(String),
}

/// Top-level pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Capture request rejected before it entered the pipeline
    #[error("Invalid capture request: {0}")]
    InvalidRequest(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The session hit a fatal device error
    #[error("Capture device lost")]
    DeviceLost,

    #[error("Pipeline is shut down")]
    ShutDown,

    #[error("Failed to spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
}

impl PipelineError {
    /// Create an InvalidRequest error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}
