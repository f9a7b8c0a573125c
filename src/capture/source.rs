//! Hardware frame source capability interface
//!
//! Every transport (synthetic scene, V4L2 device, test doubles) implements
//! [`FrameSource`]. The capture loop owns exactly one boxed source and never
//! cares which variant it talks to.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::frame::{CaptureSettings, Frame, PixelFormat};
use crate::error::SourceError;

/// Negotiated capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Negotiated for a still capture rather than a preview stream
    #[serde(default)]
    pub still: bool,
}

impl SourceFormat {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            still: false,
        }
    }

    /// A stream restart is only needed when geometry or pixel layout changes
    pub fn needs_restart(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.width != width || self.height != height || self.format != format
    }
}

/// Sticky device health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Ok,
    /// The transport went away; no further frames will arrive
    Disconnected,
}

/// One adjustable device control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub name: String,
    pub min: i64,
    pub max: i64,
    pub step: i64,
    pub default: i64,
}

/// Capture source capability interface
pub trait FrameSource: Send {
    /// Human readable name for logs
    fn name(&self) -> &str;

    /// Negotiate geometry and pixel layout. Only valid while stopped.
    fn set_format(&mut self, format: SourceFormat) -> Result<(), SourceError>;

    /// Currently negotiated format
    fn format(&self) -> SourceFormat;

    fn start(&mut self) -> Result<(), SourceError>;

    fn stop(&mut self) -> Result<(), SourceError>;

    fn is_streaming(&self) -> bool;

    /// Dequeue one filled frame, waiting at most `timeout`.
    ///
    /// `Ok(None)` means no frame was ready in time, a transient condition the
    /// caller may retry. [`SourceError::Disconnected`] is sticky.
    fn acquire(&mut self, timeout: Duration) -> Result<Option<Frame>, SourceError>;

    /// Return a frame to the device queue
    fn release(&mut self, frame: Frame);

    /// Sensor settings for the frame about to be captured
    fn apply_settings(&mut self, _settings: &CaptureSettings) {}

    fn query_controls(&self) -> Vec<ControlInfo> {
        Vec::new()
    }

    fn status(&self) -> DeviceStatus;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn set_format(&mut self, format: SourceFormat) -> Result<(), SourceError> {
        (**self).set_format(format)
    }

    fn format(&self) -> SourceFormat {
        (**self).format()
    }

    fn start(&mut self) -> Result<(), SourceError> {
        (**self).start()
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        (**self).stop()
    }

    fn is_streaming(&self) -> bool {
        (**self).is_streaming()
    }

    fn acquire(&mut self, timeout: Duration) -> Result<Option<Frame>, SourceError> {
        (**self).acquire(timeout)
    }

    fn release(&mut self, frame: Frame) {
        (**self).release(frame)
    }

    fn apply_settings(&mut self, settings: &CaptureSettings) {
        (**self).apply_settings(settings)
    }

    fn query_controls(&self) -> Vec<ControlInfo> {
        (**self).query_controls()
    }

    fn status(&self) -> DeviceStatus {
        (**self).status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_restart() {
        let fmt = SourceFormat::new(640, 480, PixelFormat::Yuyv);
        assert!(!fmt.needs_restart(640, 480, PixelFormat::Yuyv));
        assert!(fmt.needs_restart(1280, 720, PixelFormat::Yuyv));
        assert!(fmt.needs_restart(640, 480, PixelFormat::Mjpeg));
    }
}
