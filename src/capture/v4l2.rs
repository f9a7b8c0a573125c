//! V4L2 capture device with memory-mapped buffers

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{Frame, FrameMetadata};
use super::source::{ControlInfo, DeviceStatus, FrameSource, SourceFormat};
use crate::error::SourceError;

const ENODEV: i32 = 19;

/// Map transport errors, making a vanished device sticky
fn classify(err: io::Error) -> SourceError {
    match err.raw_os_error() {
        Some(ENODEV) => SourceError::Disconnected,
        _ => SourceError::Io(err),
    }
}

/// Capture source backed by a V4L2 video node
pub struct V4l2Capture {
    path: PathBuf,
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    format: SourceFormat,
    buffer_count: u32,
    sequence: u64,
    disconnected: bool,
}

impl V4l2Capture {
    /// Open the node and check it can capture video
    pub fn open(path: &Path, format: SourceFormat, buffer_count: u32) -> Result<Self, SourceError> {
        info!("Initializing V4L2 capture: {}", path.display());

        let device = Device::with_path(path).map_err(classify)?;

        let caps = device.query_caps().map_err(classify)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(SourceError::Format("device doesn't support video capture".into()));
        }

        let mut capture = Self {
            path: path.to_path_buf(),
            device: Box::new(device),
            stream: None,
            format,
            buffer_count: buffer_count.max(2),
            sequence: 0,
            disconnected: false,
        };
        capture.negotiate(format)?;
        Ok(capture)
    }

    fn negotiate(&mut self, format: SourceFormat) -> Result<(), SourceError> {
        let fourcc = format
            .format
            .fourcc()
            .ok_or_else(|| SourceError::Format(format!("{:?} is not a device format", format.format)))?;

        let mut fmt = self.device.format().map_err(classify)?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = FourCC::new(&fourcc);
        let actual = self.device.set_format(&fmt).map_err(classify)?;

        if actual.width != format.width
            || actual.height != format.height
            || actual.fourcc != FourCC::new(&fourcc)
        {
            return Err(SourceError::Format(format!(
                "device negotiated {}x{} {} instead of {}x{} {:?}",
                actual.width, actual.height, actual.fourcc, format.width, format.height, format.format
            )));
        }
        self.format = format;
        Ok(())
    }
}

impl FrameSource for V4l2Capture {
    fn name(&self) -> &str {
        self.path.to_str().unwrap_or("v4l2")
    }

    fn set_format(&mut self, format: SourceFormat) -> Result<(), SourceError> {
        if self.stream.is_some() {
            return Err(SourceError::Format("format change while streaming".into()));
        }
        self.negotiate(format)
    }

    fn format(&self) -> SourceFormat {
        self.format
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn start(&mut self) -> Result<(), SourceError> {
        if self.disconnected {
            return Err(SourceError::Disconnected);
        }
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
            .map_err(classify)?;
        self.stream = Some(stream);
        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        // Dropping the stream turns it off and unmaps the buffers
        if self.stream.take().is_some() {
            debug!("Capture stream stopped");
        }
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    fn acquire(&mut self, timeout: Duration) -> Result<Option<Frame>, SourceError> {
        if self.disconnected {
            return Err(SourceError::Disconnected);
        }
        let stream = self.stream.as_mut().ok_or(SourceError::NotStreaming)?;
        stream.set_timeout(timeout);

        let timestamp = Instant::now();
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => {
                let err = classify(e);
                if matches!(err, SourceError::Disconnected) {
                    warn!("V4L2 device {} disconnected", self.path.display());
                    self.disconnected = true;
                }
                return Err(err);
            }
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence += 1;

        Ok(Some(Frame {
            data,
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                width: self.format.width,
                height: self.format.height,
                stride: self.format.width,
                format: self.format.format,
                device_timestamp: Some(
                    Duration::from_secs(meta.timestamp.sec as u64)
                        + Duration::from_micros(meta.timestamp.usec as u64),
                ),
            }),
            timestamp,
        }))
    }

    fn release(&mut self, _frame: Frame) {
        // The mmap buffer was requeued by the next dequeue; the copy is dropped here
    }

    fn query_controls(&self) -> Vec<ControlInfo> {
        match self.device.query_controls() {
            Ok(controls) => controls
                .into_iter()
                .map(|c| ControlInfo {
                    name: c.name,
                    min: c.minimum,
                    max: c.maximum,
                    step: c.step as i64,
                    default: c.default,
                })
                .collect(),
            Err(e) => {
                warn!("Failed to query controls: {}", e);
                Vec::new()
            }
        }
    }

    fn status(&self) -> DeviceStatus {
        if self.disconnected {
            DeviceStatus::Disconnected
        } else {
            DeviceStatus::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enodev_is_disconnect() {
        assert!(matches!(
            classify(io::Error::from_raw_os_error(ENODEV)),
            SourceError::Disconnected
        ));
        assert!(matches!(
            classify(io::Error::from_raw_os_error(5)),
            SourceError::Io(_)
        ));
    }
}
