use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::ops::Add;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ConvertError;
use crate::utils::{align_up, monotonic_ns};

/// Raw device frame with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Dequeue timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    /// Bytes the device actually filled
    pub fn bytes_used(&self) -> usize {
        self.data.len()
    }

    /// Uncompressed frames must be complete; a short payload means the
    /// device handed back a partially filled buffer.
    pub fn is_complete(&self) -> bool {
        match self.meta.format.frame_size(self.meta.width, self.meta.height) {
            Some(expected) => self.data.len() >= expected,
            None => !self.data.is_empty(),
        }
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 4:2:2, Y0 U Y1 V
    Yuyv,
    /// Semi-planar 4:2:0, Y plane then interleaved V/U
    Nv21,
    /// Planar 4:2:0, Y plane then V plane then U plane
    Yv12,
    /// Motion JPEG, only produced by sources
    Mjpeg,
    /// 8-bit RGB, used for auxiliary still sources
    Rgb24,
    /// Compressed still image container
    Blob,
}

impl PixelFormat {
    /// Tightly packed frame size, `None` for compressed formats
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Yuyv => Some(w * h * 2),
            PixelFormat::Nv21 => Some(w * h * 3 / 2),
            PixelFormat::Yv12 => Some(yv12_size(w, h)),
            PixelFormat::Rgb24 => Some(w * h * 3),
            PixelFormat::Mjpeg | PixelFormat::Blob => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::Blob)
    }

    /// V4L2 fourcc for device negotiation
    pub fn fourcc(self) -> Option<[u8; 4]> {
        match self {
            PixelFormat::Yuyv => Some(*b"YUYV"),
            PixelFormat::Nv21 => Some(*b"NV21"),
            PixelFormat::Yv12 => Some(*b"YV12"),
            PixelFormat::Mjpeg => Some(*b"MJPG"),
            PixelFormat::Rgb24 => Some(*b"RGB3"),
            PixelFormat::Blob => None,
        }
    }
}

/// Chroma row stride of a YV12 buffer with the given luma stride
pub fn yv12_chroma_stride(stride: usize) -> usize {
    align_up(stride / 2, 16)
}

/// Size of a YV12 buffer: full luma plane plus two 16-aligned chroma planes
pub fn yv12_size(stride: usize, height: usize) -> usize {
    let c_stride = yv12_chroma_stride(stride);
    stride * height + 2 * c_stride * (height / 2)
}

/// Owned pixel storage tagged with its layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageData {
    Yuyv(Vec<u8>),
    Nv21(Vec<u8>),
    Yv12(Vec<u8>),
    Rgb24(Vec<u8>),
    Blob(Vec<u8>),
}

impl ImageData {
    pub fn format(&self) -> PixelFormat {
        match self {
            ImageData::Yuyv(_) => PixelFormat::Yuyv,
            ImageData::Nv21(_) => PixelFormat::Nv21,
            ImageData::Yv12(_) => PixelFormat::Yv12,
            ImageData::Rgb24(_) => PixelFormat::Rgb24,
            ImageData::Blob(_) => PixelFormat::Blob,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ImageData::Yuyv(d)
            | ImageData::Nv21(d)
            | ImageData::Yv12(d)
            | ImageData::Rgb24(d)
            | ImageData::Blob(d) => d,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            ImageData::Yuyv(d)
            | ImageData::Nv21(d)
            | ImageData::Yv12(d)
            | ImageData::Rgb24(d)
            | ImageData::Blob(d) => d,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

/// Logical stream identifier. Positive ids are caller streams, zero and
/// negative ids mark pipeline-internal auxiliary buffers.
pub type StreamId = i32;

/// Stream id given to auxiliary still-source buffers
pub const AUX_STREAM_ID: StreamId = 0;

/// Completion status of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Pending,
    Ok,
    Error,
}

/// Shareable memory handle (e.g. a dma-buf fd) passed through untouched for
/// zero-copy hand-off to offload engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareHandle(pub i32);

/// One destination image buffer
#[derive(Debug)]
pub struct StreamBuffer {
    pub stream_id: StreamId,
    pub width: u32,
    pub height: u32,
    /// Row stride in pixels
    pub stride: u32,
    pub data: ImageData,
    pub status: BufferStatus,
    pub share_handle: Option<ShareHandle>,
}

impl StreamBuffer {
    /// Allocate a tightly strided buffer of the given format
    pub fn new(
        stream_id: StreamId,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, ConvertError> {
        if width == 0 || height == 0 {
            return Err(ConvertError::Geometry { width, height });
        }
        let (w, h) = (width as usize, height as usize);
        let data = match format {
            PixelFormat::Yuyv => ImageData::Yuyv(vec![0; w * h * 2]),
            PixelFormat::Nv21 => ImageData::Nv21(vec![0; w * h * 3 / 2]),
            PixelFormat::Yv12 => ImageData::Yv12(vec![0; yv12_size(w, h)]),
            PixelFormat::Rgb24 => ImageData::Rgb24(vec![0; w * h * 3]),
            PixelFormat::Blob | PixelFormat::Mjpeg => {
                return Err(ConvertError::Unsupported {
                    from: format,
                    to: format,
                })
            }
        };
        Ok(Self {
            stream_id,
            width,
            height,
            stride: width,
            data,
            status: BufferStatus::Pending,
            share_handle: None,
        })
    }

    pub fn nv21(stream_id: StreamId, width: u32, height: u32) -> Result<Self, ConvertError> {
        Self::new(stream_id, width, height, PixelFormat::Nv21)
    }

    pub fn yv12(stream_id: StreamId, width: u32, height: u32) -> Result<Self, ConvertError> {
        Self::new(stream_id, width, height, PixelFormat::Yv12)
    }

    pub fn yuyv(stream_id: StreamId, width: u32, height: u32) -> Result<Self, ConvertError> {
        Self::new(stream_id, width, height, PixelFormat::Yuyv)
    }

    pub fn rgb(stream_id: StreamId, width: u32, height: u32) -> Result<Self, ConvertError> {
        Self::new(stream_id, width, height, PixelFormat::Rgb24)
    }

    /// Still-image buffer of fixed capacity; `width`/`height` are the
    /// picture dimensions, not the storage shape.
    pub fn blob(
        stream_id: StreamId,
        width: u32,
        height: u32,
        capacity: usize,
    ) -> Result<Self, ConvertError> {
        if width == 0 || height == 0 {
            return Err(ConvertError::Geometry { width, height });
        }
        Ok(Self {
            stream_id,
            width,
            height,
            stride: 0,
            data: ImageData::Blob(vec![0; capacity]),
            status: BufferStatus::Pending,
            share_handle: None,
        })
    }

    /// Re-allocate with a wider row stride (in pixels)
    pub fn with_stride(mut self, stride: u32) -> Self {
        let stride = stride.max(self.width);
        let (s, h) = (stride as usize, self.height as usize);
        self.data = match self.data {
            ImageData::Yuyv(_) => ImageData::Yuyv(vec![0; s * h * 2]),
            ImageData::Nv21(_) => ImageData::Nv21(vec![0; s * h * 3 / 2]),
            ImageData::Yv12(_) => ImageData::Yv12(vec![0; yv12_size(s, h)]),
            ImageData::Rgb24(_) => ImageData::Rgb24(vec![0; s * h * 3]),
            blob @ ImageData::Blob(_) => return Self { data: blob, ..self },
        };
        self.stride = stride;
        self
    }

    pub fn with_share_handle(mut self, handle: ShareHandle) -> Self {
        self.share_handle = Some(handle);
        self
    }

    pub fn format(&self) -> PixelFormat {
        self.data.format()
    }

    pub fn is_auxiliary(&self) -> bool {
        self.stream_id <= 0
    }

    pub fn is_still(&self) -> bool {
        self.format() == PixelFormat::Blob
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Destination buffers for one capture cycle
#[derive(Debug)]
pub struct FrameSlot {
    pub frame_number: u32,
    pub buffers: Vec<StreamBuffer>,
    /// Clockwise rotation requested for still buffers, in degrees
    pub orientation: u32,
    /// Set when the device failed while this slot was being filled
    pub failed: bool,
}

impl FrameSlot {
    pub fn new(frame_number: u32, buffers: Vec<StreamBuffer>) -> Self {
        Self {
            frame_number,
            buffers,
            orientation: 0,
            failed: false,
        }
    }

    pub fn with_orientation(mut self, degrees: u32) -> Self {
        self.orientation = degrees % 360;
        self
    }
}

/// Timing and gain limits of the simulated sensor, in nanoseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorLimits {
    pub min_exposure_ns: u64,
    pub max_exposure_ns: u64,
    pub min_frame_duration_ns: u64,
    pub max_frame_duration_ns: u64,
    pub min_sensitivity: u32,
    pub max_sensitivity: u32,
    /// Active rows, used to derive the per-row readout time
    pub rows: u32,
    pub min_vertical_blank_ns: u64,
}

impl Default for SensorLimits {
    fn default() -> Self {
        Self {
            min_exposure_ns: 1_000,
            max_exposure_ns: 30_000_000_000,
            min_frame_duration_ns: 33_331_760,
            max_frame_duration_ns: 30_000_000_000,
            min_sensitivity: 100,
            max_sensitivity: 1600,
            rows: 1200,
            min_vertical_blank_ns: 10_000,
        }
    }
}

impl SensorLimits {
    /// Time to read out a single row at the fastest frame rate
    pub fn row_readout_time(&self) -> Duration {
        Duration::from_nanos(self.min_frame_duration_ns / self.rows.max(1) as u64)
    }

    pub fn vertical_blank(&self) -> Duration {
        Duration::from_nanos(self.min_vertical_blank_ns)
    }
}

/// Per-frame scalar sensor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub exposure: Duration,
    pub frame_duration: Duration,
    /// ISO-style gain, 100 = unity
    pub sensitivity: u32,
    pub frame_number: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        let limits = SensorLimits::default();
        Self {
            exposure: Duration::from_millis(10),
            frame_duration: Duration::from_nanos(limits.min_frame_duration_ns),
            sensitivity: limits.min_sensitivity,
            frame_number: 0,
        }
    }
}

impl CaptureSettings {
    /// Clamp every field into the sensor's supported range
    pub fn clamped(self, limits: &SensorLimits) -> Self {
        let clamp_ns = |d: Duration, lo: u64, hi: u64| {
            Duration::from_nanos((d.as_nanos() as u64).clamp(lo, hi))
        };
        Self {
            exposure: clamp_ns(self.exposure, limits.min_exposure_ns, limits.max_exposure_ns),
            frame_duration: clamp_ns(
                self.frame_duration,
                limits.min_frame_duration_ns,
                limits.max_frame_duration_ns,
            ),
            sensitivity: self
                .sensitivity
                .clamp(limits.min_sensitivity, limits.max_sensitivity),
            frame_number: self.frame_number,
        }
    }
}

/// Timestamp of a captured frame, nanoseconds on the process monotonic clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CaptureTime(pub u64);

impl CaptureTime {
    pub fn now() -> Self {
        Self(monotonic_ns())
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Time elapsed between `earlier` and `self`, zero if `earlier` is later
    pub fn since(self, earlier: CaptureTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for CaptureTime {
    type Output = CaptureTime;

    fn add(self, rhs: Duration) -> Self::Output {
        CaptureTime(self.0 + rhs.as_nanos() as u64)
    }
}
