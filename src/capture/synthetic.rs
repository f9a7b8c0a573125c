//! Synthetic-scene sensor
//!
//! Renders a colour-bar test scene with a moving band, row by row, at the
//! negotiated geometry. Brightness follows exposure and gain so that frame
//! settings have a visible effect. A shared [`SensorFaults`] handle lets
//! callers inject stalls, truncated frames and disconnects.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{debug, info, warn};

use super::frame::{CaptureSettings, Frame, FrameMetadata, PixelFormat};
use super::source::{ControlInfo, DeviceStatus, FrameSource, SourceFormat};
use crate::convert::yuv::{
    check_even, i420_to_nv21, i420_to_rgb, i420_to_yuyv, i420_to_yv12, rgb_to_yuv, Yuv420,
};
use crate::error::SourceError;

/// White, yellow, cyan, green, magenta, red, blue, black
const BARS: [[i32; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

const REFERENCE_EXPOSURE: Duration = Duration::from_millis(10);
const REFERENCE_SENSITIVITY: u32 = 100;
const MJPEG_QUALITY: u8 = 90;

/// Fault injection handle shared between a sensor and its test harness
#[derive(Debug, Default)]
pub struct SensorFaults {
    stalls: AtomicU32,
    truncate_next: AtomicBool,
    disconnected: AtomicBool,
    starts: AtomicU32,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl SensorFaults {
    /// The next `n` acquisitions report no frame
    pub fn stall_for(&self, n: u32) {
        self.stalls.store(n, Ordering::SeqCst);
    }

    /// The next frame is delivered with half its payload missing
    pub fn truncate_next(&self) {
        self.truncate_next.store(true, Ordering::SeqCst);
    }

    /// Simulate the device going away; sticky
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Times the stream was started, including forced restarts
    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    fn take_stall(&self) -> bool {
        self.stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Colour-bar sensor
pub struct SyntheticSensor {
    format: SourceFormat,
    streaming: bool,
    sequence: u64,
    exposure: Duration,
    sensitivity: u32,
    faults: Arc<SensorFaults>,
}

impl SyntheticSensor {
    pub fn new(format: SourceFormat) -> Result<Self, SourceError> {
        Self::validate(&format)?;
        Ok(Self {
            format,
            streaming: false,
            sequence: 0,
            exposure: REFERENCE_EXPOSURE,
            sensitivity: REFERENCE_SENSITIVITY,
            faults: Arc::new(SensorFaults::default()),
        })
    }

    pub fn faults(&self) -> Arc<SensorFaults> {
        Arc::clone(&self.faults)
    }

    fn validate(format: &SourceFormat) -> Result<(), SourceError> {
        if format.format == PixelFormat::Blob {
            return Err(SourceError::Format("sensor cannot emit still containers".into()));
        }
        check_even(format.width, format.height)
            .map_err(|e| SourceError::Format(e.to_string()))
    }

    /// Luma gain in 1/256 units, capped at 2x
    fn brightness(&self) -> i32 {
        let exposure = self.exposure.as_nanos() as f64 / REFERENCE_EXPOSURE.as_nanos() as f64;
        let gain = self.sensitivity as f64 / REFERENCE_SENSITIVITY as f64;
        ((exposure * gain).clamp(0.0, 2.0) * 256.0) as i32
    }

    fn render(&self) -> Result<Yuv420, SourceError> {
        let (w, h) = (self.format.width as usize, self.format.height as usize);
        let mut img = Yuv420::new(self.format.width, self.format.height)
            .map_err(|e| SourceError::Format(e.to_string()))?;

        let scale = self.brightness();
        let columns: Vec<(u8, u8, u8)> = (0..w)
            .map(|x| {
                let [r, g, b] = BARS[x * BARS.len() / w];
                let (y, u, v) = rgb_to_yuv(r, g, b);
                (((y as i32 * scale) >> 8).min(255) as u8, u, v)
            })
            .collect();

        let band_height = (h / 16).max(2);
        let band_start = (self.sequence as usize * 8) % h;
        let cw = w / 2;

        for row in 0..h {
            let in_band = (row + h - band_start) % h < band_height;
            let luma = &mut img.y[row * w..(row + 1) * w];
            for (px, &(y, _, _)) in luma.iter_mut().zip(&columns) {
                *px = if in_band { 255 - y } else { y };
            }
            if row % 2 == 0 {
                let cy = row / 2;
                for cx in 0..cw {
                    let (_, u, v) = columns[cx * 2];
                    img.u[cy * cw + cx] = u;
                    img.v[cy * cw + cx] = v;
                }
            }
        }
        Ok(img)
    }

    fn pack(&self, img: &Yuv420) -> Result<Vec<u8>, SourceError> {
        Ok(match self.format.format {
            PixelFormat::Yuyv => i420_to_yuyv(img),
            PixelFormat::Nv21 => i420_to_nv21(img),
            PixelFormat::Yv12 => i420_to_yv12(img),
            PixelFormat::Rgb24 => i420_to_rgb(img),
            PixelFormat::Mjpeg => {
                let rgb = i420_to_rgb(img);
                let mut out = Vec::with_capacity(rgb.len() / 8);
                JpegEncoder::new_with_quality(&mut out, MJPEG_QUALITY)
                    .encode(&rgb, img.width, img.height, ExtendedColorType::Rgb8)
                    .map_err(|e| SourceError::Format(e.to_string()))?;
                out
            }
            PixelFormat::Blob => {
                return Err(SourceError::Format("sensor cannot emit still containers".into()))
            }
        })
    }
}

impl FrameSource for SyntheticSensor {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn set_format(&mut self, format: SourceFormat) -> Result<(), SourceError> {
        if self.streaming {
            return Err(SourceError::Format("format change while streaming".into()));
        }
        Self::validate(&format)?;
        debug!(?format, "synthetic sensor format");
        self.format = format;
        Ok(())
    }

    fn format(&self) -> SourceFormat {
        self.format
    }

    fn start(&mut self) -> Result<(), SourceError> {
        if self.faults.is_disconnected() {
            return Err(SourceError::Disconnected);
        }
        self.streaming = true;
        self.faults.starts.fetch_add(1, Ordering::SeqCst);
        info!(
            "Synthetic sensor streaming {}x{} {:?}",
            self.format.width, self.format.height, self.format.format
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        self.streaming = false;
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn acquire(&mut self, _timeout: Duration) -> Result<Option<Frame>, SourceError> {
        if self.faults.is_disconnected() {
            return Err(SourceError::Disconnected);
        }
        if !self.streaming {
            return Err(SourceError::NotStreaming);
        }
        if self.faults.take_stall() {
            return Ok(None);
        }

        let timestamp = Instant::now();
        let img = self.render()?;
        let mut data = self.pack(&img)?;
        if self.faults.truncate_next.swap(false, Ordering::SeqCst) {
            warn!("Delivering truncated frame {}", self.sequence + 1);
            data.truncate(data.len() / 2);
        }

        self.sequence += 1;
        self.faults.acquired.fetch_add(1, Ordering::SeqCst);

        Ok(Some(Frame {
            data: Bytes::from(data),
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                width: self.format.width,
                height: self.format.height,
                stride: self.format.width,
                format: self.format.format,
                device_timestamp: None,
            }),
            timestamp,
        }))
    }

    fn release(&mut self, _frame: Frame) {
        self.faults.released.fetch_add(1, Ordering::SeqCst);
    }

    fn apply_settings(&mut self, settings: &CaptureSettings) {
        self.exposure = settings.exposure;
        self.sensitivity = settings.sensitivity;
    }

    fn query_controls(&self) -> Vec<ControlInfo> {
        vec![ControlInfo {
            name: "gain".into(),
            min: 100,
            max: 1600,
            step: 1,
            default: REFERENCE_SENSITIVITY as i64,
        }]
    }

    fn status(&self) -> DeviceStatus {
        if self.faults.is_disconnected() {
            DeviceStatus::Disconnected
        } else {
            DeviceStatus::Ok
        }
    }
}
