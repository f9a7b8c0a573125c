pub mod capture;
pub mod convert;
pub mod encode;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use arc_swap::ArcSwap;
use capture::frame::{PixelFormat, SensorLimits};
use serde::{Deserialize, Serialize};

pub use capture::frame::{
    CaptureSettings, CaptureTime, FrameSlot, ImageData, StreamBuffer, AUX_STREAM_ID,
};
pub use capture::{Frame, FrameSource, SourceFormat, SyntheticSensor};
pub use encode::StillSettings;
pub use error::{PipelineError, Result};
pub use pipeline::{CaptureRequest, Pipeline, PipelineListener, Session};
pub use registry::DeviceRegistry;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub encode: EncodeConfig,
}

impl Config {
    /// Defaults, overlaid with an optional TOML file and then `CAMSIM__*`
    /// environment variables (`CAMSIM__PIPELINE__HANDOFF_DEPTH=2`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("CAMSIM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

/// Which frame source a session constructs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Synthetic,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// Device nodes handed out by the registry
    pub devices: Vec<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// The converter can rotate auxiliary still sources in place
    pub supports_rotation: bool,
    pub limits: SensorLimits,
}

impl CaptureConfig {
    pub fn source_format(&self) -> capture::SourceFormat {
        capture::SourceFormat::new(self.width, self.height, self.format)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Synthetic,
            devices: vec![PathBuf::from("/dev/video0")],
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv,
            buffer_count: 4,
            supports_rotation: false,
            limits: SensorLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Captured slots that may await readout at once
    pub handoff_depth: usize,
    /// Requests submitted but not yet read out
    pub max_in_flight: usize,
    pub retry_sleep_ms: u64,
    /// Empty acquisitions before a forced stream restart
    pub max_retries: u32,
    /// Forced restarts without a frame before the device is declared lost
    pub max_consecutive_restarts: u32,
    pub wait_step_ms: u64,
    pub max_wait_loops: u32,
    /// Frames per frame-rate log line
    pub fps_window: u32,
    /// Pin the capture thread to this core
    pub capture_core: Option<usize>,
}

impl PipelineConfig {
    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }

    pub fn wait_step(&self) -> Duration {
        Duration::from_millis(self.wait_step_ms)
    }

    /// Upper bound of every looped wait
    pub fn wait_timeout(&self) -> Duration {
        self.wait_step() * self.max_wait_loops
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            handoff_depth: 1,
            max_in_flight: 2,
            retry_sleep_ms: 5,
            max_retries: 600,
            max_consecutive_restarts: 3,
            wait_step_ms: 10,
            max_wait_loops: 1000,
            fps_window: 100,
            capture_core: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    pub quality: u8,
    pub thumbnail_quality: u8,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    /// Still buffer size at full sensor resolution
    pub max_still_size: usize,
    pub make: String,
    pub model: String,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            quality: 95,
            thumbnail_quality: 85,
            thumbnail_width: 160,
            thumbnail_height: 120,
            max_still_size: 3 * 1024 * 1024,
            make: "camsim".into(),
            model: "Synthetic Sensor".into(),
        }
    }
}
