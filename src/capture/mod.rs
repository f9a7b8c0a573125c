pub mod decode;
pub mod frame;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::Frame;
pub use frame::PixelFormat;
pub use source::{DeviceStatus, FrameSource, SourceFormat};
pub use synthetic::{SensorFaults, SyntheticSensor};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Capture;
