use std::sync::Arc;

use tracing::{instrument, warn};

use super::{Pipeline, PipelineListener};
use crate::capture::{FrameSource, SyntheticSensor};
use crate::error::Result;
use crate::registry::{DeviceLease, DeviceRegistry};
use crate::{Config, SourceKind};

/// A pipeline bound to a leased device node. Closing or dropping the session
/// stops the pipeline and returns the node.
pub struct Session {
    id: String,
    registry: Arc<DeviceRegistry>,
    lease: Option<DeviceLease>,
    pipeline: Pipeline,
}

impl Session {
    /// Lease a node and start the configured source on it
    #[instrument(skip(registry, config, listener))]
    pub fn open(
        registry: Arc<DeviceRegistry>,
        session_id: &str,
        config: &Config,
        listener: Arc<dyn PipelineListener>,
    ) -> Result<Self> {
        let lease = registry.acquire(session_id)?;
        let source = match open_source(config, &lease) {
            Ok(source) => source,
            Err(e) => {
                release(&registry, &lease, session_id);
                return Err(e);
            }
        };
        Self::start(registry, session_id, lease, config, source, listener)
    }

    /// Lease a node but drive it with a caller-supplied source
    pub fn with_source(
        registry: Arc<DeviceRegistry>,
        session_id: &str,
        config: &Config,
        source: Box<dyn FrameSource>,
        listener: Arc<dyn PipelineListener>,
    ) -> Result<Self> {
        let lease = registry.acquire(session_id)?;
        Self::start(registry, session_id, lease, config, source, listener)
    }

    fn start(
        registry: Arc<DeviceRegistry>,
        session_id: &str,
        lease: DeviceLease,
        config: &Config,
        source: Box<dyn FrameSource>,
        listener: Arc<dyn PipelineListener>,
    ) -> Result<Self> {
        match Pipeline::start(config, source, listener) {
            Ok(pipeline) => Ok(Self {
                id: session_id.to_string(),
                registry,
                lease: Some(lease),
                pipeline,
            }),
            Err(e) => {
                release(&registry, &lease, session_id);
                Err(e)
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn lease(&self) -> Option<&DeviceLease> {
        self.lease.as_ref()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.pipeline.shutdown();
        if let Some(lease) = self.lease.take() {
            release(&self.registry, &lease, &self.id);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

fn release(registry: &DeviceRegistry, lease: &DeviceLease, session_id: &str) {
    if let Err(e) = registry.release(lease.index, session_id) {
        warn!("Failed to release {}: {}", lease.path.display(), e);
    }
}

fn open_source(config: &Config, lease: &DeviceLease) -> Result<Box<dyn FrameSource>> {
    let format = config.capture.source_format();
    match config.capture.source {
        SourceKind::Synthetic => Ok(Box::new(SyntheticSensor::new(format)?)),
        #[cfg(feature = "v4l2")]
        SourceKind::V4l2 => Ok(Box::new(crate::capture::V4l2Capture::open(
            &lease.path,
            format,
            config.capture.buffer_count,
        )?)),
        #[cfg(not(feature = "v4l2"))]
        SourceKind::V4l2 => Err(crate::error::SourceError::Format(format!(
            "{} needs the v4l2 feature",
            lease.path.display()
        ))
        .into()),
    }
}
