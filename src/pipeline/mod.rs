//! Capture pipeline
//!
//! [`Pipeline`] owns the three long-lived threads and is the only way
//! requests enter them:
//!
//! ```text
//! submit -> ControlState -> capture loop -> ReadoutHandoff -> readout loop -> listener
//!                                                                  |
//!                                                                  v
//!                                                           EncodeStage -> listener
//! ```

pub mod cancel;
pub mod capture;
pub mod control;
pub mod handoff;
pub mod listener;
pub mod readout;
pub mod session;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::capture::frame::{CaptureSettings, CaptureTime, FrameSlot, StreamBuffer, AUX_STREAM_ID};
use crate::capture::FrameSource;
use crate::encode::{still_buffer_size, EncodeDefaults, EncodeStage, StillSettings, TRAILER_SIZE};
use crate::error::{PipelineError, Result};
use crate::{Config, PipelineConfig};

use self::cancel::CancelToken;
use self::capture::{CaptureCounters, CaptureLoop, CaptureStats};
use self::control::ControlState;
use self::handoff::{Captured, HandoffStats, ReadoutHandoff};
use self::readout::{abandon, InFlight, ReadoutLoop, ReadoutQueue};

pub use listener::{ChannelListener, PipelineEvent, PipelineListener};
pub use session::Session;

/// One frame's worth of work
#[derive(Debug)]
pub struct CaptureRequest {
    /// Must increase with every request
    pub frame_number: u32,
    pub settings: CaptureSettings,
    /// Destination buffers, at most one of them a still blob
    pub buffers: Vec<StreamBuffer>,
    /// Parameters for the still buffer, defaults if absent
    pub still: Option<StillSettings>,
}

impl CaptureRequest {
    pub fn new(frame_number: u32, buffers: Vec<StreamBuffer>) -> Self {
        Self {
            frame_number,
            settings: CaptureSettings::default(),
            buffers,
            still: None,
        }
    }

    pub fn with_settings(mut self, settings: CaptureSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_still(mut self, still: StillSettings) -> Self {
        self.still = Some(still);
        self
    }

    fn has_still(&self) -> bool {
        self.buffers.iter().any(StreamBuffer::is_still)
    }

    fn validate(&self) -> Result<()> {
        if self.buffers.is_empty() {
            return Err(PipelineError::invalid_request("no output buffers"));
        }
        let mut streams = HashSet::with_capacity(self.buffers.len());
        let mut stills = 0;
        for buffer in &self.buffers {
            if buffer.stream_id == AUX_STREAM_ID || buffer.stream_id < 0 {
                return Err(PipelineError::invalid_request(format!(
                    "stream id {} is reserved",
                    buffer.stream_id
                )));
            }
            if !streams.insert(buffer.stream_id) {
                return Err(PipelineError::invalid_request(format!(
                    "stream {} appears twice",
                    buffer.stream_id
                )));
            }
            if buffer.is_still() {
                stills += 1;
                if buffer.capacity() <= TRAILER_SIZE {
                    return Err(PipelineError::invalid_request("still buffer has no room"));
                }
            }
        }
        if stills > 1 {
            return Err(PipelineError::invalid_request("more than one still buffer"));
        }
        match &self.still {
            Some(_) if stills == 0 => Err(PipelineError::invalid_request(
                "still settings without a still buffer",
            )),
            Some(still) if still.orientation % 90 != 0 => Err(PipelineError::invalid_request(
                format!("orientation {} is not a right angle", still.orientation),
            )),
            _ => Ok(()),
        }
    }
}

/// Counters across the whole pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub capture: CaptureCounters,
    pub handoff: HandoffStats,
    pub in_flight: usize,
    pub encoder_idle: bool,
}

struct Threads {
    capture: JoinHandle<Vec<Captured>>,
    readout: JoinHandle<Vec<Captured>>,
}

/// A running capture pipeline for one frame source
pub struct Pipeline {
    control: Arc<ControlState>,
    handoff: Arc<ReadoutHandoff>,
    readout: Arc<ReadoutQueue>,
    encoder: Arc<EncodeStage>,
    stats: Arc<CaptureStats>,
    listener: Arc<dyn PipelineListener>,
    cancel: CancelToken,
    config: PipelineConfig,
    /// Sensor size and still buffer size at that size
    still_limits: (u32, u32, usize),
    /// Serialises submitters; holds the last accepted frame number
    submit: Mutex<Option<u32>>,
    threads: Mutex<Option<Threads>>,
}

impl Pipeline {
    /// Start the source if needed and spawn the capture, readout and encode
    /// threads
    #[instrument(skip_all, fields(source = %source.name()))]
    pub fn start(
        config: &Config,
        mut source: Box<dyn FrameSource>,
        listener: Arc<dyn PipelineListener>,
    ) -> Result<Self> {
        if !source.is_streaming() {
            source.start()?;
        }
        let format = source.format();
        info!(
            "Starting pipeline at {}x{} {:?}",
            format.width, format.height, format.format
        );

        let pc = config.pipeline.clone();
        let limits = config.capture.limits.clone();
        let supports_rotation = config.capture.supports_rotation;
        let cancel = CancelToken::new();
        let control = Arc::new(ControlState::new(CaptureSettings::default().clamped(&limits)));
        let handoff = Arc::new(ReadoutHandoff::new(pc.handoff_depth, pc.wait_step()));
        let readout = Arc::new(ReadoutQueue::new(
            pc.max_in_flight,
            pc.wait_step(),
            pc.max_wait_loops,
        ));
        let stats = Arc::new(CaptureStats::default());
        let encoder = Arc::new(EncodeStage::start(
            EncodeDefaults::from(&config.encode),
            Arc::clone(&listener),
        )?);

        let capture = CaptureLoop::new(
            source,
            Arc::clone(&control),
            Arc::clone(&handoff),
            Arc::clone(&listener),
            cancel.clone(),
            Arc::clone(&stats),
            pc.clone(),
            limits,
            supports_rotation,
        )
        .spawn()?;

        let reader = ReadoutLoop::new(
            Arc::clone(&readout),
            Arc::clone(&handoff),
            Arc::clone(&encoder),
            Arc::clone(&listener),
            cancel.clone(),
            supports_rotation,
        );
        let readout_thread = match reader.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                cancel.cancel();
                handoff.close();
                if capture.join().is_err() {
                    error!("Capture thread panicked");
                }
                return Err(e);
            }
        };

        Ok(Self {
            control,
            handoff,
            readout,
            encoder,
            stats,
            listener,
            cancel,
            config: pc,
            still_limits: (format.width, format.height, config.encode.max_still_size),
            submit: Mutex::new(None),
            threads: Mutex::new(Some(Threads {
                capture,
                readout: readout_thread,
            })),
        })
    }

    fn lock_submit(&self) -> MutexGuard<'_, Option<u32>> {
        self.submit.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one request.
    ///
    /// Blocks until the encoder is idle (still requests only), the readout
    /// queue has room and the next vertical sync has passed, each wait
    /// bounded by the configured wait timeout.
    pub fn submit(&self, request: CaptureRequest) -> Result<()> {
        request.validate()?;
        let mut last = self.lock_submit();
        if let Some(last) = *last {
            if request.frame_number <= last {
                return Err(PipelineError::invalid_request(format!(
                    "frame {} does not follow {}",
                    request.frame_number, last
                )));
            }
        }
        if self.stats.device_lost() {
            return Err(PipelineError::DeviceLost);
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::ShutDown);
        }

        let timeout = self.config.wait_timeout();
        if request.has_still() && !self.encoder.wait_for_done(timeout) {
            warn!(frame_number = request.frame_number, "Encoder still busy");
            return Err(PipelineError::Timeout("encoder"));
        }
        if !self.readout.wait_for_readout(&self.cancel) {
            return Err(self.wait_failure("readout"));
        }
        if !self.control.wait_for_vsync(timeout, &self.cancel) {
            return Err(self.wait_failure("vsync"));
        }

        let CaptureRequest {
            frame_number,
            settings,
            buffers,
            still,
        } = request;
        let settings = CaptureSettings {
            frame_number,
            ..settings
        };
        let orientation = still.as_ref().map_or(0, |s| s.orientation);
        let slot = FrameSlot::new(frame_number, buffers).with_orientation(orientation);
        if self.control.set_next(settings, slot).is_err() {
            // The previous slot was not picked up since vsync, or the loop exited
            return Err(self.wait_failure("capture slot"));
        }
        self.readout.queue_request(InFlight {
            frame_number,
            settings,
            still,
        });
        *last = Some(frame_number);
        debug!(frame_number, "Request submitted");
        Ok(())
    }

    fn wait_failure(&self, what: &'static str) -> PipelineError {
        if self.stats.device_lost() {
            PipelineError::DeviceLost
        } else if self.cancel.is_cancelled() {
            PipelineError::ShutDown
        } else {
            PipelineError::Timeout(what)
        }
    }

    /// Wait until every submitted request has been read out and every still
    /// has been encoded
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if !self.readout.wait_idle(timeout) {
            return false;
        }
        self.encoder
            .wait_for_done(deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_idle(&self) -> bool {
        self.readout.is_idle() && self.encoder.is_idle()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            capture: self.stats.snapshot(),
            handoff: self.handoff.stats(),
            in_flight: self.readout.in_flight(),
            encoder_idle: self.encoder.is_idle(),
        }
    }

    /// Still buffer capacity for a picture of the given size
    pub fn still_buffer_size(&self, width: u32, height: u32) -> usize {
        let (max_width, max_height, max_size) = self.still_limits;
        still_buffer_size(width, height, max_width, max_height, max_size)
    }

    pub fn encode_defaults(&self) -> Arc<EncodeDefaults> {
        self.encoder.defaults()
    }

    pub fn set_encode_defaults(&self, defaults: EncodeDefaults) {
        self.encoder.set_defaults(defaults);
    }

    /// Stop every thread. A running still compression completes first.
    /// Every accepted request that was not read out is returned to the
    /// listener with its buffers failed. Later calls return immediately.
    pub fn shutdown(&self) {
        let threads = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(threads) = threads else {
            return;
        };
        info!("Shutting down pipeline");

        self.cancel.cancel();
        self.control.wake_all();
        self.handoff.close();
        let mut unsent = threads.capture.join().unwrap_or_else(|_| {
            error!("Capture thread panicked");
            Vec::new()
        });
        let unread = threads.readout.join().unwrap_or_else(|_| {
            error!("Readout thread panicked");
            Vec::new()
        });
        self.encoder.cancel();

        unsent.extend(unread);
        unsent.extend(self.control.take_pending().map(|slot| (slot, CaptureTime::now())));
        unsent.sort_by_key(|(slot, _)| slot.frame_number);
        if !unsent.is_empty() {
            warn!(count = unsent.len(), "Failing requests left in flight");
        }
        for (slot, time) in unsent {
            abandon(self.listener.as_ref(), slot, time);
        }
        info!("Pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;

    fn buffers() -> Vec<StreamBuffer> {
        vec![StreamBuffer::nv21(1, 64, 48).unwrap()]
    }

    #[test]
    fn test_validate_accepts_preview_and_still() {
        let mut request = CaptureRequest::new(1, buffers());
        request
            .buffers
            .push(StreamBuffer::blob(2, 64, 48, 1 << 16).unwrap());
        assert!(request.with_still(StillSettings::default()).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        assert!(CaptureRequest::new(1, vec![]).validate().is_err());

        let aux = vec![StreamBuffer::new(AUX_STREAM_ID, 8, 8, PixelFormat::Nv21).unwrap()];
        assert!(CaptureRequest::new(1, aux).validate().is_err());

        let twice = vec![
            StreamBuffer::nv21(1, 8, 8).unwrap(),
            StreamBuffer::yuyv(1, 8, 8).unwrap(),
        ];
        assert!(CaptureRequest::new(1, twice).validate().is_err());

        let stills = vec![
            StreamBuffer::blob(2, 8, 8, 1024).unwrap(),
            StreamBuffer::blob(3, 8, 8, 1024).unwrap(),
        ];
        assert!(CaptureRequest::new(1, stills).validate().is_err());

        let orphan = CaptureRequest::new(1, buffers()).with_still(StillSettings::default());
        assert!(orphan.validate().is_err());

        let skewed = CaptureRequest::new(1, vec![StreamBuffer::blob(2, 8, 8, 1024).unwrap()])
            .with_still(StillSettings {
                orientation: 45,
                ..StillSettings::default()
            });
        assert!(skewed.validate().is_err());
    }
}
