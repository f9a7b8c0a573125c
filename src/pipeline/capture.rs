//! Capture loop
//!
//! One cycle per frame period: take the pending settings and slot at vsync,
//! hand the slot captured in the previous cycle to readout, acquire one raw
//! frame, convert it into every destination buffer, then sleep out the rest
//! of the frame duration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::utils::CachePadded;
use tracing::{debug, error, info, warn};

use super::cancel::CancelToken;
use super::control::ControlState;
use super::handoff::{Captured, ReadoutHandoff};
use super::listener::PipelineListener;
use crate::capture::frame::{
    BufferStatus, CaptureTime, Frame, FrameMetadata, FrameSlot, ImageData, PixelFormat,
    SensorLimits, StreamBuffer, AUX_STREAM_ID,
};
use crate::capture::FrameSource;
use crate::convert::{frame_to_i420, rotate_rgb, FrameConverter, Yuv420};
use crate::error::{ConvertError, PipelineError, SourceError};
use crate::utils::FpsCounter;
use crate::PipelineConfig;

#[derive(Debug, thiserror::Error)]
enum CaptureFailure {
    #[error("capture cancelled")]
    Cancelled,
    #[error(transparent)]
    Device(#[from] SourceError),
    #[error("device unresponsive after {0} forced restarts")]
    Unresponsive(u32),
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    forced_restarts: AtomicU64,
    partial_frames: AtomicU64,
    decode_failures: AtomicU64,
    device_lost: AtomicBool,
}

/// Counters shared between the capture thread and the pipeline owner
#[derive(Default)]
pub struct CaptureStats {
    counters: CachePadded<Counters>,
}

/// Point-in-time copy of [`CaptureStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureCounters {
    pub frames_captured: u64,
    pub forced_restarts: u64,
    pub partial_frames: u64,
    pub decode_failures: u64,
    pub device_lost: bool,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureCounters {
        let c = &self.counters;
        CaptureCounters {
            frames_captured: c.frames_captured.load(Ordering::Relaxed),
            forced_restarts: c.forced_restarts.load(Ordering::Relaxed),
            partial_frames: c.partial_frames.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            device_lost: c.device_lost.load(Ordering::Acquire),
        }
    }

    pub fn device_lost(&self) -> bool {
        self.counters.device_lost.load(Ordering::Acquire)
    }
}

pub struct CaptureLoop {
    source: Box<dyn FrameSource>,
    control: Arc<ControlState>,
    handoff: Arc<ReadoutHandoff>,
    listener: Arc<dyn PipelineListener>,
    cancel: CancelToken,
    stats: Arc<CaptureStats>,
    config: PipelineConfig,
    limits: SensorLimits,
    supports_rotation: bool,
    /// Slot filled in the previous cycle, handed off in the next one
    captured: Option<Captured>,
    /// Slots readout will never see, returned to the owner on exit
    unsent: Vec<Captured>,
    consecutive_restarts: u32,
    fps: FpsCounter,
}

impl CaptureLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn FrameSource>,
        control: Arc<ControlState>,
        handoff: Arc<ReadoutHandoff>,
        listener: Arc<dyn PipelineListener>,
        cancel: CancelToken,
        stats: Arc<CaptureStats>,
        config: PipelineConfig,
        limits: SensorLimits,
        supports_rotation: bool,
    ) -> Self {
        let fps = FpsCounter::new(config.fps_window);
        Self {
            source,
            control,
            handoff,
            listener,
            cancel,
            stats,
            config,
            limits,
            supports_rotation,
            captured: None,
            unsent: Vec::new(),
            consecutive_restarts: 0,
            fps,
        }
    }

    /// The thread yields the slots it could not hand off
    pub fn spawn(self) -> Result<JoinHandle<Vec<Captured>>, PipelineError> {
        thread::Builder::new()
            .name("camsim-capture".to_string())
            .spawn(move || self.run())
            .map_err(|e| PipelineError::Spawn("capture", e))
    }

    fn run(mut self) -> Vec<Captured> {
        if let Some(core) = self.config.capture_core {
            pin_to_core(core);
        }
        info!("Capture loop started on {}", self.source.name());

        while self.cycle() {}

        self.control.close();
        if let Err(e) = self.source.stop() {
            warn!("Failed to stop {}: {}", self.source.name(), e);
        }
        self.handoff.close();
        self.unsent.extend(self.captured.take());
        info!(
            frames = self.stats.snapshot().frames_captured,
            unsent = self.unsent.len(),
            "Capture loop exited"
        );
        self.unsent
    }

    /// One frame period. Returns `false` when the loop must exit.
    fn cycle(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let (settings, next) = self.control.snapshot_and_vsync();
        let start = Instant::now();
        let start_time = CaptureTime::now();
        let settings = settings.clamped(&self.limits);
        let readout = self.limits.row_readout_time() + self.limits.vertical_blank();
        let captured_at = start_time + readout;

        if let Some(slot) = &next {
            self.listener
                .on_exposure_start(slot.frame_number, start_time);
        }

        if let Some((slot, time)) = self.captured.take() {
            if let Err(unsent) = self.handoff.publish(slot, time, &self.cancel) {
                debug!(frame_number = unsent.0.frame_number, "Hand-off closed");
                self.unsent.push(unsent);
                self.unsent.extend(next.map(|slot| (slot, captured_at)));
                return false;
            }
        }

        if let Some(mut slot) = next {
            self.source.apply_settings(&settings);
            match self.capture_into(&mut slot) {
                Ok(()) => {
                    self.stats
                        .counters
                        .frames_captured
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("camsim_frames_captured_total").increment(1);
                    debug!(
                        frame_number = slot.frame_number,
                        buffers = slot.buffers.len(),
                        "Frame captured"
                    );
                    if let Some(fps) = self.fps.tick() {
                        debug!("Capture rate {:.1} fps", fps);
                    }
                    self.captured = Some((slot, captured_at));
                }
                Err(CaptureFailure::Cancelled) => {
                    self.unsent.push((slot, captured_at));
                    return false;
                }
                Err(e) => {
                    self.fail(slot, captured_at, e);
                    return false;
                }
            }
        }

        let period = settings.frame_duration.max(readout);
        let elapsed = start.elapsed();
        metrics::histogram!("camsim_cycle_time_us").record(elapsed.as_micros() as f64);
        if elapsed < period {
            return self.cancel.sleep(period - elapsed);
        }
        true
    }

    /// Fatal device failure: report once, deliver the slot as failed, stop
    fn fail(&mut self, mut slot: FrameSlot, time: CaptureTime, cause: CaptureFailure) {
        error!(
            frame_number = slot.frame_number,
            "Capture device failed: {}", cause
        );
        if !self.stats.counters.device_lost.swap(true, Ordering::AcqRel) {
            self.listener.on_device_error(slot.frame_number);
        }
        slot.failed = true;
        if let Err(unsent) = self.handoff.publish(slot, time, &self.cancel) {
            debug!("Hand-off closed before the failed slot");
            self.unsent.push(unsent);
        }
    }

    fn capture_into(&mut self, slot: &mut FrameSlot) -> Result<(), CaptureFailure> {
        let (frame, planar) = self.acquire_frame()?;

        let mut auxiliary = None;
        {
            let mut converter = match planar {
                Some(planar) => FrameConverter::with_planar(&frame, planar),
                None => FrameConverter::new(&frame),
            };
            for buffer in slot.buffers.iter_mut() {
                let result = if buffer.is_still() {
                    if auxiliary.is_some() {
                        continue;
                    }
                    self.auxiliary_for(&mut converter, &frame.meta, buffer, slot.orientation)
                        .map(|aux| auxiliary = Some(aux))
                } else {
                    converter.fill(buffer)
                };
                if let Err(e) = result {
                    warn!(
                        frame_number = slot.frame_number,
                        stream_id = buffer.stream_id,
                        "Conversion failed: {}", e
                    );
                    buffer.status = BufferStatus::Error;
                }
            }
        }
        self.source.release(frame);
        slot.buffers.extend(auxiliary);
        Ok(())
    }

    /// Allocate and fill the encoder's source buffer for a still request
    fn auxiliary_for(
        &self,
        converter: &mut FrameConverter<'_>,
        meta: &FrameMetadata,
        still: &StreamBuffer,
        orientation: u32,
    ) -> Result<StreamBuffer, ConvertError> {
        let (width, height) = (still.width, still.height);

        if self.supports_rotation && orientation != 0 {
            let mut upright = StreamBuffer::rgb(AUX_STREAM_ID, width, height)?;
            converter.fill(&mut upright)?;
            let (pixels, w, h) = rotate_rgb(upright.data.as_slice(), width, height, orientation);
            return Ok(StreamBuffer {
                width: w,
                height: h,
                stride: w,
                data: ImageData::Rgb24(pixels),
                ..upright
            });
        }

        let native = matches!(
            meta.format,
            PixelFormat::Yuyv | PixelFormat::Nv21 | PixelFormat::Yv12
        );
        let same_size = (width, height) == (meta.width, meta.height);
        let format = if native && same_size && orientation == 0 {
            meta.format
        } else {
            PixelFormat::Rgb24
        };
        let mut aux = StreamBuffer::new(AUX_STREAM_ID, width, height, format)?;
        converter.fill(&mut aux)?;
        Ok(aux)
    }

    /// Dequeue one usable frame, retrying and restarting the stream as needed.
    ///
    /// Compressed frames are decoded here so a corrupt one can be retried.
    fn acquire_frame(&mut self) -> Result<(Frame, Option<Yuv420>), CaptureFailure> {
        let mut retries = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CaptureFailure::Cancelled);
            }
            match self.source.acquire(self.config.retry_sleep()) {
                Ok(Some(frame)) if !frame.is_complete() => {
                    warn!(
                        sequence = frame.meta.sequence,
                        bytes = frame.bytes_used(),
                        "Dropping partial frame"
                    );
                    self.stats
                        .counters
                        .partial_frames
                        .fetch_add(1, Ordering::Relaxed);
                    self.source.release(frame);
                }
                Ok(Some(frame)) if frame.meta.format.is_compressed() => {
                    match frame_to_i420(&frame) {
                        Ok(planar) => {
                            self.consecutive_restarts = 0;
                            return Ok((frame, Some(planar)));
                        }
                        Err(e) => {
                            warn!(sequence = frame.meta.sequence, "Frame decode failed: {}", e);
                            self.stats
                                .counters
                                .decode_failures
                                .fetch_add(1, Ordering::Relaxed);
                            self.source.release(frame);
                        }
                    }
                }
                Ok(Some(frame)) => {
                    self.consecutive_restarts = 0;
                    return Ok((frame, None));
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!("Frame acquisition failed: {}", e),
            }

            retries += 1;
            if retries >= self.config.max_retries {
                self.force_restart(retries)?;
                retries = 0;
            }
            if !self.cancel.sleep(self.config.retry_sleep()) {
                return Err(CaptureFailure::Cancelled);
            }
        }
    }

    fn force_restart(&mut self, retries: u32) -> Result<(), CaptureFailure> {
        self.consecutive_restarts += 1;
        if self.consecutive_restarts > self.config.max_consecutive_restarts {
            return Err(CaptureFailure::Unresponsive(self.consecutive_restarts - 1));
        }
        warn!(
            "No frame after {} attempts, restarting {}",
            retries,
            self.source.name()
        );
        self.stats
            .counters
            .forced_restarts
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camsim_forced_restarts_total").increment(1);

        let format = self.source.format();
        self.source.stop()?;
        self.source.set_format(format)?;
        self.source.start()?;
        Ok(())
    }
}

fn pin_to_core(core: usize) {
    let target = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core));
    match target {
        Some(id) if core_affinity::set_for_current(id) => {
            info!("Capture thread pinned to core {}", core)
        }
        _ => warn!("Could not pin capture thread to core {}", core),
    }
}
