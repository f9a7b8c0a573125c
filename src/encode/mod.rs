//! Still-image encode stage
//!
//! A single worker thread fed by a FIFO. Each job turns the auxiliary source
//! buffer of one slot into a JPEG with an EXIF block, written into the
//! caller's still buffer together with a size trailer.

pub mod exif;
pub mod jpeg;
pub mod trailer;

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::Local;
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::capture::frame::{BufferStatus, CaptureSettings, CaptureTime, ImageData, StreamBuffer};
use crate::error::{EncodeError, PipelineError};
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::listener::PipelineListener;
use crate::EncodeConfig;

pub use exif::{ExifBuilder, ExifInfo, GpsInfo, MetadataBuilder};
pub use jpeg::{JpegCodec, StillCodec};
pub use trailer::{still_buffer_size, BlobTrailer, MIN_STILL_BUFFER_SIZE, TRAILER_SIZE};

const POLL: Duration = Duration::from_millis(10);

/// Per-request still parameters; unset fields fall back to the stage defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StillSettings {
    /// Clockwise rotation in degrees (0, 90, 180, 270)
    pub orientation: u32,
    pub quality: Option<u8>,
    /// `Some((0, 0))` disables the thumbnail
    pub thumbnail_size: Option<(u32, u32)>,
    pub thumbnail_quality: Option<u8>,
    pub gps: Option<GpsInfo>,
    /// Millimetres
    pub focal_length: Option<f32>,
}

/// Stage-wide defaults, swappable while running
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeDefaults {
    pub quality: u8,
    pub thumbnail_quality: u8,
    pub thumbnail_size: (u32, u32),
    pub make: String,
    pub model: String,
}

impl From<&EncodeConfig> for EncodeDefaults {
    fn from(config: &EncodeConfig) -> Self {
        Self {
            quality: config.quality,
            thumbnail_quality: config.thumbnail_quality,
            thumbnail_size: (config.thumbnail_width, config.thumbnail_height),
            make: config.make.clone(),
            model: config.model.clone(),
        }
    }
}

/// One still to compress. Owns both buffers until completion.
#[derive(Debug)]
pub struct EncodeJob {
    pub frame_number: u32,
    /// Caller's still buffer, returned through the listener
    pub still: StreamBuffer,
    /// Auxiliary source, freed when the job ends
    pub source: StreamBuffer,
    pub settings: StillSettings,
    pub capture: CaptureSettings,
    pub timestamp: CaptureTime,
    /// Source pixels were already rotated by `settings.orientation`
    pub rotated: bool,
}

struct Worker {
    rx: Receiver<EncodeJob>,
    listener: Arc<dyn PipelineListener>,
    codec: Box<dyn StillCodec>,
    metadata: Box<dyn MetadataBuilder>,
    defaults: Arc<ArcSwap<EncodeDefaults>>,
    pending: Arc<Pending>,
    cancel: CancelToken,
}

/// Jobs queued or running, with a condition for idle waiters
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add(&self) {
        *self.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct EncodeStage {
    tx: Mutex<Option<Sender<EncodeJob>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<Pending>,
    defaults: Arc<ArcSwap<EncodeDefaults>>,
    cancel: CancelToken,
}

impl EncodeStage {
    pub fn start(
        defaults: EncodeDefaults,
        listener: Arc<dyn PipelineListener>,
    ) -> Result<Self, PipelineError> {
        Self::with_codec(defaults, listener, Box::new(JpegCodec), Box::new(ExifBuilder))
    }

    pub fn with_codec(
        defaults: EncodeDefaults,
        listener: Arc<dyn PipelineListener>,
        codec: Box<dyn StillCodec>,
        metadata: Box<dyn MetadataBuilder>,
    ) -> Result<Self, PipelineError> {
        let (tx, rx) = flume::unbounded();
        let pending = Arc::new(Pending::default());
        let defaults = Arc::new(ArcSwap::from_pointee(defaults));
        let cancel = CancelToken::new();

        let worker = Worker {
            rx,
            listener,
            codec,
            metadata,
            defaults: Arc::clone(&defaults),
            pending: Arc::clone(&pending),
            cancel: cancel.clone(),
        };
        let handle = thread::Builder::new()
            .name("camsim-encode".to_string())
            .spawn(move || worker.run())
            .map_err(|e| PipelineError::Spawn("encode", e))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            pending,
            defaults,
            cancel,
        })
    }

    /// Queue a job. Hands it back if the stage has been cancelled.
    pub fn queue(&self, job: EncodeJob) -> Result<(), EncodeJob> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            return Err(job);
        };
        self.pending.add();
        tx.send(job).map_err(|e| {
            self.pending.done();
            e.into_inner()
        })
    }

    pub fn is_idle(&self) -> bool {
        *self.pending.lock() == 0
    }

    /// Wait until every queued job has completed
    pub fn wait_for_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.pending.lock();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = match self.pending.idle.wait_timeout(count, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }

    pub fn defaults(&self) -> Arc<EncodeDefaults> {
        self.defaults.load_full()
    }

    pub fn set_defaults(&self, defaults: EncodeDefaults) {
        self.defaults.store(Arc::new(defaults));
    }

    /// Finish the running job, fail the queued ones and join the worker.
    /// Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
        // Dropping the sender lets the worker observe disconnection once drained
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Encode thread panicked");
            }
        }
    }
}

impl Drop for EncodeStage {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Worker {
    fn run(mut self) {
        info!("Encode stage started");
        loop {
            match self.rx.recv_timeout(POLL) {
                Ok(job) if self.cancel.is_cancelled() => self.discard(job),
                Ok(job) => self.process(job),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("Encode stage exited");
    }

    fn discard(&self, job: EncodeJob) {
        debug!(frame_number = job.frame_number, "Dropping queued still on shutdown");
        let mut still = job.still;
        still.status = BufferStatus::Error;
        self.listener.on_still_image_ready(job.frame_number, still, false);
        self.pending.done();
    }

    fn process(&mut self, job: EncodeJob) {
        let start = Instant::now();
        let frame_number = job.frame_number;
        let EncodeJob {
            mut still,
            source,
            settings,
            capture,
            rotated,
            ..
        } = job;

        let success = match self.compress(&mut still, &source, &settings, &capture, rotated) {
            Ok(size) => {
                debug!(frame_number, size, "Still image encoded");
                true
            }
            Err(e) => {
                error!(frame_number, "Still encode failed: {}", e);
                metrics::counter!("camsim_stills_failed_total").increment(1);
                false
            }
        };
        drop(source);
        still.status = if success {
            BufferStatus::Ok
        } else {
            BufferStatus::Error
        };
        metrics::histogram!("camsim_encode_time_us").record(start.elapsed().as_micros() as f64);
        self.listener.on_still_image_ready(frame_number, still, success);
        self.pending.done();
    }

    /// Returns the payload size written into `still`
    fn compress(
        &mut self,
        still: &mut StreamBuffer,
        source: &StreamBuffer,
        settings: &StillSettings,
        capture: &CaptureSettings,
        rotated: bool,
    ) -> Result<usize, EncodeError> {
        if !still.is_still() {
            return Err(EncodeError::MissingDestination);
        }
        if !source.is_auxiliary() {
            return Err(EncodeError::MissingSource);
        }
        let defaults = self.defaults.load();
        let (width, height) = (source.width, source.height);
        let rgb = jpeg::source_rgb(source)?;

        let quality = settings.quality.unwrap_or(defaults.quality);
        let main = self.codec.encode(&rgb, width, height, quality)?;
        if main.len() < 2 || main[..2] != [0xFF, 0xD8] {
            return Err(EncodeError::Codec("codec output lacks a start marker".into()));
        }

        let (tw, th) = settings.thumbnail_size.unwrap_or(defaults.thumbnail_size);
        let thumbnail = if tw > 0 && th > 0 {
            let tq = settings
                .thumbnail_quality
                .unwrap_or(defaults.thumbnail_quality);
            match jpeg::thumbnail(rgb, width, height, (tw, th)) {
                Some(small) => {
                    let (sw, sh) = small.dimensions();
                    Some(self.codec.encode(small.as_raw(), sw, sh, tq)?)
                }
                None => {
                    warn!("Thumbnail source has the wrong size, skipping");
                    None
                }
            }
        } else {
            None
        };

        let info = ExifInfo {
            make: defaults.make.clone(),
            model: defaults.model.clone(),
            width,
            height,
            orientation: if rotated { 0 } else { settings.orientation },
            taken: Local::now(),
            exposure: capture.exposure,
            iso: capture.sensitivity,
            focal_length: settings.focal_length,
            gps: settings.gps,
            thumbnail,
        };
        let app1 = self.metadata.build(&info)?;

        // SOI, metadata, then the codec stream without its own SOI
        let size = 2 + app1.len() + (main.len() - 2);
        let capacity = still.capacity();
        if size + TRAILER_SIZE > capacity {
            return Err(EncodeError::BufferTooSmall {
                needed: size + TRAILER_SIZE,
                capacity,
            });
        }
        let ImageData::Blob(out) = &mut still.data else {
            return Err(EncodeError::MissingDestination);
        };
        out[..2].copy_from_slice(&[0xFF, 0xD8]);
        out[2..2 + app1.len()].copy_from_slice(&app1);
        out[2 + app1.len()..size].copy_from_slice(&main[2..]);
        BlobTrailer::new(size).write(out)?;
        Ok(size)
    }
}
