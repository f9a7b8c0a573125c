//! Shared helpers for pipeline integration tests

#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use camsim::capture::frame::PixelFormat;
use camsim::pipeline::{PipelineEvent, PipelineListener};
use camsim::{CaptureSettings, CaptureTime, Config, Pipeline, SourceFormat, StreamBuffer, SyntheticSensor};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;

/// Records every callback in arrival order
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<PipelineEvent>>,
    signal: Condvar,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: PipelineEvent) {
        self.events.lock().unwrap().push(event);
        self.signal.notify_all();
    }

    /// Wait until `done` holds over the recorded events
    pub fn wait_until(&self, timeout: Duration, done: impl Fn(&[PipelineEvent]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        while !done(&events) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self.signal.wait_timeout(events, deadline - now).unwrap().0;
        }
        true
    }

    pub fn wait_for_results(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |events| results_in(events).len() >= count)
    }

    pub fn wait_for_stills(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |events| stills_in(events).len() >= count)
    }

    /// `(frame_number, timestamp)` of every result, in delivery order
    pub fn results(&self) -> Vec<(u32, CaptureTime)> {
        results_in(&self.events.lock().unwrap())
    }

    /// `(frame_number, success)` of every still, in delivery order
    pub fn stills(&self) -> Vec<(u32, bool)> {
        stills_in(&self.events.lock().unwrap())
    }

    pub fn device_errors(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, PipelineEvent::DeviceError { .. }))
            .count()
    }

    /// Index of the first event matching `pred`
    pub fn position(&self, pred: impl Fn(&PipelineEvent) -> bool) -> Option<usize> {
        self.events.lock().unwrap().iter().position(pred)
    }

    pub fn with_events<R>(&self, f: impl FnOnce(&[PipelineEvent]) -> R) -> R {
        f(&self.events.lock().unwrap())
    }
}

fn results_in(events: &[PipelineEvent]) -> Vec<(u32, CaptureTime)> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::ResultReady {
                frame_number,
                timestamp,
                ..
            } => Some((*frame_number, *timestamp)),
            _ => None,
        })
        .collect()
}

fn stills_in(events: &[PipelineEvent]) -> Vec<(u32, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StillImageReady {
                frame_number,
                success,
                ..
            } => Some((*frame_number, *success)),
            _ => None,
        })
        .collect()
}

impl PipelineListener for Recorder {
    fn on_exposure_start(&self, frame_number: u32, timestamp: CaptureTime) {
        self.push(PipelineEvent::ExposureStart {
            frame_number,
            timestamp,
        });
    }

    fn on_device_error(&self, frame_number: u32) {
        self.push(PipelineEvent::DeviceError { frame_number });
    }

    fn on_result_ready(&self, frame_number: u32, buffers: Vec<StreamBuffer>, timestamp: CaptureTime) {
        self.push(PipelineEvent::ResultReady {
            frame_number,
            buffers,
            timestamp,
        });
    }

    fn on_still_image_ready(&self, frame_number: u32, buffer: StreamBuffer, success: bool) {
        self.push(PipelineEvent::StillImageReady {
            frame_number,
            buffer,
            success,
        });
    }
}

/// Small frames, 5 ms frame period and short retry bounds
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.capture.width = WIDTH;
    config.capture.height = HEIGHT;
    config.capture.format = PixelFormat::Nv21;
    config.capture.limits.min_frame_duration_ns = 5_000_000;
    config.pipeline.retry_sleep_ms = 1;
    config.pipeline.max_retries = 10;
    config.pipeline.wait_step_ms = 2;
    config.pipeline.max_wait_loops = 1500;
    config
}

pub fn fast_settings() -> CaptureSettings {
    CaptureSettings {
        frame_duration: Duration::from_millis(5),
        ..CaptureSettings::default()
    }
}

pub fn sensor(config: &Config) -> SyntheticSensor {
    SyntheticSensor::new(SourceFormat::new(
        config.capture.width,
        config.capture.height,
        config.capture.format,
    ))
    .unwrap()
}

pub fn start(config: &Config, sensor: SyntheticSensor) -> (Pipeline, Arc<Recorder>) {
    let recorder = Recorder::new();
    let listener: Arc<dyn PipelineListener> = Arc::clone(&recorder) as Arc<dyn PipelineListener>;
    let pipeline = Pipeline::start(config, Box::new(sensor), listener).unwrap();
    (pipeline, recorder)
}
