use flume::{Receiver, Sender};
use tracing::warn;

use crate::capture::frame::{CaptureTime, StreamBuffer};

/// Callbacks from the pipeline threads to the owner.
///
/// Invoked on the capture, readout and encode threads; implementations must
/// not block for long.
pub trait PipelineListener: Send + Sync {
    /// Vertical sync for the cycle that captures `frame_number`
    fn on_exposure_start(&self, frame_number: u32, timestamp: CaptureTime);

    /// The device failed; reported once per session
    fn on_device_error(&self, frame_number: u32);

    /// Non-compressed buffers of a slot are complete
    fn on_result_ready(&self, frame_number: u32, buffers: Vec<StreamBuffer>, timestamp: CaptureTime);

    /// A still image finished, successfully or not
    fn on_still_image_ready(&self, frame_number: u32, buffer: StreamBuffer, success: bool);
}

/// Listener callbacks as values
#[derive(Debug)]
pub enum PipelineEvent {
    ExposureStart {
        frame_number: u32,
        timestamp: CaptureTime,
    },
    DeviceError {
        frame_number: u32,
    },
    ResultReady {
        frame_number: u32,
        buffers: Vec<StreamBuffer>,
        timestamp: CaptureTime,
    },
    StillImageReady {
        frame_number: u32,
        buffer: StreamBuffer,
        success: bool,
    },
}

/// Forwards every callback into a channel
pub struct ChannelListener {
    tx: Sender<PipelineEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            warn!("Pipeline event dropped, receiver gone");
        }
    }
}

impl PipelineListener for ChannelListener {
    fn on_exposure_start(&self, frame_number: u32, timestamp: CaptureTime) {
        self.send(PipelineEvent::ExposureStart {
            frame_number,
            timestamp,
        });
    }

    fn on_device_error(&self, frame_number: u32) {
        self.send(PipelineEvent::DeviceError { frame_number });
    }

    fn on_result_ready(&self, frame_number: u32, buffers: Vec<StreamBuffer>, timestamp: CaptureTime) {
        self.send(PipelineEvent::ResultReady {
            frame_number,
            buffers,
            timestamp,
        });
    }

    fn on_still_image_ready(&self, frame_number: u32, buffer: StreamBuffer, success: bool) {
        self.send(PipelineEvent::StillImageReady {
            frame_number,
            buffer,
            success,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_listener_forwards() {
        let (listener, rx) = ChannelListener::new();
        listener.on_exposure_start(3, CaptureTime(42));
        listener.on_device_error(3);
        match rx.try_recv().unwrap() {
            PipelineEvent::ExposureStart {
                frame_number,
                timestamp,
            } => {
                assert_eq!(frame_number, 3);
                assert_eq!(timestamp, CaptureTime(42));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            PipelineEvent::DeviceError { frame_number: 3 }
        ));
    }
}
