//! Readout loop
//!
//! Pairs each submitted request with the slot the capture loop hands off,
//! returns the ready buffers to the listener and passes still requests on
//! to the encode stage.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::handoff::{Captured, Handoff, ReadoutHandoff};
use super::listener::PipelineListener;
use crate::capture::frame::{BufferStatus, CaptureSettings, CaptureTime, FrameSlot, StreamBuffer};
use crate::encode::{EncodeJob, EncodeStage, StillSettings};
use crate::error::PipelineError;

/// A submitted request awaiting readout
#[derive(Debug, Clone)]
pub struct InFlight {
    pub frame_number: u32,
    pub settings: CaptureSettings,
    pub still: Option<StillSettings>,
}

#[derive(Debug, Default)]
struct Queue {
    requests: VecDeque<InFlight>,
    /// A request has been taken off the queue and is being read out
    active: bool,
    closed: bool,
}

/// Bounded queue of in-flight requests shared by the submitter and the
/// readout loop
pub struct ReadoutQueue {
    queue: Mutex<Queue>,
    signal: Condvar,
    max_in_flight: usize,
    wait_step: Duration,
    max_wait_loops: u32,
}

impl ReadoutQueue {
    pub fn new(max_in_flight: usize, wait_step: Duration, max_wait_loops: u32) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            signal: Condvar::new(),
            max_in_flight: max_in_flight.max(1),
            wait_step,
            max_wait_loops,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_step<'a>(&self, guard: MutexGuard<'a, Queue>) -> (MutexGuard<'a, Queue>, bool) {
        match self.signal.wait_timeout(guard, self.wait_step) {
            Ok((guard, result)) => (guard, result.timed_out()),
            Err(e) => {
                let (guard, result) = e.into_inner();
                (guard, result.timed_out())
            }
        }
    }

    pub fn queue_request(&self, request: InFlight) {
        let mut queue = self.lock();
        queue.requests.push_back(request);
        self.signal.notify_all();
    }

    /// Block until another request may be submitted.
    ///
    /// Gives up after the configured number of wait steps, on cancellation,
    /// or once the readout loop has exited.
    pub fn wait_for_readout(&self, cancel: &CancelToken) -> bool {
        let mut queue = self.lock();
        let mut loops = 0;
        while queue.requests.len() >= self.max_in_flight {
            if queue.closed || cancel.is_cancelled() {
                return false;
            }
            let (guard, timed_out) = self.wait_step(queue);
            queue = guard;
            if timed_out {
                loops += 1;
                if loops >= self.max_wait_loops {
                    warn!(
                        in_flight = queue.requests.len(),
                        "Timed out waiting for readout"
                    );
                    return false;
                }
            }
        }
        !queue.closed
    }

    /// Take the oldest request, waiting at most one wait step
    fn next_request(&self) -> Option<InFlight> {
        let mut queue = self.lock();
        if queue.requests.is_empty() {
            queue = self.wait_step(queue).0;
        }
        let request = queue.requests.pop_front();
        queue.active = request.is_some();
        request
    }

    fn finish_request(&self) {
        let mut queue = self.lock();
        queue.active = false;
        self.signal.notify_all();
    }

    /// Stop accepting work and forget queued requests
    fn close(&self) -> usize {
        let mut queue = self.lock();
        queue.closed = true;
        queue.active = false;
        let dropped = queue.requests.len();
        queue.requests.clear();
        self.signal.notify_all();
        dropped
    }

    pub fn in_flight(&self) -> usize {
        let queue = self.lock();
        queue.requests.len() + queue.active as usize
    }

    pub fn is_idle(&self) -> bool {
        let queue = self.lock();
        queue.requests.is_empty() && !queue.active
    }

    /// Wait until every queued request has been read out
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        while !(queue.requests.is_empty() && !queue.active) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            queue = match self.signal.wait_timeout(queue, (deadline - now).min(self.wait_step)) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }
}

pub struct ReadoutLoop {
    queue: Arc<ReadoutQueue>,
    handoff: Arc<ReadoutHandoff>,
    encoder: Arc<EncodeStage>,
    listener: Arc<dyn PipelineListener>,
    cancel: CancelToken,
    wait_step: Duration,
    supports_rotation: bool,
    current: Option<InFlight>,
}

impl ReadoutLoop {
    pub fn new(
        queue: Arc<ReadoutQueue>,
        handoff: Arc<ReadoutHandoff>,
        encoder: Arc<EncodeStage>,
        listener: Arc<dyn PipelineListener>,
        cancel: CancelToken,
        supports_rotation: bool,
    ) -> Self {
        let wait_step = queue.wait_step;
        Self {
            queue,
            handoff,
            encoder,
            listener,
            cancel,
            wait_step,
            supports_rotation,
            current: None,
        }
    }

    /// The thread yields the slots it never read out
    pub fn spawn(self) -> Result<JoinHandle<Vec<Captured>>, PipelineError> {
        thread::Builder::new()
            .name("camsim-readout".to_string())
            .spawn(move || self.run())
            .map_err(|e| PipelineError::Spawn("readout", e))
    }

    fn run(mut self) -> Vec<Captured> {
        info!("Readout loop started");
        while self.step() {}

        let dropped = self.queue.close();
        let unread = self.handoff.drain();
        info!(dropped, unread = unread.len(), "Readout loop exited");
        unread
    }

    /// Returns `false` when the loop must exit
    fn step(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        if self.current.is_none() {
            self.current = self.queue.next_request();
            if self.current.is_none() {
                return !self.handoff.is_closed() || self.handoff.pending() > 0;
            }
        }

        match self.handoff.wait_for_new_frame(self.wait_step) {
            Handoff::Frame(slot, time) => {
                if let Some(request) = self.current.take() {
                    self.deliver(request, slot, time);
                }
                self.queue.finish_request();
                true
            }
            Handoff::TimedOut => true,
            Handoff::Closed => false,
        }
    }

    fn deliver(&self, request: InFlight, slot: FrameSlot, time: CaptureTime) {
        let frame_number = slot.frame_number;
        if frame_number != request.frame_number {
            warn!(
                expected = request.frame_number,
                got = frame_number,
                "Readout frame number mismatch"
            );
        }

        let failed = slot.failed;
        let rotated = self.supports_rotation && slot.orientation != 0;
        let (ready, still, source) = split_slot(slot);

        debug!(frame_number, buffers = ready.len(), "Result ready");
        self.listener.on_result_ready(frame_number, ready, time);

        let Some(still) = still else {
            return;
        };
        match (source, failed) {
            (Some(source), false) if still.status != BufferStatus::Error => {
                let job = EncodeJob {
                    frame_number,
                    still,
                    source,
                    settings: request.still.unwrap_or_default(),
                    capture: request.settings,
                    timestamp: time,
                    rotated,
                };
                if let Err(job) = self.encoder.queue(job) {
                    warn!(frame_number, "Encoder stopped, failing still");
                    fail_still(self.listener.as_ref(), frame_number, job.still);
                }
            }
            _ => fail_still(self.listener.as_ref(), frame_number, still),
        }
    }
}

/// Separate a slot into caller buffers with final status, the still buffer
/// and the encoder's auxiliary source
fn split_slot(slot: FrameSlot) -> (Vec<StreamBuffer>, Option<StreamBuffer>, Option<StreamBuffer>) {
    let failed = slot.failed;
    let mut ready = Vec::with_capacity(slot.buffers.len());
    let mut still = None;
    let mut source = None;
    for mut buffer in slot.buffers {
        if buffer.is_auxiliary() {
            source = Some(buffer);
        } else if buffer.is_still() && still.is_none() {
            still = Some(buffer);
        } else {
            if failed {
                buffer.status = BufferStatus::Error;
            } else if buffer.status == BufferStatus::Pending {
                buffer.status = BufferStatus::Ok;
            }
            ready.push(buffer);
        }
    }
    (ready, still, source)
}

fn fail_still(listener: &dyn PipelineListener, frame_number: u32, mut still: StreamBuffer) {
    still.status = BufferStatus::Error;
    listener.on_still_image_ready(frame_number, still, false);
}

/// Hand a slot that will never be read out back to the listener with every
/// buffer failed
pub(crate) fn abandon(listener: &dyn PipelineListener, mut slot: FrameSlot, time: CaptureTime) {
    let frame_number = slot.frame_number;
    slot.failed = true;
    let (ready, still, _) = split_slot(slot);
    debug!(frame_number, "Failing undelivered slot");
    listener.on_result_ready(frame_number, ready, time);
    if let Some(still) = still {
        fail_still(listener, frame_number, still);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn request(n: u32) -> InFlight {
        InFlight {
            frame_number: n,
            settings: CaptureSettings::default(),
            still: None,
        }
    }

    #[test]
    fn test_wait_for_readout_bounded() {
        let queue = ReadoutQueue::new(2, Duration::from_millis(2), 5);
        let cancel = CancelToken::new();
        queue.queue_request(request(1));
        assert!(queue.wait_for_readout(&cancel));
        queue.queue_request(request(2));

        let start = Instant::now();
        assert!(!queue.wait_for_readout(&cancel));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_wait_for_readout_unblocks() {
        let queue = Arc::new(ReadoutQueue::new(1, Duration::from_millis(5), 1000));
        queue.queue_request(request(1));
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let taken = queue.next_request().unwrap();
                queue.finish_request();
                taken.frame_number
            })
        };
        assert!(queue.wait_for_readout(&CancelToken::new()));
        assert_eq!(reader.join().unwrap(), 1);
    }

    #[test]
    fn test_idle_tracking() {
        let queue = ReadoutQueue::new(2, Duration::from_millis(1), 10);
        assert!(queue.is_idle());
        queue.queue_request(request(1));
        assert!(!queue.is_idle());

        let taken = queue.next_request().unwrap();
        assert_eq!(taken.frame_number, 1);
        assert!(!queue.is_idle());
        assert_eq!(queue.in_flight(), 1);
        assert!(!queue.wait_idle(Duration::from_millis(5)));

        queue.finish_request();
        assert!(queue.is_idle());
        assert!(queue.wait_idle(Duration::ZERO));
    }

    #[test]
    fn test_close_fails_waiters() {
        let queue = ReadoutQueue::new(1, Duration::from_millis(1), 1000);
        queue.queue_request(request(1));
        assert_eq!(queue.close(), 1);
        assert!(!queue.wait_for_readout(&CancelToken::new()));
    }

    #[test]
    fn test_abandon_fails_every_buffer() {
        use crate::pipeline::listener::{ChannelListener, PipelineEvent};

        let (listener, events) = ChannelListener::new();
        let buffers = vec![
            StreamBuffer::nv21(1, 64, 48).unwrap(),
            StreamBuffer::blob(2, 64, 48, 1 << 16).unwrap(),
            StreamBuffer::rgb(crate::capture::frame::AUX_STREAM_ID, 64, 48).unwrap(),
        ];
        abandon(&listener, FrameSlot::new(4, buffers), CaptureTime::now());

        match events.try_recv().unwrap() {
            PipelineEvent::ResultReady {
                frame_number,
                buffers,
                ..
            } => {
                assert_eq!(frame_number, 4);
                assert_eq!(buffers.len(), 1);
                assert_eq!(buffers[0].status, BufferStatus::Error);
            }
            other => panic!("expected a result, got {other:?}"),
        }
        match events.try_recv().unwrap() {
            PipelineEvent::StillImageReady {
                frame_number,
                buffer,
                success,
            } => {
                assert_eq!(frame_number, 4);
                assert!(!success);
                assert_eq!(buffer.status, BufferStatus::Error);
            }
            other => panic!("expected a still, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }
}
