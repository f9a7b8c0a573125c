use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::capture::frame::{CaptureSettings, FrameSlot};

use super::cancel::CancelToken;

const VSYNC_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Control {
    settings: CaptureSettings,
    next: Option<FrameSlot>,
    got_vsync: bool,
    closed: bool,
}

/// Settings and next destination slot shared between the submitter and the
/// capture loop. Held only for copies, never across I/O.
#[derive(Debug, Default)]
pub struct ControlState {
    inner: Mutex<Control>,
    vsync: Condvar,
}

impl ControlState {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            inner: Mutex::new(Control {
                settings,
                ..Control::default()
            }),
            vsync: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> CaptureSettings {
        self.lock().settings
    }

    /// Install settings and destination buffers for the next cycle.
    ///
    /// Hands the slot back if the previous one has not been picked up yet or
    /// the capture loop has exited.
    pub fn set_next(&self, settings: CaptureSettings, slot: FrameSlot) -> Result<(), FrameSlot> {
        let mut control = self.lock();
        if control.closed || control.next.is_some() {
            return Err(slot);
        }
        control.settings = settings;
        control.next = Some(slot);
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.lock().next.is_some()
    }

    /// Remove an unconsumed slot, used when the pipeline shuts down
    pub fn take_pending(&self) -> Option<FrameSlot> {
        self.lock().next.take()
    }

    /// Start-of-cycle snapshot: copy the settings, take the pending slot and
    /// signal vertical sync, all under one lock hold
    pub fn snapshot_and_vsync(&self) -> (CaptureSettings, Option<FrameSlot>) {
        let mut control = self.lock();
        let slot = control.next.take();
        control.got_vsync = true;
        self.vsync.notify_all();
        (control.settings, slot)
    }

    /// Wait for the next vertical sync after this call.
    ///
    /// Returns `false` on timeout, cancellation or once the capture loop has
    /// closed the state.
    pub fn wait_for_vsync(&self, timeout: Duration, cancel: &CancelToken) -> bool {
        let deadline = Instant::now() + timeout;
        let mut control = self.lock();
        control.got_vsync = false;
        loop {
            if control.got_vsync {
                return true;
            }
            if control.closed || cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let step = (deadline - now).min(VSYNC_POLL);
            control = match self.vsync.wait_timeout(control, step) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }

    /// Mark the capture loop gone and release every vsync waiter
    pub fn close(&self) {
        let mut control = self.lock();
        control.closed = true;
        self.vsync.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wake every vsync waiter so it can observe cancellation
    pub fn wake_all(&self) {
        let _control = self.lock();
        self.vsync.notify_all();
    }
}
