//! Bounded capture-to-readout hand-off
//!
//! A fixed-capacity ring of captured slots guarded by one lock with a
//! condition for each direction. The producer blocks while the ring is full,
//! so a completed slot is never dropped; with the default depth of one this
//! is the single in-flight readout slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::warn;

use super::cancel::CancelToken;
use crate::capture::frame::{CaptureTime, FrameSlot};

/// Captured slot with its capture timestamp
pub type Captured = (FrameSlot, CaptureTime);

/// Outcome of waiting for a captured slot
#[derive(Debug)]
pub enum Handoff {
    Frame(FrameSlot, CaptureTime),
    TimedOut,
    /// The producer is gone and nothing is left to read
    Closed,
}

struct Ring {
    slots: HeapRb<Captured>,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    published: AtomicUsize,
    consumed: AtomicUsize,
    backpressure_waits: AtomicUsize,
    max_pending: AtomicUsize,
}

/// Snapshot of hand-off counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoffStats {
    pub published: usize,
    pub consumed: usize,
    pub backpressure_waits: usize,
    pub max_pending: usize,
}

pub struct ReadoutHandoff {
    ring: Mutex<Ring>,
    /// Signalled when a slot is published or the ring closes
    ready: Condvar,
    /// Signalled when a slot is consumed
    consumed: Condvar,
    wait_step: Duration,
    stats: CachePadded<Stats>,
}

impl ReadoutHandoff {
    /// `depth` is clamped to at least one slot
    pub fn new(depth: usize, wait_step: Duration) -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: HeapRb::new(depth.max(1)),
                closed: false,
            }),
            ready: Condvar::new(),
            consumed: Condvar::new(),
            wait_step,
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a captured slot for readout, blocking while the ring is full.
    ///
    /// Every wait step that expires is logged and retried. The slot is handed
    /// back only if the hand-off is closed or `cancel` fires.
    pub fn publish(
        &self,
        slot: FrameSlot,
        time: CaptureTime,
        cancel: &CancelToken,
    ) -> Result<(), Captured> {
        let mut ring = self.lock();
        let mut waits = 0u32;
        while ring.slots.is_full() {
            if ring.closed || cancel.is_cancelled() {
                return Err((slot, time));
            }
            ring = match self.consumed.wait_timeout(ring, self.wait_step) {
                Ok((guard, result)) => {
                    if result.timed_out() {
                        waits += 1;
                        self.stats.backpressure_waits.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            frame_number = slot.frame_number,
                            waits, "Readout has not consumed the previous frame"
                        );
                    }
                    guard
                }
                Err(e) => e.into_inner().0,
            };
        }
        if ring.closed {
            return Err((slot, time));
        }
        if let Err(entry) = ring.slots.try_push((slot, time)) {
            return Err(entry);
        }
        let pending = ring.slots.occupied_len();
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.stats.max_pending.fetch_max(pending, Ordering::Relaxed);
        self.ready.notify_all();
        Ok(())
    }

    /// Wait up to `timeout` for the oldest captured slot
    pub fn wait_for_new_frame(&self, timeout: Duration) -> Handoff {
        let deadline = Instant::now() + timeout;
        let mut ring = self.lock();
        loop {
            if let Some((slot, time)) = ring.slots.try_pop() {
                self.stats.consumed.fetch_add(1, Ordering::Relaxed);
                self.consumed.notify_all();
                return Handoff::Frame(slot, time);
            }
            if ring.closed {
                return Handoff::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Handoff::TimedOut;
            }
            ring = match self.ready.wait_timeout(ring, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }

    /// Stop accepting slots. Slots already queued can still be read.
    pub fn close(&self) {
        let mut ring = self.lock();
        ring.closed = true;
        self.ready.notify_all();
        self.consumed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn pending(&self) -> usize {
        self.lock().slots.occupied_len()
    }

    /// Remove every queued slot
    pub fn drain(&self) -> Vec<Captured> {
        let mut ring = self.lock();
        let drained: Vec<Captured> = std::iter::from_fn(|| ring.slots.try_pop()).collect();
        self.consumed.notify_all();
        drained
    }

    pub fn stats(&self) -> HandoffStats {
        HandoffStats {
            published: self.stats.published.load(Ordering::Relaxed),
            consumed: self.stats.consumed.load(Ordering::Relaxed),
            backpressure_waits: self.stats.backpressure_waits.load(Ordering::Relaxed),
            max_pending: self.stats.max_pending.load(Ordering::Relaxed),
        }
    }
}
