use std::time::Instant;

use once_cell::sync::Lazy;

/// Process-wide reference point for capture timestamps
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds on a monotonic clock shared by every pipeline stage.
///
/// The first call pins the epoch, so timestamps from different threads are
/// directly comparable.
pub fn monotonic_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Round `value` up to the next multiple of `align` (a power of two)
pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Rolling frames-per-second estimate, reported every `window` frames
#[derive(Debug)]
pub struct FpsCounter {
    window: u32,
    frames: u32,
    started: Instant,
    last_fps: f64,
}

impl FpsCounter {
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            frames: 0,
            started: Instant::now(),
            last_fps: 0.0,
        }
    }

    /// Count one frame; returns the new estimate when a window completes
    pub fn tick(&mut self) -> Option<f64> {
        self.frames += 1;
        if self.frames < self.window {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        self.last_fps = if elapsed > 0.0 {
            self.frames as f64 / elapsed
        } else {
            0.0
        };
        self.frames = 0;
        self.started = Instant::now();
        Some(self.last_fps)
    }

    pub fn last(&self) -> f64 {
        self.last_fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(5, 16), 16);
        assert_eq!(align_up(32, 16), 32);
        assert_eq!(align_up(33, 32), 64);
    }

    #[test]
    fn test_monotonic_clock() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_fps_counter_window() {
        let mut counter = FpsCounter::new(3);
        assert!(counter.tick().is_none());
        assert!(counter.tick().is_none());
        assert!(counter.tick().is_some());
        assert!(counter.last() >= 0.0);
    }
}
