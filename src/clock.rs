//! Monotonic clock abstraction
//!
//! Termination timestamps and shutdown-drain deadlines must never go
//! backwards, so the coordinator takes its time from an injected monotonic
//! clock rather than the wall clock.

use std::time::Instant;

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary, fixed epoch.
    fn nanos(&self) -> u64;

    /// Milliseconds since the same epoch as [`Clock::nanos`].
    fn millis(&self) -> u64 {
        self.nanos() / 1_000_000
    }
}

/// Clock backed by [`std::time::Instant`], anchored at construction.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}
