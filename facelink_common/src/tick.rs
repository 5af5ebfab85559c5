//! Cooperative tick scheduling.
//!
//! Every facelink process is single-threaded and cooperative: a worker calls
//! its stage `on_tick` back-to-back and the host pumps its message queues on a
//! short interval. Both go through [`run_loop`], which paces the loop against a
//! [`Clock`] so timing can be tested with a [`ManualClock`] instead of sleeps.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

/// Source of monotonic time and sleeping.
pub trait Clock {
    /// Current monotonic time.
    fn now(&self) -> Instant;

    /// Suspend the calling loop for `duration`.
    fn sleep(&mut self, duration: Duration);
}

/// Wall clock backed by `Instant::now` and `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock for tests: sleeping only advances the reading.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Duration,
    slept: Duration,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Duration::ZERO,
            slept: Duration::ZERO,
        }
    }

    /// Move time forward without counting it as sleep.
    pub fn advance(&mut self, by: Duration) {
        self.offset += by;
    }

    /// Total time spent in [`Clock::sleep`].
    pub fn slept(&self) -> Duration {
        self.slept
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.offset
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset
    }

    fn sleep(&mut self, duration: Duration) {
        self.offset += duration;
        self.slept += duration;
    }
}

/// Run `tick` until it breaks, spacing tick starts at least `min_interval` apart.
///
/// `tick` receives the loop clock's reading at the start of the tick. When a
/// tick takes longer than `min_interval` the next one starts immediately.
pub fn run_loop<C, F, B>(clock: &mut C, min_interval: Duration, mut tick: F) -> B
where
    C: Clock,
    F: FnMut(Instant) -> ControlFlow<B>,
{
    loop {
        let started = clock.now();
        if let ControlFlow::Break(value) = tick(started) {
            return value;
        }
        let elapsed = clock.now().saturating_duration_since(started);
        if elapsed < min_interval {
            clock.sleep(min_interval - elapsed);
        }
    }
}
