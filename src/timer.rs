//! System timer — monotonic clock and periodic wake-ups
//!
//! Provides microsecond-resolution timing for the schedulers, the task
//! logger and the device debouncers. Schedulers park until
//! [`SPIN_THRESHOLD`] before a release and spin the rest, so releases land
//! well inside a millisecond.

use std::time::{Duration, Instant};

/// Remaining wait below which the timer spins instead of sleeping
pub const SPIN_THRESHOLD: Duration = Duration::from_micros(300);

/// Monotonic clock anchored at a fixed epoch
///
/// Copies share the same epoch, so timestamps taken through any copy are
/// directly comparable.
#[derive(Debug, Clone, Copy)]
pub struct SysTimer {
    epoch: Instant,
}

impl SysTimer {
    /// Start a timer whose epoch is now
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Current time in microseconds since the epoch
    pub fn now_us(&self) -> u64 {
        self.us_at(Instant::now())
    }

    /// Microseconds between the epoch and `instant` (0 if earlier)
    pub fn us_at(&self, instant: Instant) -> u64 {
        instant.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// Elapsed microseconds since a reference point
    pub fn elapsed_since(&self, reference_us: u64) -> u64 {
        self.now_us().saturating_sub(reference_us)
    }

    /// Smallest non-zero step the platform clock can observe
    pub fn resolution() -> Duration {
        let start = Instant::now();
        loop {
            let now = Instant::now();
            if now > start {
                return now - start;
            }
        }
    }
}

/// Absolute release instants of one periodic context
///
/// Releases are computed from the origin, never from the previous wake-up,
/// so late wake-ups do not accumulate drift.
#[derive(Debug, Clone)]
pub struct PeriodicWake {
    origin: Instant,
    period: Duration,
    releases: u32,
}

impl PeriodicWake {
    pub fn new(origin: Instant, period: Duration) -> Self {
        Self {
            origin,
            period,
            releases: 0,
        }
    }

    /// Instant of the next release
    pub fn next_release(&self) -> Instant {
        self.origin + self.period * self.releases
    }

    /// Consume the pending release, returning its instant
    pub fn advance(&mut self) -> Instant {
        let release = self.next_release();
        self.releases += 1;
        release
    }
}

/// Burn CPU until `deadline` (simulated computation, final wait stretch)
pub fn busy_wait_until(deadline: Instant) {
    busy_wait_until_with(deadline, || {});
}

/// Like [`busy_wait_until`], calling `yield_point` on every turn so a
/// higher-priority context can take the processor.
pub fn busy_wait_until_with(deadline: Instant, mut yield_point: impl FnMut()) {
    while Instant::now() < deadline {
        yield_point();
        core::hint::spin_loop();
    }
}
