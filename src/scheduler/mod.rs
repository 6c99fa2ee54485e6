//! Scheduling strategies
//!
//! Three engines activate the same [`TaskSet`] at its nominal periods:
//!
//! | Strategy | Contexts | Device edges served by |
//! |---|---|---|
//! | [`StaticScheduling`] | caller only, cooperative superloop | Gear / Reset task polling |
//! | [`EventScheduling`] | caller only, cooperative event queue | deferred queue events |
//! | [`MultiTasking`] | one thread per period class | interrupt context |
//!
//! All of them implement [`Scheduler`]; `BikeSystem` is generic over it,
//! so the strategy is resolved at compile time.

pub mod event_queue;
pub mod multi_tasking;
pub mod static_scheduling;

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Instant;

use log::warn;

use crate::config::BikeConfig;
use crate::error::ConfigError;
use crate::logger::TaskLogger;
use crate::task::TaskId;
use crate::task_set::TaskSet;
use crate::timer::{busy_wait_until, SysTimer, SPIN_THRESHOLD};

pub use event_queue::{EventHandle, EventQueue, EventScheduling, Work};
pub use multi_tasking::MultiTasking;
pub use static_scheduling::{CyclicSchedule, StaticScheduling};

/// Common contract of the scheduling strategies
pub trait Scheduler: Send + Sync + Sized {
    /// Short strategy name for logs
    const NAME: &'static str;

    /// Build the strategy for `config`, rejecting configurations it cannot honour.
    fn new(config: &BikeConfig, timer: SysTimer) -> Result<Self, ConfigError>;

    /// Wire the device interrupt handlers this strategy needs.
    fn attach(&self, tasks: &Arc<TaskSet>);

    /// Run the task set until [`stop`](Self::stop) is requested. Blocks the caller.
    fn start(&self, tasks: &TaskSet);

    /// Request a cooperative stop; a no-op once stopping or stopped.
    fn stop(&self);

    fn task_logger(&self) -> &TaskLogger;

    fn state(&self) -> RunState;
}

/// Scheduler run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    NotStarted = 0,
    Running = 1,
    StopRequested = 2,
    Stopped = 3,
}

impl RunState {
    fn from_u8(raw: u8) -> RunState {
        match raw {
            0 => RunState::NotStarted,
            1 => RunState::Running,
            2 => RunState::StopRequested,
            _ => RunState::Stopped,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::NotStarted => "not started",
            RunState::Running => "running",
            RunState::StopRequested => "stop requested",
            RunState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why [`RunControl::wait_until`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Deadline,
    Interrupt,
    Stop,
}

/// Every execution context of a strategy, plus its caller
const MAX_CONTEXTS: usize = TaskId::COUNT + 1;

/// Run-state machine and wake-up registry shared by a strategy's contexts
///
/// `not started → running → stop requested → stopped`; a stop requested
/// before start goes straight to `stopped`.
#[derive(Debug)]
pub struct RunControl {
    state: AtomicU8,
    waiters: spin::Mutex<heapless::Vec<Thread, MAX_CONTEXTS>>,
}

impl RunControl {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::NotStarted as u8),
            waiters: spin::Mutex::new(heapless::Vec::new()),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `running` and register the caller; false if already used.
    pub fn begin(&self) -> bool {
        let began = self
            .state
            .compare_exchange(
                RunState::NotStarted as u8,
                RunState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if began {
            self.register_current();
        }
        began
    }

    /// Register the calling thread to be unparked on stop.
    pub fn register_current(&self) {
        if self.waiters.lock().push(thread::current()).is_err() {
            warn!("run control: too many contexts, stop will be seen at next wake");
        }
    }

    /// Returns true if this call changed the state.
    pub fn request_stop(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match RunState::from_u8(current) {
                RunState::NotStarted => RunState::Stopped,
                RunState::Running => RunState::StopRequested,
                RunState::StopRequested | RunState::Stopped => return false,
            };
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.wake_all();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark the strategy stopped once every context has exited.
    pub fn finish(&self) {
        self.state.store(RunState::Stopped as u8, Ordering::Release);
        self.waiters.lock().clear();
    }

    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.state() != RunState::Running
    }

    fn wake_all(&self) {
        for waiter in self.waiters.lock().iter() {
            waiter.unpark();
        }
    }

    /// Park until `deadline`, a stop request, or `interrupted()` turning true.
    ///
    /// The last [`SPIN_THRESHOLD`] before the deadline is spun, not parked.
    pub fn wait_until(&self, deadline: Instant, interrupted: impl Fn() -> bool) -> Wake {
        loop {
            if self.is_stop_requested() {
                return Wake::Stop;
            }
            if interrupted() {
                return Wake::Interrupt;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wake::Deadline;
            }
            let remaining = deadline - now;
            if remaining > SPIN_THRESHOLD {
                thread::park_timeout(remaining - SPIN_THRESHOLD);
            } else {
                busy_wait_until(deadline);
            }
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lifecycle() {
        let control = RunControl::new();
        assert_eq!(control.state(), RunState::NotStarted);
        assert!(control.begin());
        assert_eq!(control.state(), RunState::Running);
        assert!(!control.begin());

        assert!(control.request_stop());
        assert_eq!(control.state(), RunState::StopRequested);
        assert!(!control.request_stop());

        control.finish();
        assert_eq!(control.state(), RunState::Stopped);
        assert!(!control.request_stop());
    }

    #[test]
    fn test_stop_before_start() {
        let control = RunControl::new();
        assert!(control.request_stop());
        assert_eq!(control.state(), RunState::Stopped);
        assert!(!control.begin());
    }

    #[test]
    fn test_wait_until_deadline() {
        let control = RunControl::new();
        assert!(control.begin());
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(control.wait_until(deadline, || false), Wake::Deadline);
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_wait_until_interrupted() {
        let control = RunControl::new();
        assert!(control.begin());
        let deadline = Instant::now() + Duration::from_secs(10);
        assert_eq!(control.wait_until(deadline, || true), Wake::Interrupt);
    }

    #[test]
    fn test_stop_wakes_parked_context() {
        let control = Arc::new(RunControl::new());
        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || {
                assert!(control.begin());
                let start = Instant::now();
                let wake = control.wait_until(start + Duration::from_secs(30), || false);
                (wake, start.elapsed())
            })
        };
        while control.state() != RunState::Running {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        control.request_stop();

        let (wake, waited) = waiter.join().unwrap();
        assert_eq!(wake, Wake::Stop);
        assert!(waited < Duration::from_secs(5));
    }
}
