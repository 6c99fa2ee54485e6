//! Task logger — per-slot activation and computation timing
//!
//! One slot per task. A slot has a single writer (its task never runs
//! concurrently with itself), so writers never wait. Readers of the
//! activation pair retry around a per-slot sequence counter instead of
//! taking a lock; there is no lock shared between slots.
//!
//! Before two activations have been recorded, `period` is zero. Before
//! the first completion, `computation_time` is zero.

use core::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use core::time::Duration;

use log::debug;

use crate::task::TaskId;
use crate::timer::SysTimer;

#[derive(Debug, Default)]
struct Slot {
    /// Odd while an activation is being written; `seq / 2` activations so far
    seq: AtomicU32,
    last_us: AtomicU64,
    previous_us: AtomicU64,
    computation_us: AtomicU64,
}

/// Timing record of the six task slots
#[derive(Debug)]
pub struct TaskLogger {
    timer: SysTimer,
    slots: [Slot; TaskId::COUNT],
}

impl TaskLogger {
    pub fn new(timer: SysTimer) -> Self {
        Self {
            timer,
            slots: Default::default(),
        }
    }

    pub fn timer(&self) -> SysTimer {
        self.timer
    }

    /// Stamp a new activation of `task` with the current time.
    pub fn record_activation(&self, task: TaskId) {
        let now = self.timer.now_us();
        let slot = &self.slots[task.index()];

        let seq = slot.seq.load(Ordering::Relaxed);
        slot.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        let last = slot.last_us.load(Ordering::Relaxed);
        slot.previous_us.store(last, Ordering::Relaxed);
        slot.last_us.store(now, Ordering::Relaxed);

        slot.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Store the measured computation time of the latest activation.
    pub fn record_computation_time(&self, task: TaskId, computation: Duration) {
        let us = computation.as_micros().min(u64::MAX as u128) as u64;
        self.slots[task.index()]
            .computation_us
            .store(us, Ordering::Release);
    }

    /// Time between the two most recent activations
    pub fn period(&self, task: TaskId) -> Duration {
        let (activations, last, previous) = self.read_activations(task);
        if activations < 2 {
            return Duration::ZERO;
        }
        Duration::from_micros(last.saturating_sub(previous))
    }

    /// Most recent measured computation time
    pub fn computation_time(&self, task: TaskId) -> Duration {
        Duration::from_micros(self.slots[task.index()].computation_us.load(Ordering::Acquire))
    }

    /// Activations recorded so far
    pub fn activation_count(&self, task: TaskId) -> u32 {
        self.read_activations(task).0
    }

    /// Time of the most recent activation, relative to the system epoch
    pub fn last_activation(&self, task: TaskId) -> Option<Duration> {
        let (activations, last, _) = self.read_activations(task);
        (activations > 0).then(|| Duration::from_micros(last))
    }

    /// Log period and computation time of every slot.
    pub fn report(&self) {
        for task in TaskId::ALL {
            debug!(
                "{:<11} period {:>7} us  computation {:>7} us  activations {}",
                task.name(),
                self.period(task).as_micros(),
                self.computation_time(task).as_micros(),
                self.activation_count(task)
            );
        }
    }

    fn read_activations(&self, task: TaskId) -> (u32, u64, u64) {
        let slot = &self.slots[task.index()];
        loop {
            let before = slot.seq.load(Ordering::Acquire);
            if before % 2 == 1 {
                core::hint::spin_loop();
                continue;
            }
            let last = slot.last_us.load(Ordering::Relaxed);
            let previous = slot.previous_us.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if slot.seq.load(Ordering::Relaxed) == before {
                return (before / 2, last, previous);
            }
        }
    }
}
