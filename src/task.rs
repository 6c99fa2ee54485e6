//! Task definition — fixed task identities and their timing descriptors
//!
//! The bike computer runs exactly six periodic tasks. Each one has a fixed
//! slot index, a nominal period, a simulated computation time and a release
//! phase inside the hyperperiod.

use core::fmt;
use core::time::Duration;

/// Identity of a periodic task; doubles as its logger slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskId {
    Gear = 0,
    Speed = 1,
    Temperature = 2,
    Reset = 3,
    Display1 = 4,
    Display2 = 5,
}

impl TaskId {
    /// Number of task slots
    pub const COUNT: usize = 6;

    /// All tasks in slot order
    pub const ALL: [TaskId; TaskId::COUNT] = [
        TaskId::Gear,
        TaskId::Speed,
        TaskId::Temperature,
        TaskId::Reset,
        TaskId::Display1,
        TaskId::Display2,
    ];

    /// Slot index
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            TaskId::Gear => "gear",
            TaskId::Speed => "speed",
            TaskId::Temperature => "temperature",
            TaskId::Reset => "reset",
            TaskId::Display1 => "display1",
            TaskId::Display2 => "display2",
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Task priority (lower number = higher priority)
///
/// Rate-Monotonic: the shorter the period, the higher the priority.
/// Interrupt handlers sit above every periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskPriority(pub u8);

impl TaskPriority {
    /// Highest periodic priority
    pub const HIGH: TaskPriority = TaskPriority(1);
    /// Lowest periodic priority
    pub const IDLE: TaskPriority = TaskPriority(255);

    /// Priority of the `rank`-th shortest period class (0 = shortest)
    pub const fn rate_monotonic(rank: usize) -> TaskPriority {
        let level = TaskPriority::HIGH.0 as usize + rank;
        if level >= 255 {
            TaskPriority::IDLE
        } else {
            TaskPriority(level as u8)
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Lifecycle of a task inside the event queue
///
/// ```text
///   Idle ──call_every/call_at──► Scheduled ──pop_due──► Running
///    ▲                               ▲                     │
///    │            cancel             │  complete(periodic) │
///    └───────────────────────────────┴─────────────────────┘
///                         complete(one-shot)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not in the queue
    Idle,
    /// Waiting in the queue for its due time
    Scheduled,
    /// Body currently executing
    Running,
}

/// Static timing descriptor of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: TaskId,
    /// Nominal activation period
    pub period: Duration,
    /// Simulated computation time (busy work performed by the body)
    pub computation: Duration,
    /// Release offset of the first activation inside the hyperperiod
    pub phase: Duration,
}

impl TaskSpec {
    pub const fn new(id: TaskId, period: Duration, computation: Duration, phase: Duration) -> Self {
        Self {
            id,
            period,
            computation,
            phase,
        }
    }

    /// CPU utilization for this task
    pub fn utilization(&self) -> f32 {
        if self.period.is_zero() {
            0.0
        } else {
            self.computation.as_secs_f32() / self.period.as_secs_f32()
        }
    }
}
