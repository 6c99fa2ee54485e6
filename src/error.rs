//! Configuration errors
//!
//! Only construction can fail. Once a `BikeSystem` exists, scheduling,
//! logging and interrupt handling are infallible.

use core::time::Duration;

use crate::task::TaskId;

/// Errors detected while validating a bike configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("task {0} has a zero period")]
    ZeroPeriod(TaskId),

    #[error("task {task}: {duration:?} is not a whole number of microseconds")]
    NotWholeMicros { task: TaskId, duration: Duration },

    #[error("hyperperiod of the task table overflows")]
    HyperperiodOverflow,

    #[error("task {task}: computation time {computation:?} does not fit in period {period:?}")]
    ComputationExceedsPeriod {
        task: TaskId,
        computation: Duration,
        period: Duration,
    },

    #[error("task {task}: phase {phase:?} is not below period {period:?}")]
    PhaseOutOfRange {
        task: TaskId,
        phase: Duration,
        period: Duration,
    },

    #[error("task table lists {found} at slot {slot}")]
    MisplacedTask { slot: usize, found: TaskId },

    #[error("total utilization {percent}% exceeds 100%")]
    Overloaded { percent: u32 },

    #[error("gear range [{min}, {max}] is empty")]
    InvalidGearRange { min: u8, max: u8 },

    #[error("activations of {first} and {second} overlap at {at:?} in the cyclic schedule")]
    ScheduleOverlap {
        first: TaskId,
        second: TaskId,
        at: Duration,
    },

    #[error("reset response bound {bound:?} is below the clock resolution {resolution:?}")]
    ResetBoundUnachievable {
        bound: Duration,
        resolution: Duration,
    },
}
