//! Bike configuration
//!
//! Compile-time constants for the devices and the nominal task table,
//! plus [`BikeConfig`], the validated bundle handed to a `BikeSystem`.
//! The task set is fixed: six tasks, known before the system starts.

use core::time::Duration;

use crate::error::ConfigError;
use crate::task::{TaskId, TaskSpec};

/// Lowest selectable gear
pub const MIN_GEAR: u8 = 1;
/// Highest selectable gear
pub const MAX_GEAR: u8 = 9;

/// Joystick edges closer than this are one mechanical bounce.
pub const GEAR_DEBOUNCE: Duration = Duration::from_millis(10);
/// Reset button edges closer than this are one press.
pub const RESET_DEBOUNCE: Duration = Duration::from_millis(50);

/// Target reset response latency (edge to callback), multi-tasking only
pub const MAX_RESET_RESPONSE: Duration = Duration::from_micros(20);
/// Target jitter between consecutive reset response latencies
pub const MAX_RESET_JITTER: Duration = Duration::from_micros(3);

const fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// Nominal task table, in slot order.
///
/// Phases place every activation in its own window: the 1600 ms
/// hyperperiod is filled exactly once with no overlap.
///
/// ```text
/// ms   0    200  300  400  600  700  800  1000 1100 1200 1400 1600
///      |spd |gear|rst |spd |tmp |d2  |spd |gear|rst |spd |d1  |
/// ```
pub const TASK_TABLE: [TaskSpec; TaskId::COUNT] = [
    TaskSpec::new(TaskId::Gear, ms(800), ms(100), ms(200)),
    TaskSpec::new(TaskId::Speed, ms(400), ms(200), ms(0)),
    TaskSpec::new(TaskId::Temperature, ms(1600), ms(100), ms(600)),
    TaskSpec::new(TaskId::Reset, ms(800), ms(100), ms(300)),
    TaskSpec::new(TaskId::Display1, ms(1600), ms(200), ms(1400)),
    TaskSpec::new(TaskId::Display2, ms(1600), ms(100), ms(700)),
];

/// Complete configuration of one bike system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BikeConfig {
    /// Task table indexed by `TaskId::index()`
    pub tasks: [TaskSpec; TaskId::COUNT],
    pub min_gear: u8,
    pub max_gear: u8,
    pub gear_debounce: Duration,
    pub reset_debounce: Duration,
    pub max_reset_response: Duration,
    pub max_reset_jitter: Duration,
}

impl Default for BikeConfig {
    fn default() -> Self {
        Self {
            tasks: TASK_TABLE,
            min_gear: MIN_GEAR,
            max_gear: MAX_GEAR,
            gear_debounce: GEAR_DEBOUNCE,
            reset_debounce: RESET_DEBOUNCE,
            max_reset_response: MAX_RESET_RESPONSE,
            max_reset_jitter: MAX_RESET_JITTER,
        }
    }
}

impl BikeConfig {
    /// Timing descriptor of `task`
    #[inline]
    pub fn spec(&self, task: TaskId) -> &TaskSpec {
        &self.tasks[task.index()]
    }

    /// Structural checks shared by every scheduling strategy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_gear > self.max_gear {
            return Err(ConfigError::InvalidGearRange {
                min: self.min_gear,
                max: self.max_gear,
            });
        }

        for (slot, spec) in self.tasks.iter().enumerate() {
            if spec.id.index() != slot {
                return Err(ConfigError::MisplacedTask { slot, found: spec.id });
            }
            if spec.period.is_zero() {
                return Err(ConfigError::ZeroPeriod(spec.id));
            }
            // Ticks, windows and utilization are all integer microseconds.
            for duration in [spec.period, spec.computation, spec.phase] {
                if duration.subsec_nanos() % 1_000 != 0 {
                    return Err(ConfigError::NotWholeMicros {
                        task: spec.id,
                        duration,
                    });
                }
            }
            if spec.computation >= spec.period {
                return Err(ConfigError::ComputationExceedsPeriod {
                    task: spec.id,
                    computation: spec.computation,
                    period: spec.period,
                });
            }
            if spec.phase >= spec.period {
                return Err(ConfigError::PhaseOutOfRange {
                    task: spec.id,
                    phase: spec.phase,
                    period: spec.period,
                });
            }
        }

        let hyper = self.hyperperiod_us().ok_or(ConfigError::HyperperiodOverflow)? as u128;
        // Busy time per hyperperiod in whole µs, so an exactly full table passes
        let busy: u128 = self
            .tasks
            .iter()
            .map(|spec| spec.computation.as_micros() * (hyper / spec.period.as_micros()))
            .sum();
        if busy > hyper {
            return Err(ConfigError::Overloaded {
                percent: (busy * 100 / hyper) as u32,
            });
        }
        Ok(())
    }

    /// Total CPU utilization (sum of Ci/Ti over all tasks)
    pub fn total_utilization(&self) -> f32 {
        self.tasks.iter().map(TaskSpec::utilization).sum()
    }

    /// Scheduler tick: greatest common divisor of every period and phase.
    pub fn tick(&self) -> Duration {
        let us = self
            .tasks
            .iter()
            .flat_map(|spec| [spec.period, spec.phase])
            .map(|d| d.as_micros() as u64)
            .fold(0, gcd);
        Duration::from_micros(us)
    }

    /// Hyperperiod: least common multiple of every period.
    ///
    /// Saturates on overflow; [`validate`](Self::validate) rejects such tables.
    pub fn hyperperiod(&self) -> Duration {
        Duration::from_micros(self.hyperperiod_us().unwrap_or(u64::MAX))
    }

    fn hyperperiod_us(&self) -> Option<u64> {
        self.tasks
            .iter()
            .map(|spec| spec.period.as_micros() as u64)
            .filter(|&p| p != 0)
            .try_fold(1, |acc, p| (acc / gcd(acc, p)).checked_mul(p))
    }
}

/// Greatest common divisor (Euclid); `gcd(0, b) == b`
fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}
