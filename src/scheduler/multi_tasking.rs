//! Multi-tasking — one execution context per period class
//!
//! Tasks sharing a period run back to back on the same context, so the
//! table maps to three contexts: 400 ms (speed), 800 ms (gear, reset)
//! and 1600 ms (temperature, display 1, display 2). Contexts are ranked
//! rate-monotonically and named after their priority.
//!
//! The rank is enforced in-crate by a `PriorityGate`, not by OS thread
//! priorities: a context only executes while no higher-priority context is
//! released, so a lower context's body is preempted at its next yield
//! point and the shorter periods hold even on a single host core.
//!
//! Device edges are served in interrupt context: a joystick shift is
//! acknowledged and a reset press served before the edge handler returns,
//! without waiting for any periodic context.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::{RunControl, RunState, Scheduler, Wake};
use crate::config::BikeConfig;
use crate::error::ConfigError;
use crate::logger::TaskLogger;
use crate::task::{TaskId, TaskPriority};
use crate::task_set::TaskSet;
use crate::timer::{PeriodicWake, SysTimer};

/// Upper bound on one wait of the parked caller
const CALLER_WAIT: Duration = Duration::from_secs(1);

/// How long before its release a context claims the processor
const PREEMPT_LEAD: Duration = Duration::from_millis(5);

/// Tasks released together on one context
#[derive(Debug, Clone)]
struct TaskGroup {
    period: Duration,
    priority: TaskPriority,
    /// Slot order
    tasks: heapless::Vec<TaskId, { TaskId::COUNT }>,
}

impl TaskGroup {
    fn utilization(&self, config: &BikeConfig) -> f32 {
        self.tasks
            .iter()
            .map(|&task| config.spec(task).utilization())
            .sum()
    }
}

/// Single-processor dispatch between the period-class contexts
///
/// Bit `rank` is set while that context is released and not done. A
/// context makes progress only while no higher-priority bit is set.
#[derive(Debug, Default)]
struct PriorityGate {
    released: AtomicU32,
}

impl PriorityGate {
    fn claim(&self, rank: usize) {
        self.released.fetch_or(1u32 << rank, Ordering::AcqRel);
    }

    fn retire(&self, rank: usize) {
        self.released.fetch_and(!(1u32 << rank), Ordering::AcqRel);
    }

    /// A higher-priority context than `rank` is released
    fn is_preempted(&self, rank: usize) -> bool {
        self.released.load(Ordering::Acquire) & ((1u32 << rank) - 1) != 0
    }

    /// Give the processor away until `rank` is the highest released context.
    fn hold(&self, rank: usize, control: &RunControl) {
        while self.is_preempted(rank) && !control.is_stop_requested() {
            thread::yield_now();
        }
    }
}

#[derive(Debug)]
pub struct MultiTasking {
    groups: heapless::Vec<TaskGroup, { TaskId::COUNT }>,
    gate: PriorityGate,
    logger: TaskLogger,
    control: RunControl,
}

impl Scheduler for MultiTasking {
    const NAME: &'static str = "multi-tasking";

    /// Fails with [`ConfigError::ResetBoundUnachievable`] when the host
    /// clock cannot even observe the reset response bound.
    fn new(config: &BikeConfig, timer: SysTimer) -> Result<Self, ConfigError> {
        config.validate()?;
        check_reset_bound(config, SysTimer::resolution())?;

        let groups = period_classes(config);
        let utilization = config.total_utilization();
        if is_rm_schedulable(config, &groups) {
            debug!(
                "{}: {} contexts, utilization {:.3}",
                Self::NAME,
                groups.len(),
                utilization
            );
        } else {
            warn!(
                "{}: utilization {:.3} above the rate-monotonic bound {:.3}",
                Self::NAME,
                utilization,
                liu_layland_bound(groups.len())
            );
        }

        Ok(Self {
            groups,
            gate: PriorityGate::default(),
            logger: TaskLogger::new(timer),
            control: RunControl::new(),
        })
    }

    fn attach(&self, tasks: &Arc<TaskSet>) {
        // Weak: the device owning the handler lives inside the task set.
        let weak = Arc::downgrade(tasks);
        tasks.gear_device().attach(Box::new(move |gear| {
            if let Some(tasks) = weak.upgrade() {
                tasks.apply_gear(gear);
            }
        }));

        let weak = Arc::downgrade(tasks);
        tasks.reset_device().attach(Box::new(move || {
            if let Some(tasks) = weak.upgrade() {
                tasks.process_resets();
            }
        }));
    }

    fn start(&self, tasks: &TaskSet) {
        if !self.control.begin() {
            warn!("{} scheduler: start ignored ({})", Self::NAME, self.control.state());
            return;
        }
        let origin = Instant::now();
        info!("{} scheduler started: {} contexts", Self::NAME, self.groups.len());
        // Every context is released at the origin.
        for rank in 0..self.groups.len() {
            self.gate.claim(rank);
        }

        thread::scope(|scope| {
            for (rank, group) in self.groups.iter().enumerate() {
                let spawned = thread::Builder::new()
                    .name(format!("bike-{}-{}ms", group.priority, group.period.as_millis()))
                    .spawn_scoped(scope, move || self.run_group(rank, group, tasks, origin));
                if let Err(err) = spawned {
                    error!(
                        "{}: cannot spawn {} context: {}",
                        Self::NAME,
                        group.priority,
                        err
                    );
                    self.control.request_stop();
                }
            }

            while self
                .control
                .wait_until(Instant::now() + CALLER_WAIT, || false)
                != Wake::Stop
            {}
        });

        self.control.finish();
        self.logger.report();
        info!("{} scheduler stopped", Self::NAME);
    }

    fn stop(&self) {
        if self.control.request_stop() {
            info!("{} scheduler: stop requested", Self::NAME);
        }
    }

    fn task_logger(&self) -> &TaskLogger {
        &self.logger
    }

    fn state(&self) -> RunState {
        self.control.state()
    }
}

impl MultiTasking {
    fn run_group(&self, rank: usize, group: &TaskGroup, tasks: &TaskSet, origin: Instant) {
        self.control.register_current();
        debug!("{} context: {:?} every {:?}", group.priority, group.tasks, group.period);

        let mut wake = PeriodicWake::new(origin, group.period);
        loop {
            let release = wake.next_release();
            let claim_at = release.checked_sub(PREEMPT_LEAD).unwrap_or(release);
            if self.control.wait_until(claim_at, || false) == Wake::Stop {
                break;
            }
            // Lower contexts are off the processor before the release instant.
            self.gate.claim(rank);
            if self.control.wait_until(release, || false) == Wake::Stop {
                break;
            }
            wake.advance();
            for &task in group.tasks.iter() {
                tasks.run_preemptible(task, &self.logger, || self.gate.hold(rank, &self.control));
            }
            self.gate.retire(rank);
        }
        self.gate.retire(rank);
    }
}

/// The reset path can only be held to its bound if the clock resolves it.
fn check_reset_bound(config: &BikeConfig, resolution: Duration) -> Result<(), ConfigError> {
    if resolution > config.max_reset_response {
        return Err(ConfigError::ResetBoundUnachievable {
            bound: config.max_reset_response,
            resolution,
        });
    }
    Ok(())
}

/// Group tasks by period and rank the groups rate-monotonically.
fn period_classes(config: &BikeConfig) -> heapless::Vec<TaskGroup, { TaskId::COUNT }> {
    let mut groups: heapless::Vec<TaskGroup, { TaskId::COUNT }> = heapless::Vec::new();
    // Capacities equal the task count, so the pushes below cannot fail.
    for spec in config.tasks.iter() {
        match groups.iter_mut().find(|group| group.period == spec.period) {
            Some(group) => {
                let _ = group.tasks.push(spec.id);
            }
            None => {
                let mut tasks = heapless::Vec::new();
                let _ = tasks.push(spec.id);
                let _ = groups.push(TaskGroup {
                    period: spec.period,
                    priority: TaskPriority::IDLE,
                    tasks,
                });
            }
        }
    }

    groups.sort_unstable_by_key(|group| group.period);
    for (rank, group) in groups.iter_mut().enumerate() {
        group.priority = TaskPriority::rate_monotonic(rank);
    }
    groups
}

/// Rate-monotonic schedulability of the period classes.
///
/// Harmonic periods are schedulable up to full utilization; otherwise the
/// Liu & Layland bound applies.
fn is_rm_schedulable(config: &BikeConfig, groups: &[TaskGroup]) -> bool {
    let total: f32 = groups.iter().map(|group| group.utilization(config)).sum();
    let harmonic = groups.windows(2).all(|pair| {
        let (short, long) = (pair[0].period.as_micros(), pair[1].period.as_micros());
        long % short == 0
    });
    let bound = if harmonic {
        1.0
    } else {
        liu_layland_bound(groups.len())
    };
    total <= bound + f32::EPSILON * 8.0
}

/// Liu & Layland bound: n(2^(1/n) - 1)
fn liu_layland_bound(n: usize) -> f32 {
    if n == 0 {
        return 1.0;
    }
    let n = n as f32;
    n * (2f32.powf(1.0 / n) - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{LogDisplay, SimulatedSensor};
    use crate::task::TaskSpec;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn task_set(config: &BikeConfig, timer: SysTimer) -> Arc<TaskSet> {
        Arc::new(TaskSet::new(
            config,
            timer,
            Box::new(SimulatedSensor::default()),
            Box::new(LogDisplay),
        ))
    }

    #[test]
    fn test_period_classes() {
        let groups = period_classes(&BikeConfig::default());
        assert_eq!(groups.len(), 3);

        assert_eq!(groups[0].period, ms(400));
        assert_eq!(groups[0].priority, TaskPriority::HIGH);
        assert_eq!(groups[0].tasks.as_slice(), &[TaskId::Speed]);

        assert_eq!(groups[1].period, ms(800));
        assert_eq!(groups[1].tasks.as_slice(), &[TaskId::Gear, TaskId::Reset]);

        assert_eq!(groups[2].period, ms(1600));
        assert_eq!(
            groups[2].tasks.as_slice(),
            &[TaskId::Temperature, TaskId::Display1, TaskId::Display2]
        );
        assert!(groups[1].priority < groups[2].priority);
    }

    #[test]
    fn test_default_table_is_schedulable() {
        let config = BikeConfig::default();
        let groups = period_classes(&config);
        assert!(is_rm_schedulable(&config, &groups));
    }

    #[test]
    fn test_non_harmonic_uses_liu_layland() {
        let mut config = BikeConfig::default();
        for spec in config.tasks.iter_mut() {
            *spec = TaskSpec::new(spec.id, spec.period, ms(1), Duration::ZERO);
        }
        config.tasks[TaskId::Speed.index()] =
            TaskSpec::new(TaskId::Speed, ms(300), ms(270), Duration::ZERO);
        let groups = period_classes(&config);
        // 0.9 + a little, far above the 3-class bound of 0.780
        assert!(!is_rm_schedulable(&config, &groups));
    }

    #[test]
    fn test_liu_layland_bound() {
        assert!((liu_layland_bound(1) - 1.0).abs() < 0.01);
        assert!((liu_layland_bound(3) - 0.780).abs() < 0.01);
        assert!((liu_layland_bound(100) - 0.693).abs() < 0.01);
    }

    #[test]
    fn test_reset_bound_against_clock_resolution() {
        let config = BikeConfig::default();
        assert_eq!(check_reset_bound(&config, Duration::from_nanos(100)), Ok(()));
        assert_eq!(check_reset_bound(&config, config.max_reset_response), Ok(()));
        assert_eq!(
            check_reset_bound(&config, Duration::from_micros(50)),
            Err(ConfigError::ResetBoundUnachievable {
                bound: config.max_reset_response,
                resolution: Duration::from_micros(50),
            })
        );
    }

    #[test]
    fn test_unobservable_reset_bound_rejected() {
        let config = BikeConfig {
            max_reset_response: Duration::ZERO,
            ..BikeConfig::default()
        };
        assert!(matches!(
            MultiTasking::new(&config, SysTimer::start()),
            Err(ConfigError::ResetBoundUnachievable { .. })
        ));
    }

    #[test]
    fn test_gate_lets_highest_rank_run() {
        let gate = PriorityGate::default();
        gate.claim(2);
        assert!(!gate.is_preempted(2));
        assert!(!gate.is_preempted(0));

        gate.claim(0);
        assert!(gate.is_preempted(2));
        assert!(gate.is_preempted(1));
        assert!(!gate.is_preempted(0));

        gate.retire(0);
        assert!(!gate.is_preempted(2));
    }

    #[test]
    fn test_held_context_resumes_on_retire() {
        let gate = PriorityGate::default();
        let control = RunControl::new();
        assert!(control.begin());
        gate.claim(0);

        let resumed = thread::scope(|s| {
            let low = s.spawn(|| {
                gate.hold(1, &control);
                Instant::now()
            });
            thread::sleep(ms(20));
            let retired = Instant::now();
            gate.retire(0);
            low.join().unwrap() >= retired
        });
        assert!(resumed);
    }

    #[test]
    fn test_hold_gives_up_on_stop() {
        let gate = PriorityGate::default();
        let control = RunControl::new();
        assert!(control.begin());
        gate.claim(0);
        control.request_stop();
        // Returns although rank 0 never retires
        gate.hold(1, &control);
    }

    #[test]
    fn test_reset_served_in_interrupt_context() {
        let config = BikeConfig::default();
        let timer = SysTimer::start();
        let scheduler = MultiTasking::new(&config, timer).unwrap();
        let tasks = task_set(&config, timer);
        scheduler.attach(&tasks);

        // No context is running: the press is served by the edge itself.
        tasks.reset_device().on_fall();
        assert_eq!(tasks.speedometer().reset_count(), 1);
        assert_eq!(tasks.reset_device().pending(), 0);

        tasks.gear_device().on_joystick_up();
        assert_eq!(tasks.current_gear(), config.min_gear + 1);
        assert_eq!(tasks.speedometer().gear(), config.min_gear + 1);
    }

    #[test]
    fn test_contexts_run_and_stop() {
        let mut config = BikeConfig::default();
        for spec in config.tasks.iter_mut() {
            *spec = TaskSpec::new(
                spec.id,
                spec.period / 10,
                spec.computation / 10,
                Duration::ZERO,
            );
        }
        let timer = SysTimer::start();
        let scheduler = MultiTasking::new(&config, timer).unwrap();
        let tasks = task_set(&config, timer);

        thread::scope(|s| {
            s.spawn(|| scheduler.start(&tasks));
            thread::sleep(ms(200));
            scheduler.stop();
        });

        assert_eq!(scheduler.state(), RunState::Stopped);
        let logger = scheduler.task_logger();
        for task in TaskId::ALL {
            assert!(logger.activation_count(task) >= 1, "{task} never ran");
        }
        assert!(logger.activation_count(TaskId::Speed) >= 3);
    }
}
