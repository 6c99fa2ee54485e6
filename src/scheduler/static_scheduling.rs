//! Static scheduling — cooperative cyclic executive
//!
//! The hyperperiod (lcm of the periods) is cut into ticks (gcd of periods
//! and phases). At every tick the superloop runs, to completion and in
//! slot order, each task whose release falls on that tick:
//! `slot mod (period / tick) == phase / tick`. With zero phases this is
//! the plain `tick mod (period / gcd) == 0` rule.
//!
//! Construction rejects tables where two activations would overlap, so
//! every task starts on its own release instant and both its period and
//! its computation time come out exact.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};

use super::event_queue;
use super::{RunControl, RunState, Scheduler, Wake};
use crate::config::BikeConfig;
use crate::error::ConfigError;
use crate::logger::TaskLogger;
use crate::task::TaskId;
use crate::task_set::TaskSet;
use crate::timer::{PeriodicWake, SysTimer};

#[derive(Debug, Clone, Copy)]
struct Release {
    task: TaskId,
    period_ticks: u64,
    phase_ticks: u64,
}

/// Release table of one hyperperiod
#[derive(Debug, Clone)]
pub struct CyclicSchedule {
    tick: Duration,
    slots: u64,
    releases: [Release; TaskId::COUNT],
}

impl CyclicSchedule {
    pub fn build(config: &BikeConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let tick = config.tick();
        let tick_us = tick.as_micros() as u64;
        let hyper_us = config.hyperperiod().as_micros() as u64;
        check_overlap(config, hyper_us)?;

        let releases = TaskId::ALL.map(|task| {
            let spec = config.spec(task);
            Release {
                task,
                period_ticks: spec.period.as_micros() as u64 / tick_us,
                phase_ticks: spec.phase.as_micros() as u64 / tick_us,
            }
        });

        Ok(Self {
            tick,
            slots: hyper_us / tick_us,
            releases,
        })
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Ticks per hyperperiod
    pub fn slots(&self) -> u64 {
        self.slots
    }

    pub fn hyperperiod(&self) -> Duration {
        Duration::from_micros(self.tick.as_micros() as u64 * self.slots)
    }

    /// Tasks released at `slot`, in slot order
    pub fn released(&self, slot: u64) -> impl Iterator<Item = TaskId> + '_ {
        let slot = slot % self.slots;
        self.releases
            .iter()
            .filter(move |r| slot % r.period_ticks == r.phase_ticks)
            .map(|r| r.task)
    }
}

/// Reject tables where one activation starts before the previous one ends.
fn check_overlap(config: &BikeConfig, hyper_us: u64) -> Result<(), ConfigError> {
    let us = |d: Duration| d.as_micros() as u64;
    let mut windows: Vec<(u64, u64, TaskId)> = config
        .tasks
        .iter()
        .flat_map(|spec| {
            let (period, phase, computation) = (us(spec.period), us(spec.phase), us(spec.computation));
            (0..hyper_us / period).map(move |k| {
                let start = phase + k * period;
                (start, start + computation, spec.id)
            })
        })
        .collect();
    windows.sort_unstable_by_key(|&(start, _, task)| (start, task));
    // The first window again, one hyperperiod later, closes the cycle.
    if let Some(&(start, end, task)) = windows.first() {
        windows.push((start + hyper_us, end + hyper_us, task));
    }

    for pair in windows.windows(2) {
        let (_, end, first) = pair[0];
        let (start, _, second) = pair[1];
        if start < end {
            return Err(ConfigError::ScheduleOverlap {
                first,
                second,
                at: Duration::from_micros(start),
            });
        }
    }
    Ok(())
}

/// Cooperative superloop over a [`CyclicSchedule`]
///
/// Also offers [`start_with_event_queue`](Self::start_with_event_queue):
/// the same task set dispatched as periodic deferred callables.
#[derive(Debug)]
pub struct StaticScheduling {
    schedule: CyclicSchedule,
    logger: TaskLogger,
    control: RunControl,
}

impl Scheduler for StaticScheduling {
    const NAME: &'static str = "static";

    fn new(config: &BikeConfig, timer: SysTimer) -> Result<Self, ConfigError> {
        Ok(Self {
            schedule: CyclicSchedule::build(config)?,
            logger: TaskLogger::new(timer),
            control: RunControl::new(),
        })
    }

    fn attach(&self, _tasks: &Arc<TaskSet>) {
        // Edges stay latched in the devices until the Gear and Reset tasks poll them.
    }

    fn start(&self, tasks: &TaskSet) {
        if !self.control.begin() {
            warn!("{} scheduler: start ignored ({})", Self::NAME, self.control.state());
            return;
        }
        info!(
            "{} scheduler started: tick {:?}, hyperperiod {:?}",
            Self::NAME,
            self.schedule.tick(),
            self.schedule.hyperperiod()
        );

        self.run_superloop(tasks);

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

impl StaticScheduling {
    /// Run the task set through the event queue instead of the superloop.
    /// Blocks until stopped; devices are still polled by their tasks.
    pub fn start_with_event_queue(&self, tasks: &TaskSet) {
        if !self.control.begin() {
            warn!("{} scheduler: start ignored ({})", Self::NAME, self.control.state());
            return;
        }
        info!("{} scheduler started with event queue", Self::NAME);

        event_queue::dispatch(tasks, &self.logger, &self.control, None);

        self.control.finish();
        self.logger.report();
        info!("{} scheduler stopped", Self::NAME);
    }

    fn run_superloop(&self, tasks: &TaskSet) {
        let mut wake = PeriodicWake::new(Instant::now(), self.schedule.tick());
        let mut slot = 0u64;
        loop {
            if self.control.wait_until(wake.next_release(), || false) == Wake::Stop {
                return;
            }
            wake.advance();

            for task in self.schedule.released(slot) {
                if self.control.is_stop_requested() {
                    return;
                }
                tasks.run(task, &self.logger);
            }
            slot = (slot + 1) % self.schedule.slots();
        }
    }
}
