//! Bike system — top-level composition
//!
//! Owns the timer, the task set with its devices, and one scheduling
//! strategy. The strategy is a type parameter; use the aliases
//! [`StaticBikeSystem`], [`EventBikeSystem`] and [`MultiTaskingBikeSystem`].
//!
//! `start` blocks the calling context until `stop` is called from another
//! one, so drive it from a spawned or scoped thread.

use std::sync::Arc;

use log::info;

use crate::config::BikeConfig;
use crate::error::ConfigError;
use crate::gear::GearDevice;
use crate::logger::TaskLogger;
use crate::scheduler::{
    EventScheduling, MultiTasking, RunState, Scheduler, StaticScheduling,
};
use crate::sensor::{Display, LogDisplay, SimulatedSensor, TemperatureSensor};
use crate::speedometer::Speedometer;
use crate::task_set::TaskSet;
use crate::timer::SysTimer;

/// Superloop, with the event-queue variant available
pub type StaticBikeSystem = BikeSystem<StaticScheduling>;
/// Event queue with deferred gear and reset events
pub type EventBikeSystem = BikeSystem<EventScheduling>;
/// One context per period class, edges served in interrupt context
pub type MultiTaskingBikeSystem = BikeSystem<MultiTasking>;

#[derive(Debug)]
pub struct BikeSystem<S: Scheduler> {
    timer: SysTimer,
    config: BikeConfig,
    tasks: Arc<TaskSet>,
    scheduler: S,
}

impl<S: Scheduler> BikeSystem<S> {
    /// System with the nominal task table and simulated collaborators
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_config(BikeConfig::default())
    }

    pub fn with_config(config: BikeConfig) -> Result<Self, ConfigError> {
        Self::with_collaborators(
            config,
            Box::new(SimulatedSensor::default()),
            Box::new(LogDisplay),
        )
    }

    pub fn with_collaborators(
        config: BikeConfig,
        sensor: Box<dyn TemperatureSensor>,
        display: Box<dyn Display>,
    ) -> Result<Self, ConfigError> {
        let timer = SysTimer::start();
        let scheduler = S::new(&config, timer)?;
        let tasks = Arc::new(TaskSet::new(&config, timer, sensor, display));
        scheduler.attach(&tasks);

        info!(
            "bike system ready: {} scheduling, gears {}..={}, utilization {:.3}",
            S::NAME,
            config.min_gear,
            config.max_gear,
            config.total_utilization()
        );
        Ok(Self {
            timer,
            config,
            tasks,
            scheduler,
        })
    }

    /// Hand the calling context to the scheduler until [`stop`](Self::stop).
    pub fn start(&self) {
        self.scheduler.start(&self.tasks);
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn state(&self) -> RunState {
        self.scheduler.state()
    }

    pub fn task_logger(&self) -> &TaskLogger {
        self.scheduler.task_logger()
    }

    /// Gear currently selected on the joystick
    pub fn current_gear(&self) -> u8 {
        self.tasks.gear_device().current_gear()
    }

    /// Speed computed by the latest Speed task activation, km/h
    pub fn current_speed(&self) -> f32 {
        self.tasks.speedometer().current_speed()
    }

    pub fn gear_device(&self) -> &GearDevice {
        self.tasks.gear_device()
    }

    pub fn speedometer(&self) -> &Speedometer {
        self.tasks.speedometer()
    }

    /// Reset button edge (interrupt entry point)
    pub fn on_reset(&self) {
        self.tasks.reset_device().on_fall();
    }

    pub fn timer(&self) -> SysTimer {
        self.timer
    }

    pub fn config(&self) -> &BikeConfig {
        &self.config
    }
}

impl BikeSystem<StaticScheduling> {
    /// Run the task set as periodic event-queue callables instead of the superloop.
    pub fn start_with_event_queue(&self) {
        self.scheduler.start_with_event_queue(&self.tasks);
    }
}
