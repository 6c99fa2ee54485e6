//! The six task bodies and the devices they share
//!
//! Every scheduling strategy drives the same [`TaskSet`]; only *when* a
//! body runs differs. [`TaskSet::run`] wraps a body with the logger
//! bookkeeping and pads it with busy work up to the task's nominal
//! computation time.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::Instant;

use crate::config::BikeConfig;
use crate::gear::GearDevice;
use crate::logger::TaskLogger;
use crate::reset::ResetDevice;
use crate::sensor::{Display, TemperatureSensor};
use crate::speedometer::Speedometer;
use crate::task::{TaskId, TaskSpec};
use crate::timer::{busy_wait_until_with, SysTimer};

pub struct TaskSet {
    specs: [TaskSpec; TaskId::COUNT],
    gear_device: GearDevice,
    reset_device: ResetDevice,
    speedometer: Speedometer,
    sensor: Box<dyn TemperatureSensor>,
    display: Box<dyn Display>,
    /// Gear acknowledged by the system (polled by the Gear task or pushed by an interrupt)
    current_gear: AtomicU8,
    /// °C, f32 bits
    temperature: AtomicU32,
}

impl TaskSet {
    pub fn new(
        config: &BikeConfig,
        timer: SysTimer,
        sensor: Box<dyn TemperatureSensor>,
        display: Box<dyn Display>,
    ) -> Self {
        Self {
            specs: config.tasks,
            gear_device: GearDevice::new(
                config.min_gear,
                config.max_gear,
                config.gear_debounce,
                timer,
            ),
            reset_device: ResetDevice::new(config.reset_debounce, timer),
            speedometer: Speedometer::new(config.min_gear, timer),
            sensor,
            display,
            current_gear: AtomicU8::new(config.min_gear),
            temperature: AtomicU32::new(0f32.to_bits()),
        }
    }

    #[inline]
    pub fn spec(&self, task: TaskId) -> &TaskSpec {
        &self.specs[task.index()]
    }

    pub fn specs(&self) -> &[TaskSpec] {
        &self.specs
    }

    /// Run one activation of `task`, recording it in `logger`.
    pub fn run(&self, task: TaskId, logger: &TaskLogger) {
        self.run_preemptible(task, logger, || {});
    }

    /// [`run`](Self::run) with a preemption point before the body and on
    /// every turn of the padding; `yield_point` returns once the calling
    /// context may use the processor again.
    pub fn run_preemptible(&self, task: TaskId, logger: &TaskLogger, mut yield_point: impl FnMut()) {
        yield_point();
        logger.record_activation(task);
        let start = Instant::now();

        match task {
            TaskId::Gear => self.gear_task(),
            TaskId::Speed => self.speed_task(),
            TaskId::Temperature => self.temperature_task(),
            TaskId::Reset => {
                self.process_resets();
            }
            TaskId::Display1 => self.display1_task(),
            TaskId::Display2 => self.display2_task(),
        }

        busy_wait_until_with(start + self.spec(task).computation, yield_point);
        logger.record_computation_time(task, start.elapsed());
    }

    fn gear_task(&self) {
        self.apply_gear(self.gear_device.current_gear());
    }

    fn speed_task(&self) {
        self.speedometer.update();
    }

    fn temperature_task(&self) {
        let celsius = self.sensor.read_celsius();
        self.temperature.store(celsius.to_bits(), Ordering::Release);
    }

    fn display1_task(&self) {
        self.display.show_ride(
            self.current_gear(),
            self.speedometer.current_speed(),
            self.speedometer.distance(),
        );
    }

    fn display2_task(&self) {
        self.display.show_temperature(self.temperature());
    }

    /// Acknowledge `gear`: record it and hand it to the speedometer.
    pub fn apply_gear(&self, gear: u8) {
        self.current_gear.store(gear, Ordering::Release);
        self.speedometer.set_gear(gear);
    }

    /// Serve every latched reset press; returns how many were served.
    pub fn process_resets(&self) -> u32 {
        let pending = self.reset_device.take_pending();
        for _ in 0..pending {
            self.speedometer.reset();
        }
        pending
    }

    pub fn current_gear(&self) -> u8 {
        self.current_gear.load(Ordering::Acquire)
    }

    /// Last temperature read by the Temperature task
    pub fn temperature(&self) -> f32 {
        f32::from_bits(self.temperature.load(Ordering::Acquire))
    }

    pub fn gear_device(&self) -> &GearDevice {
        &self.gear_device
    }

    pub fn reset_device(&self) -> &ResetDevice {
        &self.reset_device
    }

    pub fn speedometer(&self) -> &Speedometer {
        &self.speedometer
    }
}

impl core::fmt::Debug for TaskSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskSet")
            .field("specs", &self.specs)
            .field("current_gear", &self.current_gear())
            .field("speedometer", &self.speedometer)
            .finish_non_exhaustive()
    }
}
