//! Bike computer — periodic task scheduling on a small embedded target
//!
//! Six periodic tasks (gear, speed, temperature, reset, two displays) share
//! a joystick gear selector, a reset button and a speedometer. The same
//! task set runs under three interchangeable strategies:
//! - a cooperative cyclic executive (superloop) over a phased static table,
//! - a cooperative event queue, with device edges as deferred events,
//! - one context per period class, with device edges served in interrupt
//!   context.
//!
//! A [`TaskLogger`] records every activation so periods and computation
//! times can be checked from the outside.
//!
//! ```no_run
//! use std::thread;
//! use std::time::Duration;
//! use bike_computer::MultiTaskingBikeSystem;
//!
//! let system = MultiTaskingBikeSystem::new()?;
//! thread::scope(|s| {
//!     s.spawn(|| system.start());
//!     system.gear_device().on_joystick_up();
//!     thread::sleep(Duration::from_secs(2));
//!     system.stop();
//! });
//! # Ok::<(), bike_computer::ConfigError>(())
//! ```

pub mod bike_system;
pub mod config;
pub mod error;
pub mod gear;
pub mod interrupt;
pub mod logger;
pub mod reset;
pub mod scheduler;
pub mod sensor;
pub mod speedometer;
pub mod spsc;
pub mod task;
pub mod task_set;
pub mod timer;

pub use bike_system::{BikeSystem, EventBikeSystem, MultiTaskingBikeSystem, StaticBikeSystem};
pub use config::BikeConfig;
pub use error::ConfigError;
pub use gear::GearDevice;
pub use logger::TaskLogger;
pub use reset::ResetDevice;
pub use scheduler::{
    EventQueue, EventScheduling, MultiTasking, RunState, Scheduler, StaticScheduling,
};
pub use sensor::{Display, LogDisplay, SimulatedSensor, TemperatureSensor};
pub use speedometer::Speedometer;
pub use spsc::SpscRing;
pub use task::{TaskId, TaskPriority, TaskSpec, TaskState};
pub use timer::SysTimer;
