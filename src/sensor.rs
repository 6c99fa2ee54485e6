//! External collaborators: temperature sensor and display
//!
//! The tasks call these once per activation. Implementations must not
//! block; failures are not modelled.

use core::sync::atomic::{AtomicU32, Ordering};

use log::debug;

pub trait TemperatureSensor: Send + Sync {
    fn read_celsius(&self) -> f32;
}

pub trait Display: Send + Sync {
    /// Display 1: gear, speed and trip distance
    fn show_ride(&self, gear: u8, speed_kmh: f32, distance_km: f32);
    /// Display 2: ambient temperature
    fn show_temperature(&self, celsius: f32);
}

/// Host stand-in for the temperature sensor; reports a settable value.
#[derive(Debug)]
pub struct SimulatedSensor {
    celsius: AtomicU32,
}

impl SimulatedSensor {
    pub const DEFAULT_CELSIUS: f32 = 21.5;

    pub fn new(celsius: f32) -> Self {
        Self {
            celsius: AtomicU32::new(celsius.to_bits()),
        }
    }

    pub fn set(&self, celsius: f32) {
        self.celsius.store(celsius.to_bits(), Ordering::Relaxed);
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CELSIUS)
    }
}

impl TemperatureSensor for SimulatedSensor {
    fn read_celsius(&self) -> f32 {
        f32::from_bits(self.celsius.load(Ordering::Relaxed))
    }
}

/// Display that renders to the debug log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

impl Display for LogDisplay {
    fn show_ride(&self, gear: u8, speed_kmh: f32, distance_km: f32) {
        debug!(
            "gear {} | {:.1} km/h | {:.3} km",
            gear, speed_kmh, distance_km
        );
    }

    fn show_temperature(&self, celsius: f32) {
        debug!("temperature {:.1} °C", celsius);
    }
}
