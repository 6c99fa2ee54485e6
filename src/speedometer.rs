//! Speedometer — speed and distance from gear and pedal cadence
//!
//! The Speed task calls [`Speedometer::update`] once per activation; the
//! reset path calls [`Speedometer::reset`], possibly from interrupt context
//! while an update is in flight. Values live in atomics (f32 bit patterns)
//! and the distance accumulator is a CAS loop, so a concurrent reset is
//! never lost.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use core::time::Duration;

use crate::timer::SysTimer;

/// Wheel circumference in meters
pub const WHEEL_CIRCUMFERENCE_M: f32 = 2.1;
/// Front chainring teeth
pub const CHAINRING_TEETH: u8 = 50;
/// Rear sprocket teeth at the lowest gear; each gear up removes two teeth
pub const LARGEST_SPROCKET_TEETH: u8 = 28;
pub const SMALLEST_SPROCKET_TEETH: u8 = 10;
/// Pedal rotation time until a sensor reports otherwise
pub const DEFAULT_PEDAL_ROTATION: Duration = Duration::from_millis(750);

type ResetCallback = Box<dyn Fn() + Send + Sync>;

pub struct Speedometer {
    gear: AtomicU8,
    pedal_rotation_us: AtomicU32,
    /// km/h, f32 bits
    speed: AtomicU32,
    /// km, f32 bits
    distance: AtomicU32,
    last_update_us: AtomicU64,
    resets: AtomicU32,
    timer: SysTimer,
    on_reset: spin::RwLock<Option<ResetCallback>>,
}

impl Speedometer {
    pub fn new(gear: u8, timer: SysTimer) -> Self {
        Self {
            gear: AtomicU8::new(gear),
            pedal_rotation_us: AtomicU32::new(DEFAULT_PEDAL_ROTATION.as_micros() as u32),
            speed: AtomicU32::new(0f32.to_bits()),
            distance: AtomicU32::new(0f32.to_bits()),
            last_update_us: AtomicU64::new(timer.now_us()),
            resets: AtomicU32::new(0),
            timer,
            on_reset: spin::RwLock::new(None),
        }
    }

    pub fn set_gear(&self, gear: u8) {
        self.gear.store(gear, Ordering::Release);
    }

    pub fn gear(&self) -> u8 {
        self.gear.load(Ordering::Acquire)
    }

    /// Raw pedal sensor input: time for one crank revolution
    pub fn set_pedal_rotation_time(&self, rotation: Duration) {
        let us = rotation.as_micros().min(u32::MAX as u128) as u32;
        self.pedal_rotation_us.store(us, Ordering::Release);
    }

    pub fn pedal_rotation_time(&self) -> Duration {
        Duration::from_micros(self.pedal_rotation_us.load(Ordering::Acquire) as u64)
    }

    /// Recompute speed and integrate distance since the previous update.
    pub fn update(&self) {
        let speed = speed_kmh(self.gear(), self.pedal_rotation_time());
        self.speed.store(speed.to_bits(), Ordering::Release);

        let now = self.timer.now_us();
        let previous = self.last_update_us.swap(now, Ordering::AcqRel);
        let hours = now.saturating_sub(previous) as f32 / 3_600_000_000.0;
        let travelled = speed * hours;

        // Ok either way: the closure always returns Some
        let _ = self
            .distance
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f32::from_bits(bits) + travelled).to_bits())
            });
    }

    /// Current speed in km/h (as of the last update)
    pub fn current_speed(&self) -> f32 {
        f32::from_bits(self.speed.load(Ordering::Acquire))
    }

    /// Distance in km since the last reset
    pub fn distance(&self) -> f32 {
        f32::from_bits(self.distance.load(Ordering::Acquire))
    }

    /// Zero the trip distance and notify the reset listener.
    pub fn reset(&self) {
        self.distance.store(0f32.to_bits(), Ordering::Release);
        self.resets.fetch_add(1, Ordering::AcqRel);
        if let Some(callback) = self.on_reset.read().as_ref() {
            callback();
        }
    }

    /// Resets performed so far
    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::Acquire)
    }

    /// Register the reset listener, replacing any previous one.
    pub fn set_on_reset_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_reset.write() = Some(Box::new(callback));
    }
}

impl core::fmt::Debug for Speedometer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Speedometer")
            .field("gear", &self.gear())
            .field("speed_kmh", &self.current_speed())
            .field("distance_km", &self.distance())
            .field("resets", &self.reset_count())
            .finish()
    }
}

/// Rear sprocket teeth engaged at `gear` (gear 1 is the largest sprocket)
pub fn sprocket_teeth(gear: u8) -> u8 {
    let step = gear.saturating_sub(1).saturating_mul(2);
    LARGEST_SPROCKET_TEETH
        .saturating_sub(step)
        .max(SMALLEST_SPROCKET_TEETH)
}

/// Road speed for one crank revolution every `pedal_rotation`
pub fn speed_kmh(gear: u8, pedal_rotation: Duration) -> f32 {
    let secs = pedal_rotation.as_secs_f32();
    if secs <= 0.0 {
        return 0.0;
    }
    let ratio = CHAINRING_TEETH as f32 / sprocket_teeth(gear) as f32;
    let meters_per_sec = ratio * WHEEL_CIRCUMFERENCE_M / secs;
    meters_per_sec * 3.6
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::timer::busy_wait_until;

    #[test]
    fn test_sprocket_range() {
        assert_eq!(sprocket_teeth(1), 28);
        assert_eq!(sprocket_teeth(9), 12);
        assert_eq!(sprocket_teeth(0), 28);
        assert_eq!(sprocket_teeth(200), SMALLEST_SPROCKET_TEETH);
    }

    #[test]
    fn test_speed_grows_with_gear() {
        let rotation = Duration::from_millis(750);
        let low = speed_kmh(1, rotation);
        let high = speed_kmh(9, rotation);
        assert!(high > low);
        // 50/28 * 2.1 m / 0.75 s * 3.6
        assert!((low - 18.0).abs() < 0.1);
    }

    #[test]
    fn test_zero_cadence_is_standstill() {
        assert_eq!(speed_kmh(5, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_update_integrates_distance() {
        let speedo = Speedometer::new(1, SysTimer::start());
        speedo.update();
        busy_wait_until(Instant::now() + Duration::from_millis(20));
        speedo.update();
        assert!((speedo.current_speed() - 18.0).abs() < 0.1);
        // 18 km/h for >= 20 ms ≈ 0.0001 km
        assert!(speedo.distance() > 0.00009);
        assert!(speedo.distance() < 0.001);
    }

    #[test]
    fn test_reset_clears_distance_and_notifies() {
        let speedo = Speedometer::new(3, SysTimer::start());
        let calls = Arc::new(AtomicU32::new(0));
        {
            let calls = Arc::clone(&calls);
            speedo.set_on_reset_callback(move || {
                calls.fetch_add(1, Ordering::Relaxed);
            });
        }
        busy_wait_until(Instant::now() + Duration::from_millis(5));
        speedo.update();
        assert!(speedo.distance() > 0.0);

        speedo.reset();
        assert_eq!(speedo.distance(), 0.0);
        assert_eq!(speedo.reset_count(), 1);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_callback_is_replaceable() {
        let speedo = Speedometer::new(1, SysTimer::start());
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        {
            let first = Arc::clone(&first);
            speedo.set_on_reset_callback(move || {
                first.fetch_add(1, Ordering::Relaxed);
            });
        }
        speedo.reset();
        {
            let second = Arc::clone(&second);
            speedo.set_on_reset_callback(move || {
                second.fetch_add(1, Ordering::Relaxed);
            });
        }
        speedo.reset();
        assert_eq!(first.load(Ordering::Relaxed), 1);
        assert_eq!(second.load(Ordering::Relaxed), 1);
        assert_eq!(speedo.reset_count(), 2);
    }

    #[test]
    fn test_pedal_rotation_setter() {
        let speedo = Speedometer::new(1, SysTimer::start());
        assert_eq!(speedo.pedal_rotation_time(), DEFAULT_PEDAL_ROTATION);
        speedo.set_pedal_rotation_time(Duration::from_millis(500));
        speedo.update();
        assert!((speedo.current_speed() - 27.0).abs() < 0.1);
    }
}
