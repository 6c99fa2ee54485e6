//! Gear joystick device
//!
//! Two edge-triggered inputs (joystick up / down) shift the gear by one,
//! saturating at the configured range. The new gear is visible as soon as
//! the edge handler returns; the Gear task only propagates it.

use core::sync::atomic::{AtomicU8, Ordering};
use core::time::Duration;

use log::trace;

use crate::interrupt::{Debouncer, IrqSlot};
use crate::timer::SysTimer;

/// Called from interrupt context with the new gear after every effective shift.
pub type GearHandler = Box<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shift {
    Up,
    Down,
}

/// Debounced, saturating gear selector
#[derive(Debug)]
pub struct GearDevice {
    gear: AtomicU8,
    min_gear: u8,
    max_gear: u8,
    /// Shared by both lines: one shift per window, whatever the direction
    debouncer: Debouncer,
    timer: SysTimer,
    on_shift: IrqSlot<dyn Fn(u8) + Send + Sync>,
}

impl GearDevice {
    /// Gear starts at `min_gear`.
    pub fn new(min_gear: u8, max_gear: u8, debounce: Duration, timer: SysTimer) -> Self {
        Self {
            gear: AtomicU8::new(min_gear),
            min_gear,
            max_gear,
            debouncer: Debouncer::new(debounce),
            timer,
            on_shift: IrqSlot::new(),
        }
    }

    #[inline]
    pub fn current_gear(&self) -> u8 {
        self.gear.load(Ordering::Acquire)
    }

    /// Joystick-up edge (interrupt entry point)
    pub fn on_joystick_up(&self) {
        self.on_edge(Shift::Up);
    }

    /// Joystick-down edge (interrupt entry point)
    pub fn on_joystick_down(&self) {
        self.on_edge(Shift::Down);
    }

    /// Attach the shift handler; only the first attach takes effect.
    pub fn attach(&self, handler: GearHandler) -> bool {
        self.on_shift.attach(handler)
    }

    fn on_edge(&self, shift: Shift) {
        if !self.debouncer.accept(self.timer.now_us()) {
            trace!("gear {:?} edge coalesced", shift);
            return;
        }

        let (min, max) = (self.min_gear, self.max_gear);
        let shifted = self
            .gear
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |gear| {
                let next = match shift {
                    Shift::Up => gear.saturating_add(1).min(max),
                    Shift::Down => gear.saturating_sub(1).max(min),
                };
                (next != gear).then_some(next)
            });

        if let Ok(previous) = shifted {
            let gear = match shift {
                Shift::Up => previous + 1,
                Shift::Down => previous - 1,
            };
            if let Some(handler) = self.on_shift.get() {
                handler(gear);
            }
        }
    }
}
