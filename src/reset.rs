//! Reset button device
//!
//! Every accepted falling edge latches one pending reset. Whoever services
//! the button (the Reset task, a deferred event, or the attached interrupt
//! handler) drains the latch with [`ResetDevice::take_pending`], so each
//! press turns into exactly one reset no matter who gets there first.

use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use log::trace;

use crate::interrupt::{Debouncer, IrqSlot};
use crate::timer::SysTimer;

/// Called from interrupt context right after an edge is latched.
pub type ResetHandler = Box<dyn Fn() + Send + Sync>;

/// Debounced reset push-button
#[derive(Debug)]
pub struct ResetDevice {
    pending: AtomicU32,
    presses: AtomicU32,
    debouncer: Debouncer,
    timer: SysTimer,
    on_press: IrqSlot<dyn Fn() + Send + Sync>,
}

impl ResetDevice {
    pub fn new(debounce: Duration, timer: SysTimer) -> Self {
        Self {
            pending: AtomicU32::new(0),
            presses: AtomicU32::new(0),
            debouncer: Debouncer::new(debounce),
            timer,
            on_press: IrqSlot::new(),
        }
    }

    /// Falling edge of the button (interrupt entry point)
    pub fn on_fall(&self) {
        if !self.debouncer.accept(self.timer.now_us()) {
            trace!("reset edge coalesced");
            return;
        }
        self.presses.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Some(handler) = self.on_press.get() {
            handler();
        }
    }

    /// Drain the latch, returning how many presses were pending.
    pub fn take_pending(&self) -> u32 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Accepted presses since construction
    pub fn presses(&self) -> u32 {
        self.presses.load(Ordering::Relaxed)
    }

    /// Attach the press handler; only the first attach takes effect.
    pub fn attach(&self, handler: ResetHandler) -> bool {
        self.on_press.attach(handler)
    }
}
