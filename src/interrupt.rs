//! Edge-interrupt plumbing shared by the input devices
//!
//! Interrupt handlers must finish in bounded time and never wait on a lock
//! held by a periodic task. Both helpers here are lock-free on the
//! interrupt path: the debouncer is a single CAS, and handlers are attached
//! once and then read without locking.

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

const NO_EDGE: u64 = u64::MAX;

/// Coalesces edges that arrive within one debounce window
#[derive(Debug)]
pub struct Debouncer {
    window_us: u64,
    last_edge_us: AtomicU64,
}

impl Debouncer {
    pub const fn new(window: Duration) -> Self {
        Self {
            window_us: window.as_micros() as u64,
            last_edge_us: AtomicU64::new(NO_EDGE),
        }
    }

    /// Returns true if the edge at `now_us` opens a new debounce window.
    ///
    /// A rejected edge does not extend the window.
    pub fn accept(&self, now_us: u64) -> bool {
        let mut last = self.last_edge_us.load(Ordering::Acquire);
        loop {
            if last != NO_EDGE && now_us.saturating_sub(last) < self.window_us {
                return false;
            }
            match self.last_edge_us.compare_exchange_weak(
                last,
                now_us,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => last = current,
            }
        }
    }

}

/// Attach-once storage for an interrupt handler
///
/// After the first `attach`, `get` is a plain atomic load.
pub struct IrqSlot<F: ?Sized> {
    handler: spin::Once<Box<F>>,
}

impl<F: ?Sized> IrqSlot<F> {
    pub const fn new() -> Self {
        Self {
            handler: spin::Once::new(),
        }
    }

    /// Install `handler`; returns false (and drops it) if one is already attached.
    pub fn attach(&self, handler: Box<F>) -> bool {
        let mut installed = false;
        self.handler.call_once(|| {
            installed = true;
            handler
        });
        installed
    }

    pub fn get(&self) -> Option<&F> {
        self.handler.get().map(|h| &**h)
    }

    pub fn is_attached(&self) -> bool {
        self.handler.is_completed()
    }
}

impl<F: ?Sized> Default for IrqSlot<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> core::fmt::Debug for IrqSlot<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}
