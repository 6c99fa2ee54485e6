//! Lock-free SPSC (Single-Producer, Single-Consumer) ring buffer
//!
//! Carries values from an interrupt context to the context that services
//! it: reset timestamps into the event-queue dispatcher, or a served-reset
//! instant from a callback to whoever measures response time.
//! No mutex, no critical section.
//!
//! The ring is only usable through the two handles returned by
//! [`SpscRing::split`]. Neither handle can be cloned and both mutate
//! through `&mut self`, so a second concurrent producer (or consumer)
//! cannot be written in safe code.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free SPSC ring buffer
///
/// One slot is reserved to tell full from empty, so capacity is `N - 1`.
pub struct SpscRing<T: Copy, const N: usize> {
    buffer: [UnsafeCell<MaybeUninit<T>>; N],
    /// Write index (owned by producer)
    write_idx: AtomicUsize,
    /// Read index (owned by consumer)
    read_idx: AtomicUsize,
}

// Only the unique `Producer` writes slot `write_idx`, before publishing it
// with a Release store; only the unique `Consumer` reads slot `read_idx`,
// after an Acquire load of `write_idx`.
unsafe impl<T: Copy + Send, const N: usize> Sync for SpscRing<T, N> {}

impl<T: Copy, const N: usize> SpscRing<T, N> {
    /// Create a new empty ring buffer
    pub fn new() -> Self {
        assert!(N >= 2, "SpscRing needs at least two slots");
        Self {
            buffer: core::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
        }
    }

    /// Hand the ring to its two ends.
    pub fn split(self) -> (Producer<T, N>, Consumer<T, N>) {
        let ring = Arc::new(self);
        (
            Producer {
                ring: Arc::clone(&ring),
            },
            Consumer { ring },
        )
    }

    /// Available capacity
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    fn len(&self) -> usize {
        let write = self.write_idx.load(Ordering::Acquire);
        let read = self.read_idx.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            N - read + write
        }
    }
}

impl<T: Copy, const N: usize> Default for SpscRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize> core::fmt::Debug for SpscRing<T, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpscRing")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Write end of an [`SpscRing`]
#[derive(Debug)]
pub struct Producer<T: Copy, const N: usize> {
    ring: Arc<SpscRing<T, N>>,
}

impl<T: Copy, const N: usize> Producer<T, N> {
    /// Push a value
    ///
    /// Returns false if buffer is full.
    pub fn push(&mut self, value: T) -> bool {
        let ring = &*self.ring;
        let write = ring.write_idx.load(Ordering::Relaxed);
        let read = ring.read_idx.load(Ordering::Acquire);
        let next_write = (write + 1) % N;

        if next_write == read {
            return false; // Full
        }

        unsafe { (*ring.buffer[write].get()).write(value) };
        ring.write_idx.store(next_write, Ordering::Release);
        true
    }
}

/// Read end of an [`SpscRing`]
#[derive(Debug)]
pub struct Consumer<T: Copy, const N: usize> {
    ring: Arc<SpscRing<T, N>>,
}

impl<T: Copy, const N: usize> Consumer<T, N> {
    /// Pop a value
    ///
    /// Returns None if buffer is empty.
    pub fn pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let read = ring.read_idx.load(Ordering::Relaxed);
        let write = ring.write_idx.load(Ordering::Acquire);

        if read == write {
            return None; // Empty
        }

        let value = unsafe { (*ring.buffer[read].get()).assume_init() };
        ring.read_idx.store((read + 1) % N, Ordering::Release);
        Some(value)
    }

    /// Is the buffer empty?
    pub fn is_empty(&self) -> bool {
        let ring = &*self.ring;
        ring.write_idx.load(Ordering::Acquire) == ring.read_idx.load(Ordering::Acquire)
    }
}
