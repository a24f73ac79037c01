//! Busy-wait synchronization primitives.
//!
//! The rendezvous and dispatch protocols never sleep; everything here
//! spins with a pause hint. The counting semaphore carries a lockdown
//! sentinel so an arrival counter can be atomically frozen while racing
//! increments observe the freeze.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

/// Counting semaphore over a single `u32` with compare-exchange updates.
///
/// `u32::MAX` is the lockdown sentinel: once locked down, `release`
/// no longer increments and reports the race to the caller.
pub struct Semaphore(AtomicU32);

impl Semaphore {
    pub const fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    /// Spin until the count is nonzero, then decrement. Returns the count
    /// after the decrement. The lockdown sentinel does not count as
    /// nonzero: a locked-down semaphore holds waiters until `reset`.
    pub fn wait(&self) -> u32 {
        loop {
            let value = self.0.load(Ordering::Acquire);
            if value != 0
                && value != u32::MAX
                && self
                    .0
                    .compare_exchange_weak(value, value - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return value - 1;
            }
            spin_loop();
        }
    }

    /// Increment the count. Returns the count after the increment, or 0
    /// without modifying anything when the semaphore is locked down -
    /// callers use the 0 to detect that they lost the race.
    pub fn release(&self) -> u32 {
        loop {
            let value = self.0.load(Ordering::Acquire);
            if value == u32::MAX {
                return 0;
            }
            if self
                .0
                .compare_exchange_weak(value, value + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return value + 1;
            }
            spin_loop();
        }
    }

    /// Freeze the count at the sentinel. Returns the value it held.
    pub fn lockdown(&self) -> u32 {
        self.0.swap(u32::MAX, Ordering::AcqRel)
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self, value: u32) {
        self.0.store(value, Ordering::Release);
    }
}

/// One-bit spinlock. Unlike `spin::Mutex` it guards no data, only a
/// protocol phase, and exposes the failable acquire the remote dispatch
/// path needs.
pub struct SpinFlag(AtomicU32);

impl SpinFlag {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn acquire(&self) {
        while !self.try_acquire() {
            spin_loop();
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    /// Force the released state regardless of the holder. Used when a
    /// core re-enters a rendezvous and must not inherit a stale lock.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Default for SpinFlag {
    fn default() -> Self {
        Self::new()
    }
}
