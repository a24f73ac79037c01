//! Timeout accounting over the monotonic performance counter.
//!
//! Microsecond budgets are converted to counter ticks once, then elapsed
//! ticks are accumulated sample-by-sample so a single counter wraparound
//! between two samples is absorbed by the wrapping subtraction. A budget
//! of 0 means "wait forever".

use crate::hal::CpuHal;

pub struct Timeout {
    expected_ticks: u64,
    total_ticks: u64,
    last_sample: u64,
}

impl Timeout {
    /// Start a timeout of `microseconds` against the HAL counter.
    pub fn start(hal: &dyn CpuHal, microseconds: u64) -> Self {
        Self {
            expected_ticks: ticks_for(hal.counter_hz(), microseconds),
            total_ticks: 0,
            last_sample: hal.counter(),
        }
    }

    /// An inert timeout that never expires, useful as a placeholder.
    pub const fn none() -> Self {
        Self {
            expected_ticks: 0,
            total_ticks: 0,
            last_sample: 0,
        }
    }

    /// Sample the counter and report whether the budget is spent.
    /// Unbounded timeouts never expire. Monotone: once this returns true
    /// it returns true forever.
    pub fn expired(&mut self, hal: &dyn CpuHal) -> bool {
        if self.expected_ticks == 0 {
            return false;
        }
        let now = hal.counter();
        let delta = now.wrapping_sub(self.last_sample);
        self.last_sample = now;
        self.total_ticks = self.total_ticks.saturating_add(delta);
        self.total_ticks >= self.expected_ticks
    }

    pub fn is_unbounded(&self) -> bool {
        self.expected_ticks == 0
    }
}

/// Counter ticks equivalent to `microseconds` at `frequency_hz`.
/// Either operand being 0 yields 0, the unbounded marker.
pub fn ticks_for(frequency_hz: u64, microseconds: u64) -> u64 {
    ((frequency_hz as u128 * microseconds as u128) / 1_000_000) as u64
}
