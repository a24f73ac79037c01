//! Arrival-window timer.
//!
//! Same tick arithmetic as [`crate::timeout`], narrowed to the SMM
//! windows: budget fixed by the session, one counter rollover in either
//! direction absorbed between samples.

use crate::hal::CpuHal;
use crate::timeout::Timeout;

pub struct SyncTimer(Timeout);

impl SyncTimer {
    pub fn start(hal: &dyn CpuHal, timeout_us: u64) -> Self {
        Self(Timeout::start(hal, timeout_us))
    }

    pub fn is_timeout(&mut self, hal: &dyn CpuHal) -> bool {
        self.0.expired(hal)
    }
}
