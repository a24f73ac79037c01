//! Shared SMM session state.
//!
//! One `SmmSync` lives for the lifetime of the SMM dispatcher and is
//! shared by every core entering SMI. All fields are atomics, locks or
//! semaphores; the struct is only ever passed by shared reference.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

use alloc::vec::Vec;

use crate::config::{MpConfig, SmmSyncMode};
use crate::hal::CpuHal;
use crate::sync::{Semaphore, SpinFlag};

/// APIC ID of a slot with no core behind it (hot-removed or never
/// populated).
pub const INVALID_APIC_ID: u32 = u32::MAX;

/// Procedure dispatched onto one core inside SMM.
pub type SmmProcedure = fn(&dyn CpuHal, &SmmSync, usize);

/// The dispatcher body the elected BSP runs once the session is
/// established.
pub type SmmBody = fn(&dyn CpuHal, &SmmSync);

/// Deferred per-core operation, executed at the tail of an SMI.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingOp {
    None = 0,
    SwitchBsp = 1,
}

impl PendingOp {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PendingOp::SwitchBsp,
            _ => PendingOp::None,
        }
    }
}

/// Remote dispatch slot of one core.
pub struct SmmSlot {
    pub procedure: Option<SmmProcedure>,
    pub argument: usize,
}

/// Per-core rendezvous state.
pub struct SmmCpuData {
    /// Held by whoever queued work on this core; the core releases it
    /// when the work is done. The exactly-once dispatch guarantee is
    /// this lock paired with `run`.
    pub busy: SpinFlag,
    /// Counting semaphore the core parks on between dispatches.
    pub run: Semaphore,
    /// The core is inside SMM and participating in this session.
    pub present: AtomicBool,
    pub slot: spin::Mutex<SmmSlot>,
    pub op: AtomicU8,
}

impl SmmCpuData {
    fn new() -> Self {
        Self {
            busy: SpinFlag::new(),
            run: Semaphore::new(0),
            present: AtomicBool::new(false),
            slot: spin::Mutex::new(SmmSlot {
                procedure: None,
                argument: 0,
            }),
            op: AtomicU8::new(PendingOp::None as u8),
        }
    }

    pub fn pending_op(&self) -> PendingOp {
        PendingOp::from_u8(self.op.load(Ordering::Acquire))
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }
}

fn mode_to_u8(mode: SmmSyncMode) -> u8 {
    match mode {
        SmmSyncMode::Traditional => 0,
        SmmSyncMode::Relaxed => 1,
    }
}

fn mode_from_u8(value: u8) -> SmmSyncMode {
    if value == 1 {
        SmmSyncMode::Relaxed
    } else {
        SmmSyncMode::Traditional
    }
}

pub struct SmmSync {
    pub cpus: Vec<SmmCpuData>,
    /// APIC ID per slot, [`INVALID_APIC_ID`] where no core exists.
    pub apic_ids: Vec<u32>,
    /// Arrival counter; locked down by the BSP once the session roster
    /// is fixed.
    pub counter: Semaphore,
    /// Index of the session BSP, -1 while unelected.
    pub bsp_index: AtomicI32,
    pub inside_smm: AtomicBool,
    pub all_in_sync: AtomicBool,
    mode_to_set: AtomicU8,
    effective_mode: AtomicU8,
    /// A BSP switch was requested; the next election only considers
    /// flagged candidates.
    pub switch_bsp_pending: AtomicBool,
    pub candidate: Vec<AtomicBool>,
    /// Number of APs counted into the current session.
    pub ap_count: AtomicUsize,
    pub election: bool,
    pub sync_timeout_us: u64,
}

impl SmmSync {
    pub fn new(apic_ids: Vec<u32>, config: &MpConfig) -> Self {
        let count = apic_ids.len();
        let mut cpus = Vec::with_capacity(count);
        let mut candidate = Vec::with_capacity(count);
        for _ in 0..count {
            cpus.push(SmmCpuData::new());
            candidate.push(AtomicBool::new(false));
        }
        Self {
            cpus,
            apic_ids,
            counter: Semaphore::new(0),
            bsp_index: AtomicI32::new(if config.bsp_election { -1 } else { 0 }),
            inside_smm: AtomicBool::new(false),
            all_in_sync: AtomicBool::new(false),
            mode_to_set: AtomicU8::new(mode_to_u8(config.smm_sync_mode)),
            effective_mode: AtomicU8::new(mode_to_u8(config.smm_sync_mode)),
            switch_bsp_pending: AtomicBool::new(false),
            candidate,
            ap_count: AtomicUsize::new(0),
            election: config.bsp_election,
            sync_timeout_us: config.smm_sync_timeout_us,
        }
    }

    pub fn effective_mode(&self) -> SmmSyncMode {
        mode_from_u8(self.effective_mode.load(Ordering::Acquire))
    }

    /// Request a mode change; it takes effect in the quiet window at
    /// the end of the current (or next) SMI.
    pub fn request_mode(&self, mode: SmmSyncMode) {
        self.mode_to_set.store(mode_to_u8(mode), Ordering::Release);
    }

    /// Called by the BSP in the quiet window only.
    pub fn commit_mode(&self) {
        self.effective_mode
            .store(self.mode_to_set.load(Ordering::Acquire), Ordering::Release);
    }

    pub fn present_count(&self) -> usize {
        self.cpus.iter().filter(|cpu| cpu.is_present()).count()
    }

    pub fn bsp(&self) -> Option<usize> {
        let index = self.bsp_index.load(Ordering::Acquire);
        if index < 0 {
            None
        } else {
            Some(index as usize)
        }
    }
}
