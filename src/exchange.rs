//! AP exchange region and monitor data blocks.
//!
//! The exchange region sits immediately after the real-mode startup code
//! in the wakeup buffer; the trampoline reads it with fixed offsets, so
//! the layout here is a binary contract and is asserted, not assumed.
//! Each AP also owns a monitor data block at the top of its stack, used
//! to wake it without an IPI once it parks in a monitor/run loop.

use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use alloc::vec;
use alloc::vec::Vec;

/// Hard capacity of the exchange region BIST buffer. The runtime core
/// limit in [`crate::config::MpConfig`] may be lower, never higher.
pub const MAX_CORES: usize = 64;

/// Value an AP's monitor word is armed with, low bits carry the core
/// index.
pub const STARTUP_AP_SIGNAL: u32 = 0x6E75_0000;

/// Gap reserved above each AP stack for its monitor data block. Multiple
/// of 16 so AP stacks stay 16-byte aligned.
pub const MONITOR_FILTER_SIZE: usize = size_of::<MonitorData>();

/// How a parked AP waits for its next dispatch.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApLoopMode {
    /// Halted; waking requires a full INIT-SIPI-SIPI sequence.
    HltLoop = 1,
    /// Monitor/mwait on the startup signal word.
    MwaitLoop = 2,
    /// Busy-polling the startup signal word.
    RunLoop = 3,
}

impl ApLoopMode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ApLoopMode::HltLoop),
            2 => Some(ApLoopMode::MwaitLoop),
            3 => Some(ApLoopMode::RunLoop),
            _ => None,
        }
    }
}

/// GDTR/IDTR image in the exchange region.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct TableDescriptor {
    pub limit: u16,
    pub base: u64,
}

impl TableDescriptor {
    pub const fn zeroed() -> Self {
        Self { limit: 0, base: 0 }
    }
}

/// One BIST buffer slot, filled by an arriving AP during the counting
/// wake.
#[repr(C)]
pub struct BistSlot {
    pub apic_id: AtomicU32,
    pub bist: AtomicU32,
}

/// The exchange region proper.
///
/// `lock`, `init_flag`, `ap_count` and the BIST buffer are written by
/// APs running trampoline code; everything else has a single writer,
/// the BSP.
#[repr(C)]
pub struct ExchangeInfo {
    pub lock: AtomicU64,
    pub stack_start: u64,
    pub stack_size: u64,
    pub ap_function: u64,
    pub gdtr: TableDescriptor,
    pub idtr: TableDescriptor,
    pub buffer_start: u32,
    pub cr3: u32,
    pub init_flag: AtomicU32,
    pub ap_count: AtomicU32,
    pub loop_mode: AtomicU32,
    pub bist: [BistSlot; MAX_CORES],
}

// Trampoline offset contract.
const _: () = assert!(offset_of!(ExchangeInfo, lock) == 0);
const _: () = assert!(offset_of!(ExchangeInfo, stack_start) == 8);
const _: () = assert!(offset_of!(ExchangeInfo, stack_size) == 16);
const _: () = assert!(offset_of!(ExchangeInfo, ap_function) == 24);
const _: () = assert!(offset_of!(ExchangeInfo, gdtr) == 32);
const _: () = assert!(offset_of!(ExchangeInfo, idtr) == 42);
const _: () = assert!(offset_of!(ExchangeInfo, buffer_start) == 52);
const _: () = assert!(offset_of!(ExchangeInfo, cr3) == 56);
const _: () = assert!(offset_of!(ExchangeInfo, init_flag) == 60);
const _: () = assert!(offset_of!(ExchangeInfo, ap_count) == 64);
const _: () = assert!(offset_of!(ExchangeInfo, loop_mode) == 68);
const _: () = assert!(offset_of!(ExchangeInfo, bist) == 72);
const _: () = assert!(size_of::<ExchangeInfo>() == 72 + MAX_CORES * 8);

impl ExchangeInfo {
    fn new(loop_mode: ApLoopMode) -> Self {
        const ZERO_SLOT: BistSlot = BistSlot {
            apic_id: AtomicU32::new(0),
            bist: AtomicU32::new(0),
        };
        Self {
            lock: AtomicU64::new(0),
            stack_start: 0,
            stack_size: 0,
            ap_function: 0,
            gdtr: TableDescriptor::zeroed(),
            idtr: TableDescriptor::zeroed(),
            buffer_start: 0,
            cr3: 0,
            init_flag: AtomicU32::new(0),
            ap_count: AtomicU32::new(0),
            loop_mode: AtomicU32::new(loop_mode as u32),
            bist: [ZERO_SLOT; MAX_CORES],
        }
    }

    /// Trampoline-side arrival during a counting wake: claim the next
    /// BIST slot and record identity and self-test result. Returns the
    /// claimed slot index (slot 0 belongs to the BSP).
    pub fn ap_arrive(&self, apic_id: u32, bist: u32) -> usize {
        let index = self.ap_count.fetch_add(1, Ordering::AcqRel) as usize + 1;
        if index < MAX_CORES {
            self.bist[index].apic_id.store(apic_id, Ordering::Release);
            self.bist[index].bist.store(bist, Ordering::Release);
        }
        index
    }

    pub fn counting(&self) -> bool {
        self.init_flag.load(Ordering::Acquire) == 1
    }
}

/// Per-AP monitor data block, 16 bytes, located `MONITOR_FILTER_SIZE`
/// below the top of the AP's stack.
#[repr(C)]
pub struct MonitorData {
    pub startup_signal: AtomicU32,
    pub mwait_target_cstate: u32,
    pub loop_mode: AtomicU32,
    pub ready_to_boot: AtomicU32,
}

const _: () = assert!(size_of::<MonitorData>() == 16);

/// Exchange region plus the AP stack pool it points into.
pub struct ExchangeRegion {
    pub info: ExchangeInfo,
    stack_size: usize,
    // u64-backed so monitor blocks land on aligned addresses.
    stacks: Vec<u64>,
}

impl ExchangeRegion {
    /// Allocate the stack pool and wire the exchange info to it.
    /// `stack_size` must be a nonzero multiple of 16.
    pub fn new(max_cores: usize, stack_size: usize, loop_mode: ApLoopMode) -> Self {
        debug_assert!(stack_size > 0 && stack_size % 16 == 0);
        let cores = max_cores.min(MAX_CORES);
        let stacks = vec![0u64; (cores + 1) * stack_size / 8];
        let mut info = ExchangeInfo::new(loop_mode);
        info.stack_start = stacks.as_ptr() as u64;
        info.stack_size = stack_size as u64;
        Self {
            info,
            stack_size,
            stacks,
        }
    }

    /// The monitor data block of AP `index`, carved out of the top of
    /// its stack.
    pub fn monitor(&self, index: usize) -> &MonitorData {
        let offset = (index + 1) * self.stack_size - MONITOR_FILTER_SIZE;
        debug_assert!(offset + MONITOR_FILTER_SIZE <= self.stacks.len() * 8);
        // Inside the owned pool, aligned by construction, and only ever
        // reinterpreted as this one type.
        unsafe { &*((self.stacks.as_ptr() as *const u8).add(offset) as *const MonitorData) }
    }

    /// Initial stack pointer for AP `index`, just below its monitor
    /// block.
    pub fn stack_top(&self, index: usize) -> u64 {
        self.info.stack_start + ((index + 1) * self.stack_size - MONITOR_FILTER_SIZE) as u64
    }

    /// Arm the monitor word of AP `index` so a parked monitor/run loop
    /// resumes.
    pub fn signal_ap(&self, index: usize) {
        self.monitor(index)
            .startup_signal
            .store(STARTUP_AP_SIGNAL | index as u32, Ordering::Release);
    }

    /// Take and clear a pending startup signal for AP `index`. Returns
    /// true if the signal was armed.
    pub fn consume_signal(&self, index: usize) -> bool {
        self.monitor(index)
            .startup_signal
            .compare_exchange(
                STARTUP_AP_SIGNAL | index as u32,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
