//! Core records and the MP context.
//!
//! `MpContext` is the single home of all coordination state. The boot
//! orchestrator builds it exclusively (`&mut`); once APs are released
//! into their dispatch loops everything runtime-mutable in here is
//! behind an atomic or a lock and the context is only ever shared.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use crate::config::MpConfig;
use crate::exchange::ExchangeRegion;
use crate::hal::{CpuHal, RoleSwapSlot};
use crate::regtable::RegisterTable;
use crate::sync::SpinFlag;
use crate::timeout::Timeout;

/// Procedure dispatched onto a core. Gets the HAL, the shared context
/// and a caller-chosen argument token.
pub type Procedure = fn(&dyn CpuHal, &MpContext, usize);

/// Dispatch state machine of one core.
///
/// `Disabled` is orthogonal to the dispatch cycle: a disabled core keeps
/// no procedure and is skipped by every startup operation until
/// re-enabled back to `Idle`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuState {
    Idle = 0,
    Ready = 1,
    Busy = 2,
    Finished = 3,
    Disabled = 4,
}

impl CpuState {
    pub fn from_atomic(value: u8) -> CpuState {
        match value {
            0 => CpuState::Idle,
            1 => CpuState::Ready,
            2 => CpuState::Busy,
            3 => CpuState::Finished,
            _ => CpuState::Disabled,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CpuState::Idle => "idle",
            CpuState::Ready => "ready",
            CpuState::Busy => "busy",
            CpuState::Finished => "finished",
            CpuState::Disabled => "disabled",
        }
    }
}

/// Why a core sits in `Disabled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisableCause {
    None,
    UserRequest,
    Unhealthy,
}

/// Mutable dispatch slot of one core, guarded by its own lock.
pub struct CpuSlot {
    pub procedure: Option<Procedure>,
    pub argument: usize,
    pub timeout: Timeout,
    pub finished: bool,
}

impl CpuSlot {
    const fn empty() -> Self {
        Self {
            procedure: None,
            argument: 0,
            timeout: Timeout::none(),
            finished: false,
        }
    }

    pub fn clear(&mut self) {
        self.procedure = None;
        self.argument = 0;
        self.timeout = Timeout::none();
        self.finished = false;
    }
}

/// Everything known about one logical processor. Cache-line sized so
/// neighboring cores do not share a line while spinning on their state.
#[repr(C, align(64))]
pub struct CpuRecord {
    /// APIC ID the core answers IPIs on.
    pub apic_id: u32,
    /// APIC ID latched at the counting wake, before any renumbering.
    pub initial_apic_id: u32,
    /// Built-in self-test result from the counting wake (0 = healthy).
    pub bist: u32,
    pub package: u32,
    pub core: u32,
    pub thread: u32,
    /// Lowest-numbered core of its physical package.
    pub package_bsp: bool,
    pub healthy: AtomicBool,
    pub state: AtomicU8,
    pub disable_cause: AtomicU8,
    pub slot: Mutex<CpuSlot>,
}

impl CpuRecord {
    pub fn new(initial_apic_id: u32, bist: u32) -> Self {
        Self {
            apic_id: initial_apic_id,
            initial_apic_id,
            bist,
            package: 0,
            core: 0,
            thread: 0,
            package_bsp: false,
            healthy: AtomicBool::new(bist == 0),
            state: AtomicU8::new(CpuState::Idle as u8),
            disable_cause: AtomicU8::new(DisableCause::None as u8),
            slot: Mutex::new(CpuSlot::empty()),
        }
    }

    pub fn state(&self) -> CpuState {
        CpuState::from_atomic(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: CpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically advance the state machine; fails if another observer
    /// moved it first.
    pub fn transition(&self, from: CpuState, to: CpuState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn enabled(&self) -> bool {
        self.state() != CpuState::Disabled
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

/// Book-keeping for an in-flight startup operation, under one lock.
pub struct DispatchState {
    /// Cores still expected to finish the current operation.
    pub cpu_list: Vec<bool>,
    pub start_count: usize,
    pub finish_count: usize,
    pub single_thread: bool,
    pub procedure: Option<Procedure>,
    pub argument: usize,
    pub timeout: Timeout,
    /// A non-blocking operation is outstanding and polled by the
    /// periodic tick.
    pub pending: bool,
    /// Outcome of a completed non-blocking operation, taken by the
    /// poller.
    pub outcome: Option<Result<(), crate::error::MpError>>,
    /// Cores that missed the deadline of the last timed-out operation.
    pub failed: Vec<usize>,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            cpu_list: Vec::new(),
            start_count: 0,
            finish_count: 0,
            single_thread: false,
            procedure: None,
            argument: 0,
            timeout: Timeout::none(),
            pending: false,
            outcome: None,
            failed: Vec::new(),
        }
    }
}

/// Both halves of the BSP/AP role exchange handshake.
pub struct RoleSwap {
    pub bsp: RoleSwapSlot,
    pub ap: RoleSwapSlot,
}

/// Process-wide MP coordination context.
pub struct MpContext {
    pub config: MpConfig,
    pub exchange: ExchangeRegion,
    pub cpus: Vec<CpuRecord>,
    pub bsp_index: AtomicUsize,
    /// Per-core register programming tables, indexed like `cpus`.
    pub reg_tables: Vec<RegisterTable>,
    /// Tables applied before SMM relocation.
    pub pre_smm_tables: Vec<RegisterTable>,
    /// Order cores take the setting phase in.
    pub setting_sequence: Vec<usize>,
    /// Set after the first full setting pass; later replays then skip
    /// full-width MSR writes (INIT preserves MSRs).
    pub restore_after_init: AtomicBool,
    pub dispatch: Mutex<DispatchState>,
    /// Serializes wakeups that must not interleave (exchange relocation,
    /// loop-mode upgrade).
    pub serialize: SpinFlag,
    pub role_swap: RoleSwap,
    /// Countdown used by broadcast dispatch-and-wait.
    pub setting_countdown: AtomicUsize,
    /// A BSP switch is in flight; AP wrappers skip their normal state
    /// bookkeeping.
    pub bsp_switching: AtomicBool,
}

impl MpContext {
    pub fn new(config: MpConfig) -> Self {
        let exchange = ExchangeRegion::new(config.max_cores, config.stack_size, config.loop_mode);
        Self {
            config,
            exchange,
            cpus: Vec::new(),
            bsp_index: AtomicUsize::new(0),
            reg_tables: Vec::new(),
            pre_smm_tables: Vec::new(),
            setting_sequence: Vec::new(),
            restore_after_init: AtomicBool::new(false),
            dispatch: Mutex::new(DispatchState::new()),
            serialize: SpinFlag::new(),
            role_swap: RoleSwap {
                bsp: RoleSwapSlot::new(),
                ap: RoleSwapSlot::new(),
            },
            setting_countdown: AtomicUsize::new(0),
            bsp_switching: AtomicBool::new(false),
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn bsp_index(&self) -> usize {
        self.bsp_index.load(Ordering::Acquire)
    }

    pub fn is_bsp(&self, index: usize) -> bool {
        index == self.bsp_index()
    }

    pub fn enabled_count(&self) -> usize {
        self.cpus.iter().filter(|cpu| cpu.enabled()).count()
    }

    /// APIC ID a dispatch to `index` must target.
    pub fn apic_id_of(&self, index: usize) -> u32 {
        self.cpus[index].apic_id
    }
}

/// Carried alongside `AtomicU32` loop-mode words; keeps the raw value
/// readable at call sites.
pub fn loop_mode_of(word: &AtomicU32) -> crate::exchange::ApLoopMode {
    crate::exchange::ApLoopMode::from_u32(word.load(Ordering::Acquire))
        .unwrap_or(crate::exchange::ApLoopMode::HltLoop)
}
