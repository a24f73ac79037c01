//! Hardware access seam.
//!
//! Everything the coordination protocols need from the machine goes
//! through [`CpuHal`]: interrupt controller commands, the monotonic
//! counter, control register and MSR access, and the handful of
//! privileged maneuvers (CPU-only reset, context exchange, MTRR
//! programming) that cannot be expressed portably. The x86 backend
//! implements this against the local APIC; the test workspace supplies
//! a mock that emulates cores as threads.

use core::sync::atomic::{AtomicU32, AtomicU64};

/// Fixed MTRR MSR count carried in a snapshot (11 fixed-range, up to 10
/// variable-range pairs, plus the default-type register).
pub const MTRR_FIXED_COUNT: usize = 11;
pub const MTRR_VARIABLE_COUNT: usize = 20;

/// A full MTRR register file, captured around the SMM MTRR handshake.
pub struct MtrrSnapshot {
    pub fixed: [u64; MTRR_FIXED_COUNT],
    pub variable: [u64; MTRR_VARIABLE_COUNT],
    pub default_type: u64,
}

impl MtrrSnapshot {
    pub const fn empty() -> Self {
        Self {
            fixed: [0; MTRR_FIXED_COUNT],
            variable: [0; MTRR_VARIABLE_COUNT],
            default_type: 0,
        }
    }
}

/// Why a core is not answering an SMI, as reported by its per-thread
/// status registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmiBlockState {
    /// Nothing stands in the way; an absent core is simply late.
    None,
    /// A long-flow instruction is delaying SMI delivery.
    Delayed,
    /// The core blocks SMIs in its current state.
    Blocked,
    /// SMIs are disabled on this core.
    Disabled,
}

/// Handshake state for one side of a BSP/AP context exchange.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchState {
    Idle = 0,
    Stored = 1,
    Loaded = 2,
}

/// Shared slot one side of a role exchange publishes its progress in.
pub struct RoleSwapSlot {
    pub state: AtomicU32,
    pub stack_pointer: AtomicU64,
}

impl RoleSwapSlot {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(SwitchState::Idle as u32),
            stack_pointer: AtomicU64::new(0),
        }
    }
}

impl Default for RoleSwapSlot {
    fn default() -> Self {
        Self::new()
    }
}

pub trait CpuHal: Sync {
    /// APIC ID of the calling core.
    fn apic_id(&self) -> u32;

    // ------------------------------------------------------------------
    // Inter-processor interrupts
    // ------------------------------------------------------------------

    fn send_init(&self, apic_id: u32);
    fn send_init_broadcast(&self);
    fn send_startup(&self, apic_id: u32, vector: u8);
    fn send_startup_broadcast(&self, vector: u8);
    fn send_smi(&self, apic_id: u32);

    // ------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------

    /// Monotonic counter, free-running; may wrap.
    fn counter(&self) -> u64;
    fn counter_hz(&self) -> u64;
    fn delay_us(&self, microseconds: u64);
    fn pause(&self);

    // ------------------------------------------------------------------
    // Register file
    // ------------------------------------------------------------------

    /// Read control register `index` (0, 2, 3 or 4).
    fn read_cr(&self, index: u8) -> u64;
    fn write_cr(&self, index: u8, value: u64);
    fn read_msr(&self, address: u32) -> u64;
    fn write_msr(&self, address: u32, value: u64);
    fn set_cache_enabled(&self, enabled: bool);

    // ------------------------------------------------------------------
    // Privileged maneuvers
    // ------------------------------------------------------------------

    /// Route legacy interrupts through the local APIC LINT pins.
    fn program_virtual_wire(&self);

    /// INIT the calling core without resetting the platform. Control
    /// registers are lost, MSRs survive.
    fn cpu_only_reset(&self);

    /// Point the real-mode trampoline's far jump at a relocated
    /// exchange buffer.
    fn patch_trampoline_target(&self, buffer_start: u32);

    fn save_timer(&self) -> u64;
    fn restore_timer(&self, state: u64);
    fn disable_interrupts(&self) -> bool;
    fn restore_interrupts(&self, were_enabled: bool);

    /// Run one side of the BSP/AP context exchange. On hardware this
    /// stores the caller's context into `mine`, waits for the peer, and
    /// resumes on the peer's stack.
    fn exchange_role(&self, mine: &RoleSwapSlot, other: &RoleSwapSlot);

    /// Topology bit widths below the package level: (thread bits,
    /// core bits) of the APIC ID.
    fn topology(&self) -> (u32, u32);

    fn supports_execute_disable(&self) -> bool;

    // ------------------------------------------------------------------
    // SMM support
    // ------------------------------------------------------------------

    /// Whether the pending SMI at the top-level dispatcher is one this
    /// engine should service.
    fn valid_smi(&self) -> bool;
    fn clear_smi(&self);
    /// Whether entering SMM on this platform requires swapping in the
    /// firmware MTRR map.
    fn need_configure_mtrrs(&self) -> bool;
    fn smi_block_state(&self, apic_id: u32) -> SmiBlockState;
    /// Targeted SMI delivery capability for the given core.
    fn targeted_smi_supported(&self, apic_id: u32) -> bool;
    fn save_mtrrs(&self, snapshot: &mut MtrrSnapshot);
    fn load_mtrrs(&self, snapshot: &MtrrSnapshot);
    fn load_firmware_mtrrs(&self);

    fn halt(&self) -> !;
}
