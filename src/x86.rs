//! x86 backend: local APIC command plumbing, TSC timing, and the
//! privileged maneuvers behind [`CpuHal`].

use core::arch::asm;
use core::arch::x86_64::{__cpuid, __cpuid_count, _rdtsc};
use core::ptr::{read_volatile, write_volatile};

use lazy_static::lazy_static;
use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;
use x86_64::registers::model_specific::Msr;

use crate::hal::{CpuHal, MtrrSnapshot, RoleSwapSlot, SmiBlockState};

const APIC_BASE_MASK: u64 = 0xFFFF_F000;

const REG_ID: u64 = 0x20;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_LVT_LINT0: u64 = 0x350;
const REG_LVT_LINT1: u64 = 0x360;
const REG_TIMER_INIT: u64 = 0x380;

const ICR_INIT: u32 = 0x0000_4500;
const ICR_STARTUP: u32 = 0x0000_4600;
const ICR_SMI: u32 = 0x0000_4200;
const ICR_ALL_EXCLUDING_SELF: u32 = 0x000C_0000;
const ICR_ALL_INCLUDING_SELF: u32 = 0x0008_0000;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;

const LVT_EXTINT: u32 = 0x0000_0700;
const LVT_NMI: u32 = 0x0000_0400;

const CR0_CACHE_DISABLE: u64 = 1 << 30;
const CR0_NOT_WRITE_THROUGH: u64 = 1 << 29;

const MTRR_PHYS_BASE_0: u32 = 0x200;
const MTRR_FIX_64K_00000: u32 = 0x250;
const MTRR_FIX_16K_80000: u32 = 0x258;
const MTRR_FIX_16K_A0000: u32 = 0x259;
const MTRR_FIX_4K_C0000: u32 = 0x268;
const MTRR_DEF_TYPE: u32 = 0x2FF;

fn fixed_mtrr_address(index: usize) -> u32 {
    match index {
        0 => MTRR_FIX_64K_00000,
        1 => MTRR_FIX_16K_80000,
        2 => MTRR_FIX_16K_A0000,
        // 4K ranges C0000..F8000
        _ => MTRR_FIX_4K_C0000 + (index as u32 - 3),
    }
}

lazy_static! {
    /// The firmware memory map captured once at init and re-imposed
    /// inside SMM sessions.
    static ref FIRMWARE_MTRRS: spin::Mutex<MtrrSnapshot> =
        spin::Mutex::new(MtrrSnapshot::empty());
}

/// Backend configuration the platform layer discovers before bring-up.
pub struct X86HalConfig {
    pub lapic_base: u64,
    pub tsc_hz: u64,
    /// Address of the far-jump operand inside the trampoline page.
    pub trampoline_patch_addr: u64,
    /// I/O port the chipset latches SMI status in.
    pub smi_status_port: u16,
}

pub struct X86Hal {
    lapic_base: u64,
    tsc_hz: u64,
    trampoline_patch_addr: u64,
    smi_status_port: u16,
    thread_bits: u32,
    core_bits: u32,
}

impl X86Hal {
    pub fn new(config: X86HalConfig) -> Self {
        let (thread_bits, core_bits) = detect_topology();
        let hal = Self {
            lapic_base: config.lapic_base & APIC_BASE_MASK,
            tsc_hz: config.tsc_hz,
            trampoline_patch_addr: config.trampoline_patch_addr,
            smi_status_port: config.smi_status_port,
            thread_bits,
            core_bits,
        };
        hal.save_mtrrs(&mut FIRMWARE_MTRRS.lock());
        crate::kinfo!(
            "HAL: LAPIC at {:#x}, TSC {} Hz, topology {}+{} bits",
            hal.lapic_base,
            hal.tsc_hz,
            thread_bits,
            core_bits
        );
        hal
    }

    unsafe fn read_register(&self, offset: u64) -> u32 {
        read_volatile((self.lapic_base + offset) as *const u32)
    }

    unsafe fn write_register(&self, offset: u64, value: u32) {
        write_volatile((self.lapic_base + offset) as *mut u32, value);
    }

    unsafe fn wait_for_icr(&self) {
        while (self.read_register(REG_ICR_LOW) & ICR_DELIVERY_PENDING) != 0 {}
    }

    fn send_ipi(&self, apic_id: u32, command: u32) {
        unsafe {
            self.wait_for_icr();
            self.write_register(REG_ICR_HIGH, apic_id << 24);
            self.write_register(REG_ICR_LOW, command);
            self.wait_for_icr();
        }
    }

    fn send_ipi_shorthand(&self, command: u32) {
        unsafe {
            self.wait_for_icr();
            self.write_register(REG_ICR_LOW, command);
            self.wait_for_icr();
        }
    }
}

fn detect_topology() -> (u32, u32) {
    // CPUID leaf 0xB gives the APIC ID shift per topology level.
    let level0 = unsafe { __cpuid_count(0xB, 0) };
    let thread_bits = level0.eax & 0x1F;
    let level1 = unsafe { __cpuid_count(0xB, 1) };
    let core_shift = level1.eax & 0x1F;
    (thread_bits, core_shift.saturating_sub(thread_bits))
}

impl CpuHal for X86Hal {
    fn apic_id(&self) -> u32 {
        unsafe { self.read_register(REG_ID) >> 24 }
    }

    fn send_init(&self, apic_id: u32) {
        self.send_ipi(apic_id, ICR_INIT);
    }

    fn send_init_broadcast(&self) {
        self.send_ipi_shorthand(ICR_ALL_EXCLUDING_SELF | ICR_INIT);
    }

    fn send_startup(&self, apic_id: u32, vector: u8) {
        self.send_ipi(apic_id, ICR_STARTUP | vector as u32);
    }

    fn send_startup_broadcast(&self, vector: u8) {
        self.send_ipi_shorthand(ICR_ALL_EXCLUDING_SELF | ICR_STARTUP | vector as u32);
    }

    fn send_smi(&self, apic_id: u32) {
        self.send_ipi(apic_id, ICR_SMI);
    }

    fn counter(&self) -> u64 {
        unsafe { _rdtsc() }
    }

    fn counter_hz(&self) -> u64 {
        self.tsc_hz
    }

    fn delay_us(&self, microseconds: u64) {
        let ticks = crate::timeout::ticks_for(self.tsc_hz, microseconds);
        let start = self.counter();
        while self.counter().wrapping_sub(start) < ticks {
            self.pause();
        }
    }

    fn pause(&self) {
        core::hint::spin_loop();
    }

    fn read_cr(&self, index: u8) -> u64 {
        let value: u64;
        unsafe {
            match index {
                0 => asm!("mov {0}, cr0", out(reg) value),
                2 => asm!("mov {0}, cr2", out(reg) value),
                3 => asm!("mov {0}, cr3", out(reg) value),
                4 => asm!("mov {0}, cr4", out(reg) value),
                _ => value = 0,
            }
        }
        value
    }

    fn write_cr(&self, index: u8, value: u64) {
        unsafe {
            match index {
                0 => asm!("mov cr0, {0}", in(reg) value),
                2 => asm!("mov cr2, {0}", in(reg) value),
                3 => asm!("mov cr3, {0}", in(reg) value),
                4 => asm!("mov cr4, {0}", in(reg) value),
                _ => {}
            }
        }
    }

    fn read_msr(&self, address: u32) -> u64 {
        unsafe { Msr::new(address).read() }
    }

    fn write_msr(&self, address: u32, value: u64) {
        unsafe { Msr::new(address).write(value) }
    }

    fn set_cache_enabled(&self, enabled: bool) {
        let cr0 = self.read_cr(0);
        if enabled {
            self.write_cr(0, cr0 & !(CR0_CACHE_DISABLE | CR0_NOT_WRITE_THROUGH));
        } else {
            self.write_cr(0, cr0 | CR0_CACHE_DISABLE);
            unsafe { asm!("wbinvd") };
        }
    }

    fn program_virtual_wire(&self) {
        unsafe {
            self.write_register(REG_LVT_LINT0, LVT_EXTINT);
            self.write_register(REG_LVT_LINT1, LVT_NMI);
        }
    }

    fn cpu_only_reset(&self) {
        // INIT everything, self included; the platform stays up.
        self.send_ipi_shorthand(ICR_ALL_INCLUDING_SELF | ICR_INIT);
    }

    fn patch_trampoline_target(&self, buffer_start: u32) {
        unsafe {
            write_volatile(self.trampoline_patch_addr as *mut u32, buffer_start);
        }
    }

    fn save_timer(&self) -> u64 {
        unsafe {
            let lvt = self.read_register(REG_LVT_TIMER) as u64;
            let count = self.read_register(REG_TIMER_INIT) as u64;
            (lvt << 32) | count
        }
    }

    fn restore_timer(&self, state: u64) {
        unsafe {
            self.write_register(REG_LVT_TIMER, (state >> 32) as u32);
            self.write_register(REG_TIMER_INIT, state as u32);
        }
    }

    fn disable_interrupts(&self) -> bool {
        let enabled = interrupts::are_enabled();
        interrupts::disable();
        enabled
    }

    fn restore_interrupts(&self, were_enabled: bool) {
        if were_enabled {
            interrupts::enable();
        }
    }

    fn exchange_role(&self, mine: &RoleSwapSlot, other: &RoleSwapSlot) {
        // Store our callee-saved context, publish it, wait for the
        // peer's, then resume on the peer's stack. Both sides run this
        // simultaneously and come out on each other's context.
        unsafe {
            asm!(
                "push rbx",
                "push rbp",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "mov [{mine_sp}], rsp",
                "mov dword ptr [{mine_state}], 1",
                "2:",
                "pause",
                "cmp dword ptr [{other_state}], 1",
                "jb 2b",
                "mov rsp, [{other_sp}]",
                "mov dword ptr [{other_state}], 2",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop rbp",
                "pop rbx",
                mine_sp = in(reg) mine.stack_pointer.as_ptr(),
                mine_state = in(reg) mine.state.as_ptr(),
                other_sp = in(reg) other.stack_pointer.as_ptr(),
                other_state = in(reg) other.state.as_ptr(),
            );
        }
    }

    fn topology(&self) -> (u32, u32) {
        (self.thread_bits, self.core_bits)
    }

    fn supports_execute_disable(&self) -> bool {
        let extended = unsafe { __cpuid(0x8000_0001) };
        (extended.edx & (1 << 20)) != 0
    }

    fn valid_smi(&self) -> bool {
        let mut port = Port::<u8>::new(self.smi_status_port);
        unsafe { port.read() != 0 }
    }

    fn clear_smi(&self) {
        let mut port = Port::<u8>::new(self.smi_status_port);
        unsafe {
            let status = port.read();
            port.write(status);
        }
    }

    fn need_configure_mtrrs(&self) -> bool {
        true
    }

    fn smi_block_state(&self, _apic_id: u32) -> SmiBlockState {
        // This generation has no delay/block indication registers; an
        // absent core is just late.
        SmiBlockState::None
    }

    fn targeted_smi_supported(&self, _apic_id: u32) -> bool {
        true
    }

    fn save_mtrrs(&self, snapshot: &mut MtrrSnapshot) {
        for (index, slot) in snapshot.fixed.iter_mut().enumerate() {
            *slot = self.read_msr(fixed_mtrr_address(index));
        }
        for (index, slot) in snapshot.variable.iter_mut().enumerate() {
            *slot = self.read_msr(MTRR_PHYS_BASE_0 + index as u32);
        }
        snapshot.default_type = self.read_msr(MTRR_DEF_TYPE);
    }

    fn load_mtrrs(&self, snapshot: &MtrrSnapshot) {
        self.set_cache_enabled(false);
        for (index, value) in snapshot.fixed.iter().enumerate() {
            self.write_msr(fixed_mtrr_address(index), *value);
        }
        for (index, value) in snapshot.variable.iter().enumerate() {
            self.write_msr(MTRR_PHYS_BASE_0 + index as u32, *value);
        }
        self.write_msr(MTRR_DEF_TYPE, snapshot.default_type);
        self.set_cache_enabled(true);
    }

    fn load_firmware_mtrrs(&self) {
        let snapshot = FIRMWARE_MTRRS.lock();
        self.load_mtrrs(&snapshot);
    }

    fn halt(&self) -> ! {
        loop {
            x86_64::instructions::hlt();
        }
    }
}
