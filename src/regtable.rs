//! Per-core register programming tables.
//!
//! The analysis phase records what each core's control registers, MSRs
//! and cache toggle should look like; the setting phase (and every
//! post-INIT replay) walks the table and applies it. Entries are
//! bit-field writes so independent features can share a register, and
//! a table splits at `before_reset`: the leading entries must be live
//! before the CPU-only reset, the rest after.

use alloc::vec::Vec;

use crate::hal::CpuHal;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterKind {
    /// CR0, CR2, CR3 or CR4.
    ControlRegister(u8),
    /// Model-specific register by address.
    Msr(u32),
    /// Whole-cache enable/disable; `value` 0 disables.
    CacheControl,
}

#[derive(Clone, Copy, Debug)]
pub struct RegisterTableEntry {
    pub kind: RegisterKind,
    pub start_bit: u8,
    pub bit_length: u8,
    pub value: u64,
}

impl RegisterTableEntry {
    pub const fn new(kind: RegisterKind, start_bit: u8, bit_length: u8, value: u64) -> Self {
        Self {
            kind,
            start_bit,
            bit_length,
            value,
        }
    }
}

/// Which slice of a table an apply pass covers, relative to its
/// `before_reset` split point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyPhase {
    BeforeReset,
    AfterReset,
    All,
}

#[derive(Clone, Debug, Default)]
pub struct RegisterTable {
    pub entries: Vec<RegisterTableEntry>,
    /// Leading entries applied before the CPU-only reset.
    pub before_reset: usize,
}

impl RegisterTable {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            before_reset: 0,
        }
    }

    /// Append an entry for the current analysis pass. Entries appended
    /// while `pre_reset` is requested extend the before-reset prefix,
    /// so callers must add all pre-reset entries first.
    pub fn append(&mut self, entry: RegisterTableEntry, pre_reset: bool) {
        if pre_reset {
            debug_assert!(self.before_reset == self.entries.len());
            self.before_reset += 1;
        }
        self.entries.push(entry);
    }

    pub fn needs_reset(&self) -> bool {
        self.before_reset > 0
    }
}

/// Replace `bit_length` bits of `current` at `start_bit` with `value`.
/// A length of 64 or more replaces the whole register.
pub fn bit_field_write64(current: u64, start_bit: u8, bit_length: u8, value: u64) -> u64 {
    if bit_length >= 64 {
        return value;
    }
    debug_assert!((start_bit as u32 + bit_length as u32) <= 64);
    let mask = ((1u64 << bit_length) - 1) << start_bit;
    (current & !mask) | ((value << start_bit) & mask)
}

/// Apply one table slice on the calling core.
///
/// With `restoring` set (replay after an INIT) full-width MSR writes are
/// skipped: INIT preserves MSRs, and re-writing e.g. a lock-once MSR
/// would fault. Bit-field MSR writes are read-modify-write and replay
/// cleanly, as do control registers, which INIT does clear.
pub fn apply(hal: &dyn CpuHal, table: &RegisterTable, phase: ApplyPhase, restoring: bool) {
    let (start, end) = match phase {
        ApplyPhase::BeforeReset => (0, table.before_reset),
        ApplyPhase::AfterReset => (table.before_reset, table.entries.len()),
        ApplyPhase::All => (0, table.entries.len()),
    };

    for entry in &table.entries[start..end] {
        match entry.kind {
            RegisterKind::ControlRegister(index) => {
                if index != 0 && index != 2 && index != 3 && index != 4 {
                    continue;
                }
                let current = hal.read_cr(index);
                hal.write_cr(
                    index,
                    bit_field_write64(current, entry.start_bit, entry.bit_length, entry.value),
                );
            }
            RegisterKind::Msr(address) => {
                if entry.bit_length >= 64 {
                    if !restoring {
                        hal.write_msr(address, entry.value);
                    }
                } else {
                    let current = hal.read_msr(address);
                    hal.write_msr(
                        address,
                        bit_field_write64(current, entry.start_bit, entry.bit_length, entry.value),
                    );
                }
            }
            RegisterKind::CacheControl => {
                hal.set_cache_enabled(entry.value != 0);
            }
        }
    }
}
