//! APIC ID bookkeeping: sorting, topology decode, and the conflict
//! checks that gate bring-up.

use core::sync::atomic::Ordering;

use crate::error::MpError;
use crate::hal::CpuHal;
use crate::types::CpuRecord;

/// Sort records ascending by initial APIC ID so core numbering is
/// stable across boots, and return the new index of the record whose
/// initial APIC ID is `bsp_apic_id`.
pub fn sort_by_apic_id(cpus: &mut [CpuRecord], bsp_apic_id: u32) -> usize {
    // Selection sort: the list is small and built exactly once.
    for i in 0..cpus.len() {
        let mut min = i;
        for j in (i + 1)..cpus.len() {
            if cpus[j].initial_apic_id < cpus[min].initial_apic_id {
                min = j;
            }
        }
        if min != i {
            cpus.swap(i, min);
        }
    }

    cpus.iter()
        .position(|cpu| cpu.initial_apic_id == bsp_apic_id)
        .unwrap_or(0)
}

/// Validate the discovered topology. More cores than the configured
/// limit, or two cores whose APIC IDs collide in the legacy 8-bit
/// field, cannot be driven and abort bring-up.
pub fn check_apic_ids(cpus: &[CpuRecord], max_cores: usize) -> Result<(), MpError> {
    if cpus.len() > max_cores {
        crate::kerror!(
            "MP: {} cores discovered, limit is {}",
            cpus.len(),
            max_cores
        );
        return Err(MpError::Unsupported);
    }

    for i in 0..cpus.len() {
        for j in (i + 1)..cpus.len() {
            if cpus[i].initial_apic_id != cpus[j].initial_apic_id
                && (cpus[i].initial_apic_id & 0xFF) == (cpus[j].initial_apic_id & 0xFF)
            {
                crate::kerror!(
                    "MP: legacy APIC ID collision: {:#x} vs {:#x}",
                    cpus[i].initial_apic_id,
                    cpus[j].initial_apic_id
                );
                return Err(MpError::Unsupported);
            }
        }
    }

    Ok(())
}

/// Decode package/core/thread for every record from its APIC ID using
/// the platform's topology bit widths.
pub fn extract_locations(hal: &dyn CpuHal, cpus: &mut [CpuRecord]) {
    let (thread_bits, core_bits) = hal.topology();
    for cpu in cpus.iter_mut() {
        let id = cpu.initial_apic_id;
        cpu.thread = id & ((1 << thread_bits) - 1);
        cpu.core = (id >> thread_bits) & ((1 << core_bits) - 1);
        cpu.package = id >> (thread_bits + core_bits);
    }
}

/// Mark the lowest-numbered core of each physical package. With the
/// records APIC-sorted that is the first record seen per package value.
pub fn assign_package_bsp(cpus: &mut [CpuRecord]) {
    let mut previous_package = u32::MAX;
    for cpu in cpus.iter_mut() {
        cpu.package_bsp = cpu.package != previous_package;
        previous_package = cpu.package;
    }
}

/// Index of the calling core in the records.
pub fn whoami(hal: &dyn CpuHal, cpus: &[CpuRecord]) -> Result<usize, MpError> {
    let apic_id = hal.apic_id();
    cpus.iter()
        .position(|cpu| cpu.apic_id == apic_id)
        .ok_or(MpError::NotFound)
}

/// Health of a record as tracked at runtime (BIST plus later updates).
pub fn mark_health(cpu: &CpuRecord, healthy: bool) {
    cpu.healthy.store(healthy, Ordering::Release);
}
