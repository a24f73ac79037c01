//! SMI rendezvous: arrival counting, BSP election, the two timed
//! arrival windows, and the BSP/AP session handlers with their MTRR
//! handshake.
//!
//! Session invariants:
//! - the arrival counter never exceeds the machine's core total between
//!   lockdowns; a core that loses the lockdown race leaves uncounted.
//! - once elected, the BSP index only changes in the quiet window at
//!   the end of a session.
//! - in traditional mode the dispatcher body never runs before every
//!   countable core has arrived.

use core::sync::atomic::Ordering;

use crate::config::SmmSyncMode;
use crate::hal::{CpuHal, MtrrSnapshot, SmiBlockState};

use super::session::{PendingOp, SmmBody, SmmSync};
use super::timer::SyncTimer;

/// Per-core SMI entry point. `index` is the caller's slot in the
/// session; `body` is the dispatcher the elected BSP runs.
pub fn smi_rendezvous(hal: &dyn CpuHal, sync: &SmmSync, index: usize, body: SmmBody) {
    let bsp_in_progress = sync.inside_smm.load(Ordering::Acquire);
    if !hal.valid_smi() && !bsp_in_progress {
        // Not our SMI and no session to join.
        return;
    }

    if sync.counter.release() == 0 {
        // Lockdown won the race: the roster is already frozen without
        // us. Wait out the session and take the next SMI from scratch.
        while sync.all_in_sync.load(Ordering::Acquire) {
            hal.pause();
        }
        return;
    }

    // A re-entering core must not inherit a stale lock from a previous
    // session.
    sync.cpus[index].busy.reset();

    if sync.election && sync.bsp().is_none() {
        let eligible = !sync.switch_bsp_pending.load(Ordering::Acquire)
            || sync.candidate[index].load(Ordering::Acquire);
        if eligible {
            let _ = sync.bsp_index.compare_exchange(
                -1,
                index as i32,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    if sync.bsp() == Some(index) {
        // The steering that got us elected is spent.
        sync.switch_bsp_pending.store(false, Ordering::Release);
        for (flag, cpu) in sync.candidate.iter().zip(sync.cpus.iter()) {
            flag.store(false, Ordering::Release);
            cpu.op.store(PendingOp::None as u8, Ordering::Release);
        }
        bsp_handler(hal, sync, index, body);
    } else {
        ap_handler(hal, sync, index);
        while sync.all_in_sync.load(Ordering::Acquire) {
            hal.pause();
        }
    }
}

/// Whether every core is accounted for: arrived, or excusably absent
/// per its own indication capabilities.
pub fn all_cpus_in_smm_with_exceptions(hal: &dyn CpuHal, sync: &SmmSync) -> bool {
    if sync.counter.count() as usize >= sync.cpus.len() {
        return true;
    }
    for (index, cpu) in sync.cpus.iter().enumerate() {
        if cpu.is_present() {
            continue;
        }
        let apic_id = sync.apic_ids[index];
        if apic_id == super::session::INVALID_APIC_ID {
            continue;
        }
        let excused = match hal.smi_block_state(apic_id) {
            SmiBlockState::Delayed => true,
            SmiBlockState::Blocked => true,
            SmiBlockState::Disabled => true,
            SmiBlockState::None => false,
        };
        if !excused {
            return false;
        }
    }
    true
}

/// Two arrival windows. If the first expires short, every absent core
/// that supports directed SMIs gets one more, then the second window
/// runs.
fn wait_for_ap_arrival(hal: &dyn CpuHal, sync: &SmmSync) {
    let total = sync.cpus.len() as u32;

    let mut window = SyncTimer::start(hal, sync.sync_timeout_us);
    while sync.counter.count() < total && !window.is_timeout(hal) {
        if all_cpus_in_smm_with_exceptions(hal, sync) {
            break;
        }
        hal.pause();
    }

    if sync.counter.count() < total {
        // Second chance: re-IPI exactly the absent set.
        for (index, cpu) in sync.cpus.iter().enumerate() {
            let apic_id = sync.apic_ids[index];
            if cpu.is_present() || apic_id == super::session::INVALID_APIC_ID {
                continue;
            }
            if hal.targeted_smi_supported(apic_id) {
                hal.send_smi(apic_id);
            }
        }

        let mut window = SyncTimer::start(hal, sync.sync_timeout_us);
        while sync.counter.count() < total && !window.is_timeout(hal) {
            if all_cpus_in_smm_with_exceptions(hal, sync) {
                break;
            }
            hal.pause();
        }
    }
}

fn wait_for_all_aps(sync: &SmmSync, bsp_index: usize, count: usize) {
    for _ in 0..count {
        sync.cpus[bsp_index].run.wait();
    }
}

fn release_all_aps(sync: &SmmSync, bsp_index: usize) {
    for (index, cpu) in sync.cpus.iter().enumerate() {
        if index != bsp_index && cpu.is_present() {
            cpu.run.release();
        }
    }
}

fn bsp_handler(hal: &dyn CpuHal, sync: &SmmSync, index: usize, body: SmmBody) {
    sync.inside_smm.store(true, Ordering::Release);
    sync.cpus[index].present.store(true, Ordering::Release);

    let traditional = sync.effective_mode() == SmmSyncMode::Traditional;
    let need_mtrr = hal.need_configure_mtrrs();
    let mut snapshot = MtrrSnapshot::empty();

    if traditional || need_mtrr {
        wait_for_ap_arrival(hal, sync);

        sync.all_in_sync.store(true, Ordering::Release);
        let ap_count = sync.counter.lockdown().saturating_sub(1) as usize;
        sync.ap_count.store(ap_count, Ordering::Release);

        // Every counted AP checks in once.
        wait_for_all_aps(sync, index, ap_count);

        if need_mtrr {
            // Three-step handshake: everyone backs up, then everyone
            // moves to the firmware MTRR map in lockstep.
            release_all_aps(sync, index);
            hal.save_mtrrs(&mut snapshot);
            wait_for_all_aps(sync, index, ap_count);

            release_all_aps(sync, index);
            hal.load_firmware_mtrrs();
            wait_for_all_aps(sync, index, ap_count);
        }
    }

    // The BSP holds its own Busy for the span of the session body.
    sync.cpus[index].busy.acquire();
    body(hal, sync);

    // Drain remote work still queued on APs before tearing down.
    for (other, cpu) in sync.cpus.iter().enumerate() {
        if other != index && cpu.is_present() {
            cpu.busy.acquire();
            cpu.busy.release();
        }
    }

    // End of SMI: re-arm the latch so the next SMI pends behind this
    // session instead of folding into it.
    hal.clear_smi();

    let ap_count = if traditional || need_mtrr {
        sync.ap_count.load(Ordering::Acquire)
    } else {
        // Relaxed: the roster freezes only now, and stragglers that
        // were counted must have made it to present before we close.
        sync.all_in_sync.store(true, Ordering::Release);
        let ap_count = sync.counter.lockdown().saturating_sub(1) as usize;
        sync.ap_count.store(ap_count, Ordering::Release);
        while sync.present_count() <= ap_count {
            hal.pause();
        }
        ap_count
    };

    sync.inside_smm.store(false, Ordering::Release);
    release_all_aps(sync, index);
    wait_for_all_aps(sync, index, ap_count);

    // Quiet window: every AP is parked between handshakes, nobody
    // samples the mode.
    sync.commit_mode();

    if need_mtrr {
        release_all_aps(sync, index);
        hal.load_mtrrs(&snapshot);
        wait_for_all_aps(sync, index, ap_count);
    }

    // Reset phase.
    release_all_aps(sync, index);
    wait_for_all_aps(sync, index, ap_count);

    sync.cpus[index].present.store(false, Ordering::Release);
    sync.cpus[index].busy.release();
    if sync.election {
        sync.bsp_index.store(-1, Ordering::Release);
    }
    sync.counter.reset(0);
    sync.all_in_sync.store(false, Ordering::Release);
}

fn ap_handler(hal: &dyn CpuHal, sync: &SmmSync, index: usize) {
    // Bounded wait for a session to open.
    let mut timer = SyncTimer::start(hal, sync.sync_timeout_us);
    let mut timed_out = false;
    while !sync.inside_smm.load(Ordering::Acquire) {
        if timer.is_timeout(hal) {
            timed_out = true;
            break;
        }
        hal.pause();
    }

    if timed_out {
        let mut opened = false;
        if let Some(bsp) = sync.bsp() {
            if bsp != index {
                // The BSP may not have seen this SMI at all; nudge it
                // and grant one more window for the session to open.
                hal.send_smi(sync.apic_ids[bsp]);
                let mut retry = SyncTimer::start(hal, sync.sync_timeout_us);
                while !retry.is_timeout(hal) {
                    if sync.inside_smm.load(Ordering::Acquire) {
                        opened = true;
                        break;
                    }
                    hal.pause();
                }
            }
        }
        if !opened {
            // No session and nobody able to start one: leave, taking
            // our arrival back out of the counter.
            sync.counter.wait();
            return;
        }
    }

    let traditional = sync.effective_mode() == SmmSyncMode::Traditional;
    let need_mtrr = hal.need_configure_mtrrs();
    let bsp = match sync.bsp() {
        Some(bsp) => bsp,
        None => {
            sync.counter.wait();
            return;
        }
    };

    sync.cpus[index].present.store(true, Ordering::Release);

    if traditional || need_mtrr {
        // Arrival check-in the BSP counts after lockdown.
        sync.cpus[bsp].run.release();
    }

    let mut snapshot = MtrrSnapshot::empty();
    if need_mtrr {
        sync.cpus[index].run.wait();
        hal.save_mtrrs(&mut snapshot);
        sync.cpus[bsp].run.release();

        sync.cpus[index].run.wait();
        hal.load_firmware_mtrrs();
        sync.cpus[bsp].run.release();
    }

    loop {
        sync.cpus[index].run.wait();
        if !sync.inside_smm.load(Ordering::Acquire) {
            break;
        }

        // The requester took our Busy before queueing; it is ours to
        // release once the work is done.
        debug_assert!(sync.cpus[index].busy.is_held());
        let (procedure, argument) = {
            let slot = sync.cpus[index].slot.lock();
            (slot.procedure, slot.argument)
        };
        if let Some(procedure) = procedure {
            procedure(hal, sync, argument);
        }
        sync.cpus[index].slot.lock().procedure = None;
        sync.cpus[index].busy.release();
    }

    // Exit check-in.
    sync.cpus[bsp].run.release();

    if need_mtrr {
        sync.cpus[index].run.wait();
        hal.load_mtrrs(&snapshot);
        sync.cpus[bsp].run.release();
    }

    // Reset phase.
    sync.cpus[index].run.wait();
    sync.cpus[bsp].run.release();

    sync.cpus[index].present.store(false, Ordering::Release);
}
