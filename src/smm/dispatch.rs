//! Remote dispatch onto cores inside an SMM session, and the deferred
//! BSP switch request.

use core::sync::atomic::Ordering;

use crate::error::MpError;

use super::session::{PendingOp, SmmProcedure, SmmSync};

/// Queue `procedure` on core `index` and kick it, without waiting.
/// The caller's claim on the target is its Busy lock; it is released by
/// the target when the work completes, or drained by the BSP at session
/// teardown.
pub fn smm_startup_this_ap(
    sync: &SmmSync,
    caller: usize,
    procedure: SmmProcedure,
    index: usize,
    argument: usize,
) -> Result<(), MpError> {
    validate_target(sync, caller, index)?;

    if !sync.cpus[index].busy.try_acquire() {
        // Someone else already has work in flight on this core.
        return Err(MpError::InvalidParameter);
    }

    {
        let mut slot = sync.cpus[index].slot.lock();
        slot.procedure = Some(procedure);
        slot.argument = argument;
    }
    sync.cpus[index].run.release();
    Ok(())
}

/// Queue `procedure` on core `index` and wait for it to finish.
pub fn smm_blocking_startup_this_ap(
    sync: &SmmSync,
    caller: usize,
    procedure: SmmProcedure,
    index: usize,
    argument: usize,
) -> Result<(), MpError> {
    smm_startup_this_ap(sync, caller, procedure, index, argument)?;

    // The target releases Busy when the procedure returns.
    sync.cpus[index].busy.acquire();
    sync.cpus[index].busy.release();
    Ok(())
}

/// Request that `index` be the BSP of a future session. Deferred: the
/// flag steers the next election, nothing changes mid-session.
pub fn smm_switch_bsp(sync: &SmmSync, caller: usize, index: usize) -> Result<(), MpError> {
    if index >= sync.cpus.len() {
        return Err(MpError::InvalidParameter);
    }
    if sync.apic_ids[index] == super::session::INVALID_APIC_ID {
        return Err(MpError::NotFound);
    }
    if index == caller
        || sync.bsp() == Some(index)
        || sync.cpus[index].pending_op() != PendingOp::None
    {
        return Err(MpError::Unsupported);
    }

    sync.cpus[index]
        .op
        .store(PendingOp::SwitchBsp as u8, Ordering::Release);
    sync.candidate[index].store(true, Ordering::Release);
    sync.switch_bsp_pending.store(true, Ordering::Release);
    Ok(())
}

fn validate_target(sync: &SmmSync, caller: usize, index: usize) -> Result<(), MpError> {
    if index >= sync.cpus.len() || index == caller {
        return Err(MpError::InvalidParameter);
    }
    if !sync.cpus[index].is_present() {
        return Err(MpError::InvalidParameter);
    }
    if sync.cpus[index].pending_op() != PendingOp::None {
        return Err(MpError::InvalidParameter);
    }
    Ok(())
}
