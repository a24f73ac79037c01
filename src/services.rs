//! MP services dispatch: startup-all/this, BSP switch, enable/disable,
//! identity and topology queries, and the AP-side dispatch wrapper.
//!
//! Every operation here is BSP-only and returns `DeviceError` to other
//! callers. Dispatch follows a fixed state machine per core: an AP is
//! claimed `Idle -> Ready`, runs `Busy`, parks `Finished`, and is reaped
//! back to `Idle` by the BSP. A core that misses its deadline is forced
//! back to `Idle` with a fresh INIT wake and reported in the failed
//! list.

use core::sync::atomic::Ordering;

use alloc::vec::Vec;

use crate::apic;
use crate::error::MpError;
use crate::hal::CpuHal;
use crate::regtable::{self, ApplyPhase};
use crate::timeout::Timeout;
use crate::types::{CpuState, DisableCause, MpContext, Procedure};
use crate::wake;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_BSP_FLAG: u64 = 1 << 8;

/// Public per-core view returned by [`get_info`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuInfo {
    pub apic_id: u32,
    pub is_bsp: bool,
    pub enabled: bool,
    pub healthy: bool,
    pub package: u32,
    pub core: u32,
    pub thread: u32,
}

/// Record index of the calling core.
pub fn whoami(hal: &dyn CpuHal, ctx: &MpContext) -> Result<usize, MpError> {
    apic::whoami(hal, &ctx.cpus)
}

/// Total and enabled logical processor counts.
pub fn get_count(ctx: &MpContext) -> (usize, usize) {
    (ctx.cpu_count(), ctx.enabled_count())
}

pub fn get_info(ctx: &MpContext, index: usize) -> Result<CpuInfo, MpError> {
    let cpu = ctx.cpus.get(index).ok_or(MpError::InvalidParameter)?;
    Ok(CpuInfo {
        apic_id: cpu.apic_id,
        is_bsp: ctx.is_bsp(index),
        enabled: cpu.enabled(),
        healthy: cpu.is_healthy(),
        package: cpu.package,
        core: cpu.core,
        thread: cpu.thread,
    })
}

fn require_bsp(hal: &dyn CpuHal, ctx: &MpContext) -> Result<usize, MpError> {
    let index = apic::whoami(hal, &ctx.cpus)?;
    if !ctx.is_bsp(index) {
        return Err(MpError::DeviceError);
    }
    Ok(index)
}

// ============================================================================
// StartupAllAPs
// ============================================================================

/// Run `procedure` on every enabled AP.
///
/// `single_thread` serializes the APs in ascending index order; the
/// relay in [`check_all_aps`] wakes each core as its predecessor is
/// reaped. A `timeout_us` of 0 waits forever. On timeout, the indices
/// of the stragglers are written to `failed` and each one is forced
/// back to `Idle`.
pub fn startup_all_aps(
    hal: &dyn CpuHal,
    ctx: &MpContext,
    procedure: Procedure,
    single_thread: bool,
    timeout_us: u64,
    argument: usize,
    mut failed: Option<&mut Vec<usize>>,
) -> Result<(), MpError> {
    start_all(
        hal,
        ctx,
        procedure,
        single_thread,
        timeout_us,
        argument,
        false,
    )?;

    loop {
        match check_all_aps(hal, ctx) {
            Ok(true) => return Ok(()),
            Ok(false) => hal.pause(),
            Err(error) => {
                if let Some(out) = failed.as_deref_mut() {
                    let dispatch = ctx.dispatch.lock();
                    out.clear();
                    out.extend_from_slice(&dispatch.failed);
                }
                return Err(error);
            }
        }
    }
}

/// Non-blocking [`startup_all_aps`]: kicks the operation off and
/// returns. Completion is driven by [`check_aps_tick`] and observed via
/// [`poll_startup_all`].
pub fn startup_all_aps_async(
    hal: &dyn CpuHal,
    ctx: &MpContext,
    procedure: Procedure,
    single_thread: bool,
    timeout_us: u64,
    argument: usize,
) -> Result<(), MpError> {
    start_all(
        hal,
        ctx,
        procedure,
        single_thread,
        timeout_us,
        argument,
        true,
    )
}

/// Take the outcome of a completed non-blocking startup, if any.
pub fn poll_startup_all(ctx: &MpContext) -> Option<Result<(), MpError>> {
    ctx.dispatch.lock().outcome.take()
}

fn start_all(
    hal: &dyn CpuHal,
    ctx: &MpContext,
    procedure: Procedure,
    single_thread: bool,
    timeout_us: u64,
    argument: usize,
    pending: bool,
) -> Result<(), MpError> {
    let caller = require_bsp(hal, ctx)?;

    let mut startable: Vec<usize> = Vec::new();
    for (index, cpu) in ctx.cpus.iter().enumerate() {
        if index == caller {
            continue;
        }
        match cpu.state() {
            CpuState::Disabled => {}
            CpuState::Idle => startable.push(index),
            _ => return Err(MpError::NotReady),
        }
    }

    if startable.is_empty() {
        // A single-core system has nothing to start and that is fine;
        // a multi-core system with every AP disabled is an error.
        return if ctx.cpu_count() == 1 {
            Ok(())
        } else {
            Err(MpError::NotStarted)
        };
    }

    {
        let mut dispatch = ctx.dispatch.lock();
        dispatch.cpu_list.clear();
        dispatch.cpu_list.resize(ctx.cpu_count(), false);
        for &index in &startable {
            dispatch.cpu_list[index] = true;
        }
        dispatch.start_count = startable.len();
        dispatch.finish_count = 0;
        dispatch.single_thread = single_thread;
        dispatch.procedure = Some(procedure);
        dispatch.argument = argument;
        dispatch.timeout = Timeout::start(hal, timeout_us);
        dispatch.pending = pending;
        dispatch.outcome = None;
        dispatch.failed.clear();
    }

    for &index in &startable {
        ctx.cpus[index].set_state(CpuState::Ready);
    }

    if single_thread {
        // Only the lowest index runs now; the rest wait their turn.
        wake::wake_ap(hal, ctx, startable[0], Some(procedure), argument);
    } else {
        for &index in &startable {
            wake::wake_ap(hal, ctx, index, Some(procedure), argument);
        }
    }

    Ok(())
}

/// One pass over the in-flight startup-all operation. Reaps `Finished`
/// cores back to `Idle`, relays the next core in single-thread mode,
/// and enforces the deadline. Returns `Ok(true)` once every listed core
/// finished.
pub fn check_all_aps(hal: &dyn CpuHal, ctx: &MpContext) -> Result<bool, MpError> {
    let mut dispatch = ctx.dispatch.lock();

    let mut reaped = false;
    for index in 0..ctx.cpu_count() {
        if !dispatch.cpu_list.get(index).copied().unwrap_or(false) {
            continue;
        }
        if ctx.cpus[index].state() == CpuState::Finished {
            ctx.cpus[index].slot.lock().clear();
            ctx.cpus[index].set_state(CpuState::Idle);
            dispatch.cpu_list[index] = false;
            dispatch.finish_count += 1;
            reaped = true;
        }
    }

    // The single-thread relay only advances when a predecessor was
    // just reaped; a Busy core keeps the baton.
    let mut relay: Option<usize> = None;
    if dispatch.single_thread && reaped {
        relay = (0..ctx.cpu_count()).find(|&index| {
            dispatch.cpu_list[index] && ctx.cpus[index].state() == CpuState::Ready
        });
    }

    if dispatch.finish_count >= dispatch.start_count {
        return Ok(true);
    }

    if let Some(next) = relay {
        let procedure = dispatch.procedure;
        let argument = dispatch.argument;
        wake::wake_ap(hal, ctx, next, procedure, argument);
    }

    if dispatch.timeout.expired(hal) {
        dispatch.failed.clear();
        let mut stuck: Vec<usize> = Vec::new();
        for index in 0..ctx.cpu_count() {
            if dispatch.cpu_list.get(index).copied().unwrap_or(false) {
                dispatch.failed.push(index);
                stuck.push(index);
                dispatch.cpu_list[index] = false;
            }
        }
        drop(dispatch);
        for index in stuck {
            crate::kwarn!("MP: core {} missed its deadline, forcing Idle", index);
            reset_processor_to_idle(hal, ctx, index);
        }
        return Err(MpError::Timeout);
    }

    Ok(false)
}

/// Periodic poll hook: drives any outstanding non-blocking startup-all
/// operation to its outcome. Arm it on a timer at
/// `MpConfig::check_interval_us`.
pub fn check_aps_tick(hal: &dyn CpuHal, ctx: &MpContext) {
    if !ctx.dispatch.lock().pending {
        return;
    }
    match check_all_aps(hal, ctx) {
        Ok(true) => {
            let mut dispatch = ctx.dispatch.lock();
            dispatch.pending = false;
            dispatch.outcome = Some(Ok(()));
        }
        Ok(false) => {}
        Err(error) => {
            let mut dispatch = ctx.dispatch.lock();
            dispatch.pending = false;
            dispatch.outcome = Some(Err(error));
        }
    }
}

// ============================================================================
// StartupThisAP
// ============================================================================

/// Run `procedure` on one AP and wait for it.
pub fn startup_this_ap(
    hal: &dyn CpuHal,
    ctx: &MpContext,
    procedure: Procedure,
    index: usize,
    timeout_us: u64,
    argument: usize,
) -> Result<(), MpError> {
    startup_this_ap_async(hal, ctx, procedure, index, timeout_us, argument)?;
    loop {
        match check_this_ap(hal, ctx, index) {
            Ok(true) => return Ok(()),
            Ok(false) => hal.pause(),
            Err(error) => return Err(error),
        }
    }
}

/// Non-blocking [`startup_this_ap`]; poll with [`check_this_ap`].
pub fn startup_this_ap_async(
    hal: &dyn CpuHal,
    ctx: &MpContext,
    procedure: Procedure,
    index: usize,
    timeout_us: u64,
    argument: usize,
) -> Result<(), MpError> {
    let caller = require_bsp(hal, ctx)?;
    if index >= ctx.cpu_count() || index == caller {
        return Err(MpError::InvalidParameter);
    }
    let cpu = &ctx.cpus[index];
    match cpu.state() {
        CpuState::Disabled => return Err(MpError::InvalidParameter),
        CpuState::Idle => {}
        _ => return Err(MpError::NotReady),
    }

    {
        let mut slot = cpu.slot.lock();
        slot.clear();
        slot.timeout = Timeout::start(hal, timeout_us);
    }
    cpu.set_state(CpuState::Ready);
    wake::wake_ap(hal, ctx, index, Some(procedure), argument);
    Ok(())
}

/// One poll of a targeted dispatch. `Ok(true)` when the AP finished and
/// was reaped; on deadline the AP is forced back to `Idle` and
/// `Timeout` returned.
pub fn check_this_ap(hal: &dyn CpuHal, ctx: &MpContext, index: usize) -> Result<bool, MpError> {
    let cpu = ctx.cpus.get(index).ok_or(MpError::InvalidParameter)?;

    if cpu.state() == CpuState::Finished {
        cpu.slot.lock().clear();
        cpu.set_state(CpuState::Idle);
        return Ok(true);
    }

    let expired = cpu.slot.lock().timeout.expired(hal);
    if expired {
        crate::kwarn!("MP: core {} missed its deadline, forcing Idle", index);
        reset_processor_to_idle(hal, ctx, index);
        return Err(MpError::Timeout);
    }
    Ok(false)
}

/// Force a stuck core back to `Idle`: drop its queued procedure and
/// INIT it so it re-enters its park loop from scratch.
pub fn reset_processor_to_idle(hal: &dyn CpuHal, ctx: &MpContext, index: usize) {
    ctx.cpus[index].slot.lock().clear();
    ctx.cpus[index].set_state(CpuState::Idle);
    wake::wake_targeted(hal, ctx.apic_id_of(index), wake::startup_vector(&ctx.exchange));
}

// ============================================================================
// SwitchBSP
// ============================================================================

/// Hand the BSP role to `index`. The outgoing BSP becomes an AP
/// (`enable_old_bsp` false parks it disabled). Switching A->B and then
/// B->A restores the original assignment.
pub fn switch_bsp(
    hal: &dyn CpuHal,
    ctx: &MpContext,
    index: usize,
    enable_old_bsp: bool,
) -> Result<(), MpError> {
    let caller = require_bsp(hal, ctx)?;
    if index >= ctx.cpu_count() || index == caller {
        return Err(MpError::InvalidParameter);
    }
    let target = &ctx.cpus[index];
    if !target.enabled() || !target.is_healthy() {
        return Err(MpError::InvalidParameter);
    }
    if target.state() != CpuState::Idle {
        return Err(MpError::NotReady);
    }

    let timer = hal.save_timer();
    let interrupts = hal.disable_interrupts();

    // Step down before the exchange; exactly one core may carry the
    // BSP flag at any time.
    let apic_base = hal.read_msr(IA32_APIC_BASE);
    hal.write_msr(IA32_APIC_BASE, apic_base & !APIC_BASE_BSP_FLAG);

    ctx.role_swap
        .bsp
        .state
        .store(crate::hal::SwitchState::Idle as u32, Ordering::Release);
    ctx.role_swap
        .ap
        .state
        .store(crate::hal::SwitchState::Idle as u32, Ordering::Release);
    ctx.bsp_switching.store(true, Ordering::Release);

    target.set_state(CpuState::Ready);
    wake::wake_ap(hal, ctx, index, Some(future_bsp_proc), caller);

    hal.exchange_role(&ctx.role_swap.bsp, &ctx.role_swap.ap);

    // Execution resumes here on the incoming BSP's context.
    let apic_base = hal.read_msr(IA32_APIC_BASE);
    hal.write_msr(IA32_APIC_BASE, apic_base | APIC_BASE_BSP_FLAG);
    ctx.bsp_index.store(index, Ordering::Release);
    hal.restore_timer(timer);
    hal.restore_interrupts(interrupts);

    // Wait for the outgoing BSP to complete its half of the handoff.
    while ctx.cpus[caller].state() != CpuState::Finished {
        hal.pause();
    }
    ctx.bsp_switching.store(false, Ordering::Release);

    ctx.cpus[index].slot.lock().clear();
    ctx.cpus[index].set_state(CpuState::Idle);
    ctx.cpus[caller].slot.lock().clear();
    if enable_old_bsp {
        ctx.cpus[caller].set_state(CpuState::Idle);
    } else {
        ctx.cpus[caller].set_state(CpuState::Disabled);
        ctx.cpus[caller]
            .disable_cause
            .store(DisableCause::UserRequest as u8, Ordering::Release);
    }

    crate::kinfo!("MP: BSP switched from core {} to core {}", caller, index);
    Ok(())
}

/// AP half of the BSP switch; dispatched onto the incoming BSP. The
/// argument is the record index of the outgoing BSP.
fn future_bsp_proc(hal: &dyn CpuHal, ctx: &MpContext, argument: usize) {
    hal.exchange_role(&ctx.role_swap.ap, &ctx.role_swap.bsp);
    // On hardware this line already runs on the outgoing BSP's core.
    ctx.cpus[argument].set_state(CpuState::Finished);
}

// ============================================================================
// EnableDisableAP
// ============================================================================

pub fn enable_disable_ap(
    hal: &dyn CpuHal,
    ctx: &MpContext,
    index: usize,
    enable: bool,
    healthy: Option<bool>,
) -> Result<(), MpError> {
    let caller = require_bsp(hal, ctx)?;
    if index >= ctx.cpu_count() || index == caller {
        return Err(MpError::InvalidParameter);
    }
    let cpu = &ctx.cpus[index];

    if enable {
        if cpu.state() == CpuState::Disabled {
            cpu.set_state(CpuState::Idle);
            cpu.disable_cause
                .store(DisableCause::None as u8, Ordering::Release);
        }
    } else {
        match cpu.state() {
            CpuState::Idle => {
                cpu.set_state(CpuState::Disabled);
                cpu.disable_cause
                    .store(DisableCause::UserRequest as u8, Ordering::Release);
            }
            CpuState::Disabled => {}
            _ => return Err(MpError::NotReady),
        }
    }

    if let Some(healthy) = healthy {
        apic::mark_health(cpu, healthy);
    }
    Ok(())
}

// ============================================================================
// AP-side dispatch wrapper
// ============================================================================

/// AP entry for one wake. Replays the core's register table when this
/// wake follows an INIT, runs the queued procedure through the
/// `Ready -> Busy -> Finished` cycle, and clears the startup signal on
/// the way out. Called by the trampoline (hlt-loop mode) or the park
/// loop (monitor/run modes).
pub fn ap_entry(hal: &dyn CpuHal, ctx: &MpContext, index: usize) {
    hal.program_virtual_wire();

    if ctx.restore_after_init.load(Ordering::Acquire) {
        if let Some(table) = ctx.reg_tables.get(index) {
            regtable::apply(hal, table, ApplyPhase::All, true);
        }
    }

    let (procedure, argument) = {
        let slot = ctx.cpus[index].slot.lock();
        (slot.procedure, slot.argument)
    };

    if let Some(procedure) = procedure {
        ctx.cpus[index].set_state(CpuState::Busy);
        procedure(hal, ctx, argument);
        if !ctx.bsp_switching.load(Ordering::Acquire) {
            let mut slot = ctx.cpus[index].slot.lock();
            slot.finished = true;
            drop(slot);
            ctx.cpus[index].set_state(CpuState::Finished);
        }
    }

    let _ = ctx.exchange.consume_signal(index);
}

// ============================================================================
// Broadcast dispatch with countdown
// ============================================================================

/// Dispatch `procedure` to `targets` and spin until each one decrements
/// the countdown. Procedures used here must call
/// [`finish_dispatch`] when done; the setting phase uses this to apply
/// register tables in lockstep.
pub fn dispatch_and_wait(
    hal: &dyn CpuHal,
    ctx: &MpContext,
    procedure: Procedure,
    argument: usize,
    targets: &[usize],
) -> Result<(), MpError> {
    ctx.setting_countdown.store(targets.len(), Ordering::Release);
    for &index in targets {
        ctx.cpus[index].set_state(CpuState::Ready);
        wake::wake_ap(hal, ctx, index, Some(procedure), argument);
    }

    let mut timeout = Timeout::start(hal, ctx.config.startup_timeout_us);
    while ctx.setting_countdown.load(Ordering::Acquire) > 0 {
        if timeout.expired(hal) {
            return Err(MpError::Timeout);
        }
        hal.pause();
    }

    for &index in targets {
        if ctx.cpus[index].state() == CpuState::Finished {
            ctx.cpus[index].slot.lock().clear();
            ctx.cpus[index].set_state(CpuState::Idle);
        }
    }
    Ok(())
}

/// Countdown notch for procedures run under [`dispatch_and_wait`].
pub fn finish_dispatch(ctx: &MpContext) {
    ctx.setting_countdown.fetch_sub(1, Ordering::AcqRel);
}
