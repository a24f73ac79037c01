//! Three-phase boot orchestrator.
//!
//! Data collection wakes and counts every core and fixes the numbering;
//! analysis derives each core's register table; setting programs the
//! tables, taking the CPU-only reset detour when any entry must be live
//! before it. The phases run on the BSP, strictly in order, exactly
//! once.

use core::sync::atomic::Ordering;

use alloc::vec;

use crate::analysis::{self, FeatureLists};
use crate::apic;
use crate::error::MpError;
use crate::exchange::MAX_CORES;
use crate::hal::CpuHal;
use crate::regtable::{self, ApplyPhase, RegisterTable};
use crate::services;
use crate::types::{CpuRecord, MpContext};
use crate::wake;

/// Phase 1: broadcast counting wake, then sort, validate and decorate
/// the discovered topology.
pub fn data_collection_phase(hal: &dyn CpuHal, ctx: &mut MpContext) -> Result<(), MpError> {
    let bsp_apic_id = hal.apic_id();

    // Slot 0 is the BSP's own.
    ctx.exchange.info.bist[0]
        .apic_id
        .store(bsp_apic_id, Ordering::Release);
    ctx.exchange.info.bist[0].bist.store(0, Ordering::Release);

    let ap_count =
        wake::wake_broadcast_and_count(hal, &ctx.exchange, ctx.config.startup_timeout_us);
    crate::kinfo!("MP: counting wake found {} APs", ap_count);

    let total = (ap_count as usize + 1).min(MAX_CORES);
    ctx.cpus.clear();
    for slot in &ctx.exchange.info.bist[..total] {
        ctx.cpus.push(CpuRecord::new(
            slot.apic_id.load(Ordering::Acquire),
            slot.bist.load(Ordering::Acquire),
        ));
    }

    let bsp_index = apic::sort_by_apic_id(&mut ctx.cpus, bsp_apic_id);
    ctx.bsp_index.store(bsp_index, Ordering::Release);

    apic::check_apic_ids(&ctx.cpus, ctx.config.max_cores)?;
    apic::extract_locations(hal, &mut ctx.cpus);
    apic::assign_package_bsp(&mut ctx.cpus);

    for (index, cpu) in ctx.cpus.iter().enumerate() {
        if cpu.bist != 0 {
            crate::kwarn!(
                "MP: core {} (APIC {:#x}) failed BIST: {:#x}",
                index,
                cpu.apic_id,
                cpu.bist
            );
        }
    }

    // One table and one setting slot per discovered core.
    let total = ctx.cpus.len();
    ctx.reg_tables = vec![RegisterTable::new(); total];
    ctx.pre_smm_tables = vec![RegisterTable::new(); total];
    ctx.setting_sequence = (0..total).collect();

    crate::kinfo!(
        "MP: data collection done, {} cores, BSP is core {}",
        total,
        bsp_index
    );
    Ok(())
}

/// Phase 2 with the built-in feature set. Platforms that register their
/// own features build a [`FeatureLists`] and call
/// [`analysis::analysis_phase`] directly.
pub fn run_analysis(hal: &dyn CpuHal, ctx: &mut MpContext) {
    let mut lists = FeatureLists::new(ctx.cpus.len());
    analysis::collect_features(hal, &mut lists, ctx.cpus.len());
    analysis::analysis_phase(ctx, &lists);
}

/// Phase 3: program every core's register table.
///
/// When any table carries before-reset entries, the prefix is applied
/// everywhere first, then the CPU-only reset round trip runs, then the
/// remainder is applied per core in `setting_sequence` order - the BSP
/// locally, APs by targeted dispatch. Afterwards `restore_after_init`
/// is up, so every later INIT replay skips full-width MSR writes.
pub fn setting_phase(hal: &dyn CpuHal, ctx: &MpContext) -> Result<(), MpError> {
    let bsp = ctx.bsp_index();
    let needs_reset = ctx.reg_tables.iter().any(RegisterTable::needs_reset);

    if needs_reset {
        crate::kinfo!("MP: pre-reset register prefix required");
        regtable::apply(hal, &ctx.reg_tables[bsp], ApplyPhase::BeforeReset, false);

        let targets: alloc::vec::Vec<usize> = (0..ctx.cpu_count())
            .filter(|&index| index != bsp && ctx.cpus[index].enabled())
            .collect();
        if !targets.is_empty() {
            services::dispatch_and_wait(hal, ctx, apply_before_reset_proc, 0, &targets)?;
        }

        cpu_only_reset_and_restore(hal, ctx)?;
    }

    for &index in &ctx.setting_sequence {
        if !ctx.cpus[index].enabled() {
            continue;
        }
        if index == bsp {
            regtable::apply(hal, &ctx.reg_tables[index], ApplyPhase::AfterReset, false);
        } else {
            services::dispatch_and_wait(hal, ctx, apply_after_reset_proc, 0, &[index])?;
        }
    }

    ctx.restore_after_init.store(true, Ordering::Release);
    crate::kinfo!("MP: setting phase complete");
    Ok(())
}

/// All three phases back to back.
pub fn configure(hal: &dyn CpuHal, ctx: &mut MpContext) -> Result<(), MpError> {
    data_collection_phase(hal, ctx)?;
    run_analysis(hal, ctx);
    setting_phase(hal, ctx)?;
    Ok(())
}

/// At ready-to-boot, park the APs in the loop mode the OS expects.
pub fn ready_to_boot(hal: &dyn CpuHal, ctx: &MpContext) {
    wake::upgrade_loop_mode(hal, ctx, ctx.config.loop_mode);
}

/// INIT every core without a platform reset, then rebuild the early
/// state the INIT wiped: virtual wire routing and the before-reset
/// register prefix, BSP locally and APs by re-dispatch.
fn cpu_only_reset_and_restore(hal: &dyn CpuHal, ctx: &MpContext) -> Result<(), MpError> {
    crate::kinfo!("MP: CPU-only reset");
    hal.cpu_only_reset();

    hal.program_virtual_wire();
    let bsp = ctx.bsp_index();
    regtable::apply(hal, &ctx.reg_tables[bsp], ApplyPhase::BeforeReset, true);

    let targets: alloc::vec::Vec<usize> = (0..ctx.cpu_count())
        .filter(|&index| index != bsp && ctx.cpus[index].enabled())
        .collect();
    if !targets.is_empty() {
        services::dispatch_and_wait(hal, ctx, early_mp_init_proc, 0, &targets)?;
    }
    Ok(())
}

fn apply_before_reset_proc(hal: &dyn CpuHal, ctx: &MpContext, _argument: usize) {
    if let Ok(index) = apic::whoami(hal, &ctx.cpus) {
        regtable::apply(hal, &ctx.reg_tables[index], ApplyPhase::BeforeReset, false);
    }
    services::finish_dispatch(ctx);
}

fn apply_after_reset_proc(hal: &dyn CpuHal, ctx: &MpContext, _argument: usize) {
    if let Ok(index) = apic::whoami(hal, &ctx.cpus) {
        regtable::apply(
            hal,
            &ctx.reg_tables[index],
            ApplyPhase::AfterReset,
            ctx.restore_after_init.load(Ordering::Acquire),
        );
    }
    services::finish_dispatch(ctx);
}

fn early_mp_init_proc(hal: &dyn CpuHal, ctx: &MpContext, _argument: usize) {
    hal.program_virtual_wire();
    if let Ok(index) = apic::whoami(hal, &ctx.cpus) {
        regtable::apply(hal, &ctx.reg_tables[index], ApplyPhase::BeforeReset, true);
    }
    services::finish_dispatch(ctx);
}
