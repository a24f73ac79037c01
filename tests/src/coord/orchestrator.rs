//! Boot Orchestrator Tests
//!
//! Data collection runs without AP threads: queued trampoline arrivals
//! drain into the exchange region while the counting wake's delays
//! tick. The setting phase runs with live simulators, since its
//! targeted dispatches need an AP on the other end.

#[cfg(test)]
mod tests {
    use core::sync::atomic::Ordering;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use crate::config::MpConfig;
    use crate::error::MpError;
    use crate::exchange::ApLoopMode;
    use crate::mock::{self, MockHal};
    use crate::orchestrator;
    use crate::regtable::{RegisterKind, RegisterTableEntry};
    use crate::types::MpContext;

    const IA32_MISC_ENABLE: u32 = 0x1A0;
    const IA32_EFER: u32 = 0xC000_0080;

    // =========================================================================
    // Phase 1: data collection
    // =========================================================================

    #[test]
    fn test_data_collection_sorts_and_numbers() {
        let hal = MockHal::with_apic_ids(vec![4, 6, 2]);
        let mut ctx = MpContext::new(MpConfig::default());
        hal.attach_exchange(&ctx.exchange.info);
        hal.queue_arrival(6, 0);
        hal.queue_arrival(2, 0x3);
        mock::set_core(0);

        orchestrator::data_collection_phase(&hal, &mut ctx).unwrap();

        let apic_ids: Vec<u32> = ctx.cpus.iter().map(|cpu| cpu.apic_id).collect();
        assert_eq!(apic_ids, [2, 4, 6]);
        assert_eq!(ctx.bsp_index(), 1);
        assert!(!ctx.cpus[0].is_healthy());
        assert!(ctx.cpus[1].is_healthy());
        assert_eq!(ctx.reg_tables.len(), 3);
        assert_eq!(ctx.pre_smm_tables.len(), 3);
        assert_eq!(ctx.setting_sequence, [0, 1, 2]);
    }

    #[test]
    fn test_data_collection_on_single_core() {
        let hal = MockHal::new(1);
        let mut config = MpConfig::default();
        config.startup_timeout_us = 1_000;
        let mut ctx = MpContext::new(config);
        hal.attach_exchange(&ctx.exchange.info);
        mock::set_core(0);

        orchestrator::data_collection_phase(&hal, &mut ctx).unwrap();

        assert_eq!(ctx.cpus.len(), 1);
        assert_eq!(ctx.bsp_index(), 0);
        assert_eq!(ctx.reg_tables.len(), 1);
    }

    #[test]
    fn test_data_collection_rejects_legacy_apic_collision() {
        let hal = MockHal::with_apic_ids(vec![0x2]);
        let mut ctx = MpContext::new(MpConfig::default());
        hal.attach_exchange(&ctx.exchange.info);
        hal.queue_arrival(0x102, 0);
        mock::set_core(0);

        let result = orchestrator::data_collection_phase(&hal, &mut ctx);
        assert_eq!(result, Err(MpError::Unsupported));
    }

    // =========================================================================
    // Phase 2: analysis
    // =========================================================================

    #[test]
    fn test_run_analysis_fills_every_core_table() {
        let mut hal = MockHal::new(2);
        hal.set_execute_disable(true);
        let mut ctx = mock::build_context(2, MpConfig::default());
        mock::set_core(0);

        orchestrator::run_analysis(&hal, &mut ctx);

        for table in &ctx.reg_tables {
            assert_eq!(table.entries.len(), 2);
            assert!(!table.needs_reset());
            assert!(matches!(
                table.entries[0].kind,
                RegisterKind::Msr(IA32_MISC_ENABLE)
            ));
            assert!(matches!(table.entries[1].kind, RegisterKind::Msr(IA32_EFER)));
        }
    }

    // =========================================================================
    // Phase 3: setting
    // =========================================================================

    fn push_post_reset_msr(ctx: &mut MpContext) {
        for table in &mut ctx.reg_tables {
            table.append(
                RegisterTableEntry::new(RegisterKind::Msr(IA32_MISC_ENABLE), 22, 1, 1),
                false,
            );
        }
    }

    fn push_pre_reset_cr4(ctx: &mut MpContext) {
        for table in &mut ctx.reg_tables {
            table.append(
                RegisterTableEntry::new(RegisterKind::ControlRegister(4), 9, 1, 1),
                true,
            );
        }
    }

    /// Run `body` as the BSP with simulators for every AP of `ctx`.
    fn with_aps<R>(
        hal: &MockHal,
        ctx: &MpContext,
        body: impl FnOnce() -> R,
    ) -> R {
        let stop = AtomicBool::new(false);
        thread::scope(|scope| {
            for index in 1..ctx.cpu_count() {
                let stop = &stop;
                scope.spawn(move || mock::ap_simulator(hal, ctx, index, stop));
            }
            mock::set_core(0);
            let result = body();
            stop.store(true, Ordering::Release);
            result
        })
    }

    #[test]
    fn test_setting_phase_without_reset_entries() {
        let hal = MockHal::new(3);
        let mut ctx = mock::build_context(3, MpConfig::default());
        push_post_reset_msr(&mut ctx);

        let result = with_aps(&hal, &ctx, || orchestrator::setting_phase(&hal, &ctx));

        assert_eq!(result, Ok(()));
        assert_eq!(hal.cpu_only_resets(), 0);
        assert!(ctx.restore_after_init.load(Ordering::Acquire));
        for core in 0..3 {
            assert_eq!(hal.msr(core, IA32_MISC_ENABLE) & (1 << 22), 1 << 22);
        }
    }

    #[test]
    fn test_setting_phase_takes_reset_detour() {
        let hal = MockHal::new(3);
        let mut ctx = mock::build_context(3, MpConfig::default());
        push_pre_reset_cr4(&mut ctx);
        push_post_reset_msr(&mut ctx);

        let result = with_aps(&hal, &ctx, || orchestrator::setting_phase(&hal, &ctx));

        assert_eq!(result, Ok(()));
        assert_eq!(hal.cpu_only_resets(), 1);
        assert!(hal.virtual_wire_calls() > 0);
        for core in 0..3 {
            // The reset wiped CR4; the replay must have re-imposed it.
            assert_eq!(hal.cr(core, 4) & (1 << 9), 1 << 9);
            assert_eq!(hal.msr(core, IA32_MISC_ENABLE) & (1 << 22), 1 << 22);
        }
    }

    #[test]
    fn test_setting_phase_skips_disabled_cores() {
        let hal = MockHal::new(3);
        let mut ctx = mock::build_context(3, MpConfig::default());
        push_post_reset_msr(&mut ctx);
        ctx.cpus[2].set_state(crate::types::CpuState::Disabled);

        let result = with_aps(&hal, &ctx, || orchestrator::setting_phase(&hal, &ctx));

        assert_eq!(result, Ok(()));
        assert_eq!(hal.msr(2, IA32_MISC_ENABLE), 0);
        assert_eq!(hal.msr(1, IA32_MISC_ENABLE) & (1 << 22), 1 << 22);
    }

    // =========================================================================
    // Ready to boot
    // =========================================================================

    #[test]
    fn test_ready_to_boot_parks_aps_in_configured_mode() {
        let hal = MockHal::new(2);
        let mut config = MpConfig::default();
        config.loop_mode = ApLoopMode::RunLoop;
        let ctx = mock::build_context(2, config);

        orchestrator::ready_to_boot(&hal, &ctx);

        assert_eq!(
            ctx.exchange.info.loop_mode.load(Ordering::Acquire),
            ApLoopMode::RunLoop as u32
        );
    }
}
