//! SMM Remote Dispatch Tests
//!
//! These exercise the queue/kick half of remote dispatch against a
//! hand-built session; full sessions with live cores are covered by
//! the rendezvous tests.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use crate::config::MpConfig;
    use crate::error::MpError;
    use crate::hal::CpuHal;
    use crate::mock::MockHal;
    use crate::smm::session::{PendingOp, INVALID_APIC_ID};
    use crate::smm::{self, SmmSync};

    fn nop(_hal: &dyn CpuHal, _sync: &SmmSync, _argument: usize) {}

    fn session(count: usize) -> SmmSync {
        let sync = SmmSync::new((0..count as u32).collect(), &MpConfig::default());
        for cpu in &sync.cpus {
            cpu.present.store(true, Ordering::Release);
        }
        sync
    }

    // =========================================================================
    // smm_startup_this_ap
    // =========================================================================

    #[test]
    fn test_startup_validation() {
        let sync = session(3);

        assert_eq!(
            smm::smm_startup_this_ap(&sync, 0, nop, 9, 0),
            Err(MpError::InvalidParameter)
        );
        assert_eq!(
            smm::smm_startup_this_ap(&sync, 1, nop, 1, 0),
            Err(MpError::InvalidParameter)
        );

        sync.cpus[2].present.store(false, Ordering::Release);
        assert_eq!(
            smm::smm_startup_this_ap(&sync, 0, nop, 2, 0),
            Err(MpError::InvalidParameter)
        );
        sync.cpus[2].present.store(true, Ordering::Release);

        sync.cpus[2]
            .op
            .store(PendingOp::SwitchBsp as u8, Ordering::Release);
        assert_eq!(
            smm::smm_startup_this_ap(&sync, 0, nop, 2, 0),
            Err(MpError::InvalidParameter)
        );
    }

    #[test]
    fn test_startup_rejects_core_with_work_in_flight() {
        let sync = session(2);
        assert!(sync.cpus[1].busy.try_acquire());

        assert_eq!(
            smm::smm_startup_this_ap(&sync, 0, nop, 1, 0),
            Err(MpError::InvalidParameter)
        );
    }

    #[test]
    fn test_startup_queues_and_kicks() {
        let sync = session(2);

        smm::smm_startup_this_ap(&sync, 0, nop, 1, 7).unwrap();

        assert!(sync.cpus[1].busy.is_held());
        assert_eq!(sync.cpus[1].run.count(), 1);
        let slot = sync.cpus[1].slot.lock();
        assert!(slot.procedure.is_some());
        assert_eq!(slot.argument, 7);
    }

    #[test]
    fn test_blocking_startup_waits_for_completion() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        fn bump(_hal: &dyn CpuHal, _sync: &SmmSync, argument: usize) {
            RUNS.fetch_add(argument, Ordering::SeqCst);
        }

        let hal = MockHal::new(2);
        let sync = session(2);

        thread::scope(|scope| {
            // Play the target core's dispatch loop for one item.
            scope.spawn(|| {
                let cpu = &sync.cpus[1];
                cpu.run.wait();
                let (procedure, argument) = {
                    let slot = cpu.slot.lock();
                    (slot.procedure, slot.argument)
                };
                if let Some(procedure) = procedure {
                    procedure(&hal, &sync, argument);
                }
                cpu.slot.lock().procedure = None;
                cpu.busy.release();
            });

            smm::smm_blocking_startup_this_ap(&sync, 0, bump, 1, 3).unwrap();
        });

        assert_eq!(RUNS.load(Ordering::SeqCst), 3);
        assert!(!sync.cpus[1].busy.is_held());
        assert!(sync.cpus[1].slot.lock().procedure.is_none());
    }

    // =========================================================================
    // smm_switch_bsp
    // =========================================================================

    #[test]
    fn test_switch_bsp_validation() {
        let mut apic_ids = vec![0, 1, 2, 3];
        apic_ids[3] = INVALID_APIC_ID;
        let sync = SmmSync::new(apic_ids, &MpConfig::default());

        assert_eq!(smm::smm_switch_bsp(&sync, 1, 9), Err(MpError::InvalidParameter));
        assert_eq!(smm::smm_switch_bsp(&sync, 1, 3), Err(MpError::NotFound));
        assert_eq!(smm::smm_switch_bsp(&sync, 1, 1), Err(MpError::Unsupported));
        // Slot 0 already holds the BSP role.
        assert_eq!(smm::smm_switch_bsp(&sync, 1, 0), Err(MpError::Unsupported));

        sync.cpus[2]
            .op
            .store(PendingOp::SwitchBsp as u8, Ordering::Release);
        assert_eq!(smm::smm_switch_bsp(&sync, 1, 2), Err(MpError::Unsupported));
    }

    #[test]
    fn test_switch_bsp_flags_candidate_for_next_election() {
        let sync = SmmSync::new(vec![0, 1, 2], &MpConfig::default());

        smm::smm_switch_bsp(&sync, 0, 2).unwrap();

        assert_eq!(sync.cpus[2].pending_op(), PendingOp::SwitchBsp);
        assert!(sync.candidate[2].load(Ordering::Acquire));
        assert!(sync.switch_bsp_pending.load(Ordering::Acquire));
    }
}
