//! APIC ID Bookkeeping Tests

#[cfg(test)]
mod tests {
    use crate::apic;
    use crate::error::MpError;
    use crate::mock::{self, MockHal};
    use crate::types::CpuRecord;

    fn records(ids: &[u32]) -> Vec<CpuRecord> {
        ids.iter().map(|&id| CpuRecord::new(id, 0)).collect()
    }

    // =========================================================================
    // Sorting
    // =========================================================================

    #[test]
    fn test_sort_orders_by_initial_apic_id() {
        let mut cpus = records(&[6, 0, 4, 2]);
        let bsp = apic::sort_by_apic_id(&mut cpus, 4);

        let order: Vec<u32> = cpus.iter().map(|cpu| cpu.initial_apic_id).collect();
        assert_eq!(order, [0, 2, 4, 6]);
        assert_eq!(bsp, 2);
    }

    #[test]
    fn test_sort_single_record() {
        let mut cpus = records(&[9]);
        assert_eq!(apic::sort_by_apic_id(&mut cpus, 9), 0);
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_check_rejects_too_many_cores() {
        let cpus = records(&[0, 2, 4, 6]);
        assert_eq!(apic::check_apic_ids(&cpus, 2), Err(MpError::Unsupported));
        assert_eq!(apic::check_apic_ids(&cpus, 4), Ok(()));
    }

    #[test]
    fn test_check_rejects_legacy_8bit_collision() {
        // 0x102 and 0x2 differ but collide in the low 8 bits.
        let cpus = records(&[0x2, 0x40, 0x102]);
        assert_eq!(apic::check_apic_ids(&cpus, 16), Err(MpError::Unsupported));
    }

    #[test]
    fn test_check_accepts_distinct_low_bytes() {
        let cpus = records(&[0x0, 0x1, 0x10, 0x11]);
        assert_eq!(apic::check_apic_ids(&cpus, 16), Ok(()));
    }

    // =========================================================================
    // Topology decode
    // =========================================================================

    #[test]
    fn test_extract_locations_decodes_bit_fields() {
        let mut hal = MockHal::new(1);
        hal.set_topology(1, 2);

        // APIC ID 0b1101: thread 1, core 0b10, package 1.
        let mut cpus = records(&[0b1101]);
        apic::extract_locations(&hal, &mut cpus);
        assert_eq!(cpus[0].thread, 1);
        assert_eq!(cpus[0].core, 0b10);
        assert_eq!(cpus[0].package, 1);
    }

    #[test]
    fn test_extract_locations_no_smt() {
        let mut hal = MockHal::new(1);
        hal.set_topology(0, 2);

        let mut cpus = records(&[0b101]);
        apic::extract_locations(&hal, &mut cpus);
        assert_eq!(cpus[0].thread, 0);
        assert_eq!(cpus[0].core, 0b01);
        assert_eq!(cpus[0].package, 1);
    }

    #[test]
    fn test_assign_package_bsp_marks_first_per_package() {
        let mut hal = MockHal::new(1);
        hal.set_topology(1, 1);

        // Sorted IDs 0..3 in package 0, 4..7 in package 1.
        let mut cpus = records(&[0, 1, 2, 4, 5]);
        apic::extract_locations(&hal, &mut cpus);
        apic::assign_package_bsp(&mut cpus);

        let flags: Vec<bool> = cpus.iter().map(|cpu| cpu.package_bsp).collect();
        assert_eq!(flags, [true, false, false, true, false]);
    }

    // =========================================================================
    // Identity
    // =========================================================================

    #[test]
    fn test_whoami_finds_calling_core() {
        let hal = MockHal::with_apic_ids(vec![4, 8]);
        let cpus = records(&[4, 8]);

        mock::set_core(1);
        assert_eq!(apic::whoami(&hal, &cpus), Ok(1));
        mock::set_core(0);
        assert_eq!(apic::whoami(&hal, &cpus), Ok(0));
    }

    #[test]
    fn test_whoami_unknown_core() {
        let hal = MockHal::with_apic_ids(vec![99]);
        let cpus = records(&[4, 8]);
        mock::set_core(0);
        assert_eq!(apic::whoami(&hal, &cpus), Err(MpError::NotFound));
    }

    #[test]
    fn test_mark_health() {
        let cpus = records(&[0]);
        assert!(cpus[0].is_healthy());
        apic::mark_health(&cpus[0], false);
        assert!(!cpus[0].is_healthy());
    }
}
