//! Analysis phase: turn per-core feature decisions into register table
//! entries.
//!
//! Features are registered onto a per-core list (platform code may
//! append its own before the phase runs); the walk below converts each
//! entry into the MSR/CR writes that realize it. Nothing here touches
//! hardware - that is the setting phase's job.

use alloc::vec::Vec;

use crate::hal::CpuHal;
use crate::regtable::{RegisterKind, RegisterTableEntry};
use crate::types::MpContext;

const IA32_MISC_ENABLE: u32 = 0x1A0;
const MISC_ENABLE_LIMIT_CPUID_MAXVAL_BIT: u8 = 22;
const IA32_EFER: u32 = 0xC000_0080;
const EFER_NXE_BIT: u8 = 11;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureId {
    /// Clamp the maximum reported CPUID leaf (legacy OS workaround).
    MaxCpuidValueLimit,
    /// No-execute page protection.
    ExecuteDisableBit,
}

#[derive(Clone, Copy, Debug)]
pub struct FeatureEntry {
    pub id: FeatureId,
    /// 1 = enable the feature on this core, 0 = disable.
    pub attribute: u32,
}

/// Per-core feature lists, indexed like `MpContext::cpus`.
pub struct FeatureLists {
    lists: Vec<Vec<FeatureEntry>>,
}

impl FeatureLists {
    pub fn new(cores: usize) -> Self {
        let mut lists = Vec::with_capacity(cores);
        for _ in 0..cores {
            lists.push(Vec::new());
        }
        Self { lists }
    }

    /// Registration API for platform code: queue a feature decision for
    /// one core ahead of the analysis walk.
    pub fn append(&mut self, index: usize, entry: FeatureEntry) {
        if let Some(list) = self.lists.get_mut(index) {
            list.push(entry);
        }
    }

    pub fn per_core(&self, index: usize) -> &[FeatureEntry] {
        self.lists.get(index).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Seed every core's list with the built-in feature decisions.
pub fn collect_features(hal: &dyn CpuHal, lists: &mut FeatureLists, cores: usize) {
    let xd = hal.supports_execute_disable();
    for index in 0..cores {
        // Never limit CPUID leaves; modern OSes need them all.
        lists.append(
            index,
            FeatureEntry {
                id: FeatureId::MaxCpuidValueLimit,
                attribute: 0,
            },
        );
        if xd {
            lists.append(
                index,
                FeatureEntry {
                    id: FeatureId::ExecuteDisableBit,
                    attribute: 1,
                },
            );
        }
    }
}

/// Walk every core's feature list and emit its register table entries.
pub fn analysis_phase(ctx: &mut MpContext, lists: &FeatureLists) {
    for index in 0..ctx.cpus.len() {
        for feature in lists.per_core(index) {
            let entry = match feature.id {
                FeatureId::MaxCpuidValueLimit => RegisterTableEntry::new(
                    RegisterKind::Msr(IA32_MISC_ENABLE),
                    MISC_ENABLE_LIMIT_CPUID_MAXVAL_BIT,
                    1,
                    feature.attribute as u64,
                ),
                FeatureId::ExecuteDisableBit => RegisterTableEntry::new(
                    RegisterKind::Msr(IA32_EFER),
                    EFER_NXE_BIT,
                    1,
                    feature.attribute as u64,
                ),
            };
            ctx.reg_tables[index].append(entry, false);
        }
    }

    crate::kdebug!(
        "MP: analysis complete, {} cores tabled",
        ctx.cpus.len()
    );
}
