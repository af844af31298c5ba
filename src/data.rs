//! The process-wide container every stage of the pipeline mutates.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::iface::{OperandSlot, RegisterKind, VReg};
use crate::live_range::{LiveRangeId, RangeArena};
use crate::spill::{BundlePool, SpillRangePool};

/// A "same as input" output whose input is tagged but whose output is not
/// yet known to be tagged: resolved once the real operand for the output
/// is known, during reference-map population.
#[derive(Clone, Copy, Debug)]
pub struct DelayedReference {
    /// The instruction whose reference map gets the resolved operand.
    pub instruction: u32,
    /// The input slot whose final operand should be copied into the
    /// reference map once assignment has run.
    pub source: OperandSlot,
}

/// All of the state shared across the pipeline for one allocation pass.
/// Owned exclusively by the current pass; no locks are needed.
#[derive(Default)]
pub struct AllocationData {
    /// The zone owning every live range, interval, and use position.
    pub arena: RangeArena,
    /// Spill ranges, populated by the operand assigner.
    pub spill_ranges: SpillRangePool,
    /// Coalescing bundles, populated by the bundle builder.
    pub bundles: BundlePool,
    /// Top-level range for each virtual register seen so far.
    vreg_to_range: FxHashMap<VReg, LiveRangeId>,
    /// The one fixed range per physical register actually touched, keyed
    /// by `(bank, register code)`.
    fixed_ranges: FxHashMap<(BankKey, u16), LiveRangeId>,
    /// Live-in set for each block, by rpo number: which virtual registers
    /// are live entering the block. Computed by the live-range builder's
    /// backward pass.
    pub live_in: Vec<FxHashSet<VReg>>,
    /// References resolved lazily once the owning range's final operand
    /// is known: a "same as input" output whose input is tagged.
    pub delayed_references: Vec<DelayedReference>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct BankKey(u8);

impl From<RegisterKind> for BankKey {
    fn from(kind: RegisterKind) -> Self {
        match kind {
            RegisterKind::General => BankKey(0),
            RegisterKind::Float => BankKey(1),
        }
    }
}

impl AllocationData {
    /// A new, empty container sized for `num_blocks` blocks.
    pub fn new(num_blocks: usize) -> Self {
        Self {
            live_in: vec![FxHashSet::default(); num_blocks],
            ..Default::default()
        }
    }

    /// The top-level range for `vreg`, creating it on first request.
    pub fn range_for_vreg(
        &mut self,
        vreg: VReg,
        kind: RegisterKind,
        width: crate::iface::ByteWidth,
    ) -> LiveRangeId {
        if let Some(&id) = self.vreg_to_range.get(&vreg) {
            return id;
        }
        let id = self.arena.new_top_level(vreg, kind, width);
        self.vreg_to_range.insert(vreg, id);
        id
    }

    /// The top-level range for `vreg`, if it has already been created.
    pub fn existing_range_for_vreg(&self, vreg: VReg) -> Option<LiveRangeId> {
        self.vreg_to_range.get(&vreg).copied()
    }

    /// The fixed range for `(kind, register)`, creating it on first
    /// request: fixed ranges are created lazily, per physical register
    /// actually touched.
    pub fn fixed_range(&mut self, kind: RegisterKind, register: u16) -> LiveRangeId {
        let key = (BankKey::from(kind), register);
        if let Some(&id) = self.fixed_ranges.get(&key) {
            return id;
        }
        let id = self.arena.new_fixed(kind, register);
        self.fixed_ranges.insert(key, id);
        id
    }

    /// Every fixed range created so far for `kind`.
    pub fn fixed_ranges_for(&self, kind: RegisterKind) -> impl Iterator<Item = LiveRangeId> + '_ {
        let key_kind = BankKey::from(kind);
        self.fixed_ranges
            .iter()
            .filter(move |((k, _), _)| *k == key_kind)
            .map(|(_, &id)| id)
    }

    /// Every top-level range created so far.
    pub fn all_vreg_ranges(&self) -> impl Iterator<Item = LiveRangeId> + '_ {
        self.vreg_to_range.values().copied()
    }
}
