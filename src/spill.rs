//! Spill ranges (slot-sharing candidates) and live-range bundles
//! (coalescing groups).

use cranelift_entity::{entity_impl, PrimaryMap};

use crate::iface::ByteWidth;
use crate::interval::{IntervalPool, UseInterval};
use crate::live_range::{LiveRangeId, RangeArena};

/// An index into the pass's [`SpillRange`] pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpillRangeId(u32);
entity_impl!(SpillRangeId, "sr");

/// A candidate stack-slot class: the union of use intervals across every
/// sibling of one top-level range, used to test whether two top-level
/// ranges may coexist in the same stack slot.
pub struct SpillRange {
    /// The top-level range this spill range was built from. Once two
    /// spill ranges merge, only the surviving one's `owner` is meaningful;
    /// `merged_into` is set on the other.
    pub owner: LiveRangeId,
    /// Disjoint union of intervals covering every sibling's liveness.
    /// Kept sorted and merged eagerly so the merge-compatibility check is
    /// a single linear scan.
    pub intervals: Vec<UseInterval>,
    /// Byte width of the values sharing this slot; only spill ranges with
    /// equal width may merge.
    pub width: ByteWidth,
    /// Assigned stack-slot index, once committed by the operand assigner.
    pub slot: Option<u32>,
    /// If this spill range has been merged into another, that range's id.
    pub merged_into: Option<SpillRangeId>,
}

impl SpillRange {
    /// Build a spill range from the union of every sibling's intervals.
    pub fn from_range(owner: LiveRangeId, width: ByteWidth, arena: &RangeArena) -> Self {
        let mut intervals = Vec::new();
        for sib in arena.iter_siblings(owner) {
            for (_, iv) in arena.intervals.iter_chain(arena.get(sib).first_interval) {
                intervals.push(*iv);
            }
        }
        intervals.sort_by_key(|iv| iv.start);
        Self {
            owner,
            intervals,
            width,
            slot: None,
            merged_into: None,
        }
    }

    /// `true` if no interval in `self` overlaps any interval in `other`.
    /// Both interval lists must already be sorted by `start` (an invariant
    /// `from_range` and `merge` both maintain).
    pub fn disjoint_from(&self, other: &SpillRange) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.intervals.len() && j < other.intervals.len() {
            let a = &self.intervals[i];
            let b = &other.intervals[j];
            if a.start < b.end && b.start < a.end {
                return false;
            }
            if a.end <= b.start {
                i += 1;
            } else {
                j += 1;
            }
        }
        true
    }

    /// `true` if `self` and `other` may be merged: same byte width and
    /// disjoint total liveness: same byte width and no overlapping use
    /// interval.
    pub fn can_merge_with(&self, other: &SpillRange) -> bool {
        self.width == other.width && self.disjoint_from(other)
    }

    /// Merge `other`'s intervals into `self`, keeping the union sorted.
    pub fn absorb(&mut self, other: &SpillRange) {
        self.intervals.extend_from_slice(&other.intervals);
        self.intervals.sort_by_key(|iv| iv.start);
    }
}

/// Pool owning every [`SpillRange`] allocated during operand assignment.
#[derive(Default)]
pub struct SpillRangePool {
    ranges: PrimaryMap<SpillRangeId, SpillRange>,
}

impl SpillRangePool {
    /// A new, empty pool.
    pub fn new() -> Self {
        Self {
            ranges: PrimaryMap::new(),
        }
    }

    /// Allocate a new spill range.
    pub fn alloc(&mut self, range: SpillRange) -> SpillRangeId {
        self.ranges.push(range)
    }

    /// Borrow a spill range.
    pub fn get(&self, id: SpillRangeId) -> &SpillRange {
        &self.ranges[id]
    }

    /// Mutably borrow a spill range.
    pub fn get_mut(&mut self, id: SpillRangeId) -> &mut SpillRange {
        &mut self.ranges[id]
    }

    /// Resolve `id` through any chain of merges to the surviving range.
    pub fn resolve(&self, mut id: SpillRangeId) -> SpillRangeId {
        while let Some(next) = self.ranges[id].merged_into {
            id = next;
        }
        id
    }

    /// Try to merge `a` into `b` (or vice versa); returns the surviving id
    /// if the merge succeeded.
    pub fn try_merge(&mut self, a: SpillRangeId, b: SpillRangeId) -> Option<SpillRangeId> {
        let a = self.resolve(a);
        let b = self.resolve(b);
        if a == b {
            return Some(a);
        }
        if !self.ranges[a].can_merge_with(&self.ranges[b]) {
            return None;
        }
        let b_data = {
            let b_ref = &self.ranges[b];
            SpillRange {
                owner: b_ref.owner,
                intervals: b_ref.intervals.clone(),
                width: b_ref.width,
                slot: b_ref.slot,
                merged_into: None,
            }
        };
        self.ranges[a].absorb(&b_data);
        self.ranges[b].merged_into = Some(a);
        Some(a)
    }

    /// Iterate every spill range id that has not been merged away.
    pub fn surviving(&self) -> impl Iterator<Item = SpillRangeId> + '_ {
        self.ranges
            .keys()
            .filter(move |&id| self.ranges[id].merged_into.is_none())
    }
}

/// An index into the pass's [`LiveRangeBundle`] pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleId(u32);
entity_impl!(BundleId, "bd");

/// A coalescing group: a set of live ranges whose uses do not overlap in
/// time, created when a phi's inputs and output are union-compatible
/// once the non-overlap check passes.
pub struct LiveRangeBundle {
    /// Member top-level ranges, each contributing its own interval chain
    /// to the non-overlap check.
    pub members: Vec<LiveRangeId>,
    /// The register choice this bundle has settled on, propagated to
    /// every member so later members prefer it too.
    pub reg_hint: Option<u16>,
}

impl LiveRangeBundle {
    /// A bundle containing only `first`.
    pub fn singleton(first: LiveRangeId) -> Self {
        Self {
            members: vec![first],
            reg_hint: None,
        }
    }

    /// `true` if every interval of `candidate` is disjoint from every
    /// interval of every current member, across *all* siblings (phi
    /// coalescing looks at the whole chain, not just one split piece).
    pub fn compatible_with(&self, candidate: LiveRangeId, arena: &RangeArena) -> bool {
        for &member in &self.members {
            if !ranges_disjoint(member, candidate, arena) {
                return false;
            }
        }
        true
    }
}

fn ranges_disjoint(a: LiveRangeId, b: LiveRangeId, arena: &RangeArena) -> bool {
    for sib_a in arena.iter_siblings(a) {
        for (_, iv_a) in arena.intervals.iter_chain(arena.get(sib_a).first_interval) {
            for sib_b in arena.iter_siblings(b) {
                for (_, iv_b) in arena.intervals.iter_chain(arena.get(sib_b).first_interval) {
                    if iv_a.intersect(iv_b).is_valid() {
                        return false;
                    }
                }
            }
        }
    }
    true
}

/// Pool owning every [`LiveRangeBundle`] allocated by the bundle builder.
#[derive(Default)]
pub struct BundlePool {
    bundles: PrimaryMap<BundleId, LiveRangeBundle>,
}

impl BundlePool {
    /// A new, empty pool.
    pub fn new() -> Self {
        Self {
            bundles: PrimaryMap::new(),
        }
    }

    /// Allocate a new bundle.
    pub fn alloc(&mut self, bundle: LiveRangeBundle) -> BundleId {
        self.bundles.push(bundle)
    }

    /// Borrow a bundle.
    pub fn get(&self, id: BundleId) -> &LiveRangeBundle {
        &self.bundles[id]
    }

    /// Mutably borrow a bundle.
    pub fn get_mut(&mut self, id: BundleId) -> &mut LiveRangeBundle {
        &mut self.bundles[id]
    }
}
