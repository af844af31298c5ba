//! Live ranges: the allocation unit, and the top-level record a virtual
//! register's sibling chain hangs off of.

use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};

use crate::iface::{ByteWidth, Operand, RegisterKind, VReg};
use crate::interval::{IntervalId, IntervalPool, UseInterval};
use crate::position::LifetimePosition;
use crate::spill::SpillRangeId;
use crate::use_pos::{UsePosId, UsePosPool, UsePosition};

/// An index into a [`RangeArena`]. Also doubles as the "pointer back to the
/// top-level parent" stored on every sibling, and as the key into the
/// side table of [`TopLevelData`] for ranges where `relative_id == 0`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LiveRangeId(u32);
entity_impl!(LiveRangeId, "lr");

/// How a top-level range's value reaches memory, if it does at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillType {
    /// Never spilled.
    None,
    /// Spilled to a fixed memory operand (e.g. a constant); no
    /// [`SpillRangeId`] is ever allocated for it.
    SpillOperand,
    /// Spilled to a shared stack slot tracked by a [`SpillRangeId`].
    SpillRange(SpillRangeId),
    /// A spill range exists, but only to support reloads inside deferred
    /// blocks; no spill store is emitted in non-deferred code.
    DeferredSpillRange(SpillRangeId),
}

impl SpillType {
    /// The backing spill range, if any.
    pub fn spill_range(self) -> Option<SpillRangeId> {
        match self {
            SpillType::SpillRange(id) | SpillType::DeferredSpillRange(id) => Some(id),
            SpillType::None | SpillType::SpillOperand => None,
        }
    }

    /// `true` for either flavor of shared spill range.
    pub fn is_deferred(self) -> bool {
        matches!(self, SpillType::DeferredSpillRange(_))
    }
}

/// One live range: a chain of disjoint [`UseInterval`]s plus a chain of
/// ordered [`UsePosition`]s. Every sibling produced by a split is a
/// separate `LiveRange` sharing the same `top_level`.
pub struct LiveRange {
    /// This range's own id.
    pub id: LiveRangeId,
    /// Index within the sibling chain; `0` for the top-level range itself.
    pub relative_id: u32,
    /// Which register bank this range belongs to.
    pub kind: RegisterKind,
    /// Width of the value, for spill-slot sizing.
    pub width: ByteWidth,
    /// The top-level range heading this range's sibling chain (equals
    /// `self.id` for the top-level range itself).
    pub top_level: LiveRangeId,
    /// First interval in ascending order.
    pub first_interval: Option<IntervalId>,
    /// Last interval, kept for O(1) append during construction.
    pub last_interval: Option<IntervalId>,
    /// First use position in ascending order.
    pub first_use_pos: Option<UsePosId>,
    /// Assigned physical register, if any.
    pub assigned_register: Option<u16>,
    /// `true` once this range has been spilled (mutually exclusive with
    /// `assigned_register.is_some()`; both may be false while unhandled).
    pub spilled: bool,
    /// Control-flow hint carried across a block boundary so a reload lands
    /// in the same register the predecessor used.
    pub control_flow_hint: Option<u16>,
    /// The bundle this range has been coalesced into, if any.
    pub bundle: Option<crate::spill::BundleId>,
    /// The next sibling produced by splitting this range, if it has been
    /// split.
    pub next: Option<LiveRangeId>,
    /// `true` for one of the per-physical-register fixed ranges: never
    /// split, pre-assigned, and not tied to any virtual register.
    pub is_fixed: bool,
}

impl LiveRange {
    /// The start of this range's coverage: the start of its first interval.
    pub fn start(&self, intervals: &IntervalPool) -> LifetimePosition {
        intervals
            .get(self.first_interval.expect("range has no intervals"))
            .start
    }

    /// The end of this range's coverage: the end of its last interval.
    pub fn end(&self, intervals: &IntervalPool) -> LifetimePosition {
        intervals
            .get(self.last_interval.expect("range has no intervals"))
            .end
    }

    /// Does this range cover `p`? O(number of intervals); callers on the
    /// allocator's hot path instead track a cursor into the chain rather
    /// than calling this repeatedly from scratch.
    pub fn covers(&self, p: LifetimePosition, intervals: &IntervalPool) -> bool {
        intervals
            .iter_chain(self.first_interval)
            .any(|(_, iv)| iv.contains(p))
    }

    /// The first position at or after `from` where this range next
    /// intersects `other`, or `INVALID` if they never intersect again.
    pub fn next_intersection(
        &self,
        other: &LiveRange,
        intervals: &IntervalPool,
    ) -> LifetimePosition {
        for (_, a) in intervals.iter_chain(self.first_interval) {
            for (_, b) in intervals.iter_chain(other.first_interval) {
                if a.start >= b.end {
                    continue;
                }
                if b.start >= a.end {
                    break;
                }
                let p = a.intersect(b);
                if p.is_valid() {
                    return p;
                }
            }
        }
        LifetimePosition::INVALID
    }

    /// The first use position at or after `from` whose type is
    /// `RequiresRegister`, or `None`.
    pub fn next_register_use(
        &self,
        from: LifetimePosition,
        use_pos: &UsePosPool,
    ) -> Option<LifetimePosition> {
        use_pos
            .iter_chain(self.first_use_pos)
            .map(|(_, u)| u)
            .find(|u| u.pos >= from && u.requires_register())
            .map(|u| u.pos)
    }

    /// The first use position at or after `from` marked register-beneficial
    /// (a performance hint, not a hard constraint), or `None`.
    pub fn next_beneficial_use(
        &self,
        from: LifetimePosition,
        use_pos: &UsePosPool,
    ) -> Option<LifetimePosition> {
        use_pos
            .iter_chain(self.first_use_pos)
            .map(|(_, u)| u)
            .find(|u| u.pos >= from && u.register_beneficial)
            .map(|u| u.pos)
    }

    /// Append `interval` to the end of this range's chain. The caller
    /// guarantees `interval.start >= self.end()`, preserving the ordered,
    /// disjoint invariant.
    pub fn append_interval(&mut self, id: IntervalId, intervals: &IntervalPool) {
        if let Some(last) = self.last_interval {
            debug_assert!(
                intervals.get(last).end <= intervals.get(id).start,
                "intervals must be appended in ascending, non-overlapping order"
            );
        }
        if self.first_interval.is_none() {
            self.first_interval = Some(id);
        }
        self.last_interval = Some(id);
    }
}

/// Additional attributes kept only for the top-level range of each sibling
/// chain (`relative_id == 0`): the virtual register it names, its spill
/// disposition, phi-ness, and the splinter extracted for deferred-only use.
#[derive(Clone, Default)]
pub struct TopLevelData {
    /// The virtual register this chain represents. `None` for a fixed
    /// range, which names a physical register instead.
    pub vreg: Option<VReg>,
    /// How (and whether) this range reaches memory.
    pub spill_type: SpillType,
    /// `true` if this chain is a phi's output.
    pub is_phi: bool,
    /// `true` if this is a phi and its block is not a loop header (the
    /// common, simpler case for hint propagation).
    pub is_non_loop_phi: bool,
    /// A separate range extracted for deferred-only use under the
    /// classical splinter variant. Always `None` under the
    /// control-flow-aware variant this crate implements exclusively.
    pub splinter: Option<LiveRangeId>,
    /// The operand to rewrite uses to when this range is spilled and
    /// `spill_type` is `SpillOperand` (a fixed memory operand, e.g. a
    /// constant) rather than a shared stack slot.
    pub spill_operand: Option<Operand>,
}

/// The zone: owns every [`LiveRange`], its intervals, and its use
/// positions for one allocation pass. Siblings are appended when a range
/// is split; nothing is destroyed before the arena itself is dropped.
pub struct RangeArena {
    ranges: PrimaryMap<LiveRangeId, LiveRange>,
    top_level: SecondaryMap<LiveRangeId, Option<TopLevelData>>,
    /// Intervals for every range in the arena.
    pub intervals: IntervalPool,
    /// Use positions for every range in the arena.
    pub use_positions: UsePosPool,
}

impl Default for RangeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeArena {
    /// A new, empty arena.
    pub fn new() -> Self {
        Self {
            ranges: PrimaryMap::new(),
            top_level: SecondaryMap::new(),
            intervals: IntervalPool::new(),
            use_positions: UsePosPool::new(),
        }
    }

    /// Create a new top-level range naming `vreg`.
    pub fn new_top_level(&mut self, vreg: VReg, kind: RegisterKind, width: ByteWidth) -> LiveRangeId {
        let id = self.ranges.next_key();
        let range = LiveRange {
            id,
            relative_id: 0,
            kind,
            width,
            top_level: id,
            first_interval: None,
            last_interval: None,
            first_use_pos: None,
            assigned_register: None,
            spilled: false,
            control_flow_hint: None,
            bundle: None,
            next: None,
            is_fixed: false,
        };
        let pushed = self.ranges.push(range);
        debug_assert_eq!(pushed, id);
        self.top_level[id] = Some(TopLevelData {
            vreg: Some(vreg),
            ..Default::default()
        });
        id
    }

    /// Create one of the per-physical-register fixed ranges: never split,
    /// pre-assigned, and not tied to any virtual register.
    pub fn new_fixed(&mut self, kind: RegisterKind, register: u16) -> LiveRangeId {
        let id = self.ranges.next_key();
        let range = LiveRange {
            id,
            relative_id: 0,
            kind,
            width: ByteWidth::DoubleWord,
            top_level: id,
            first_interval: None,
            last_interval: None,
            first_use_pos: None,
            assigned_register: Some(register),
            spilled: false,
            control_flow_hint: None,
            bundle: None,
            next: None,
            is_fixed: true,
        };
        let pushed = self.ranges.push(range);
        debug_assert_eq!(pushed, id);
        self.top_level[id] = None;
        id
    }

    /// Borrow a range.
    pub fn get(&self, id: LiveRangeId) -> &LiveRange {
        &self.ranges[id]
    }

    /// Mutably borrow a range.
    pub fn get_mut(&mut self, id: LiveRangeId) -> &mut LiveRange {
        &mut self.ranges[id]
    }

    /// Borrow the top-level data for `id`'s top-level parent.
    pub fn top_level_data(&self, id: LiveRangeId) -> &TopLevelData {
        let top = self.ranges[id].top_level;
        self.top_level[top]
            .as_ref()
            .expect("id does not belong to a virtual-register chain")
    }

    /// Mutably borrow the top-level data for `id`'s top-level parent.
    pub fn top_level_data_mut(&mut self, id: LiveRangeId) -> &mut TopLevelData {
        let top = self.ranges[id].top_level;
        self.top_level[top]
            .as_mut()
            .expect("id does not belong to a virtual-register chain")
    }

    /// `SplitRangeAt(pos)`: split `id` into `[start, pos)` (kept as `id`)
    /// and a freshly allocated sibling `[pos, end)`, dividing the interval
    /// chain and the use-position chain at `pos` and linking the new range
    /// in as `id.next`. Returns the new sibling's id.
    ///
    /// `pos` must land on a gap or phase boundary so inserted moves have a
    /// home.
    pub fn split(&mut self, id: LiveRangeId, pos: LifetimePosition) -> LiveRangeId {
        debug_assert!(!self.ranges[id].is_fixed, "fixed ranges are never split");
        debug_assert!(
            pos > self.ranges[id].start(&self.intervals) && pos < self.ranges[id].end(&self.intervals),
            "split position must fall strictly inside the range"
        );

        // Walk the interval chain to find the interval straddling `pos`,
        // splitting it if `pos` falls in its interior, or simply cutting
        // the chain if `pos` lands exactly on a boundary between two
        // intervals.
        let mut prev: Option<IntervalId> = None;
        let mut cur = self.ranges[id].first_interval;
        let new_first;
        loop {
            let cur_id = cur.expect("split position past the end of the chain");
            let (start, end) = {
                let iv = self.intervals.get(cur_id);
                (iv.start, iv.end)
            };
            if pos <= start {
                // Boundary split: everything from `cur_id` on moves to the
                // new sibling untouched.
                new_first = Some(cur_id);
                if let Some(p) = prev {
                    self.intervals.get_mut(p).next = None;
                } else {
                    unreachable!("pos must be strictly inside the range");
                }
                break;
            } else if pos < end {
                let right = self.intervals.split_at(cur_id, pos);
                new_first = Some(right);
                break;
            } else {
                prev = cur;
                cur = self.intervals.get(cur_id).next;
            }
        }

        // Recompute `id`'s `last_interval` now that its chain may have been
        // truncated.
        {
            let mut last = self.ranges[id].first_interval;
            loop {
                let next = self.intervals.get(last.unwrap()).next;
                if next.is_none() {
                    break;
                }
                last = next;
            }
            self.ranges[id].last_interval = last;
        }

        // Split the use-position chain at the same point: everything at
        // or after `pos` moves to the new sibling.
        let mut up_prev: Option<UsePosId> = None;
        let mut up_cur = self.ranges[id].first_use_pos;
        let new_first_use_pos;
        loop {
            match up_cur {
                None => {
                    new_first_use_pos = None;
                    break;
                }
                Some(up_id) => {
                    if self.use_positions.get(up_id).pos >= pos {
                        new_first_use_pos = Some(up_id);
                        if let Some(p) = up_prev {
                            self.use_positions.get_mut(p).next = None;
                        }
                        break;
                    }
                    up_prev = up_cur;
                    up_cur = self.use_positions.get(up_id).next;
                }
            }
        }
        if new_first_use_pos.is_some() && up_prev.is_none() {
            self.ranges[id].first_use_pos = None;
        }

        let parent = &self.ranges[id];
        let new_id = self.ranges.next_key();
        let sibling = LiveRange {
            id: new_id,
            relative_id: parent.relative_id + 1,
            kind: parent.kind,
            width: parent.width,
            top_level: parent.top_level,
            first_interval: new_first,
            last_interval: {
                let mut last = new_first;
                while let Some(l) = last {
                    let next = self.intervals.get(l).next;
                    if next.is_none() {
                        break;
                    }
                    last = next;
                }
                last
            },
            first_use_pos: new_first_use_pos,
            assigned_register: None,
            spilled: false,
            control_flow_hint: None,
            bundle: None,
            next: parent.next,
            is_fixed: false,
        };
        let pushed = self.ranges.push(sibling);
        debug_assert_eq!(pushed, new_id);
        self.ranges[id].next = Some(new_id);
        new_id
    }

    /// `AttachToNext`: recombine `id` with its immediate sibling `next`
    /// when the split between them turned out to need no move. An
    /// optimization, not a correctness requirement — only valid if neither
    /// side has been assigned yet, or both were assigned the same operand.
    pub fn try_recombine(&mut self, id: LiveRangeId) -> bool {
        let Some(next_id) = self.ranges[id].next else {
            return false;
        };
        let same_register = self.ranges[id].assigned_register == self.ranges[next_id].assigned_register;
        let same_spill = self.ranges[id].spilled == self.ranges[next_id].spilled;
        if !same_register || !same_spill {
            return false;
        }
        // Splice the next range's tail chain directly onto `id`.
        if let Some(last) = self.ranges[id].last_interval {
            self.intervals.get_mut(last).next = self.ranges[next_id].first_interval;
        } else {
            self.ranges[id].first_interval = self.ranges[next_id].first_interval;
        }
        self.ranges[id].last_interval = self.ranges[next_id].last_interval;

        if let Some(last_up) = self.last_use_pos(id) {
            self.use_positions.get_mut(last_up).next = self.ranges[next_id].first_use_pos;
        } else {
            self.ranges[id].first_use_pos = self.ranges[next_id].first_use_pos;
        }
        self.ranges[id].next = self.ranges[next_id].next;
        true
    }

    fn last_use_pos(&self, id: LiveRangeId) -> Option<UsePosId> {
        let mut last = None;
        let mut cur = self.ranges[id].first_use_pos;
        while let Some(c) = cur {
            last = Some(c);
            cur = self.use_positions.get(c).next;
        }
        last
    }

    /// Iterate the sibling chain starting at `top_level`, in split order.
    pub fn iter_siblings(&self, top_level: LiveRangeId) -> SiblingIter<'_> {
        SiblingIter {
            arena: self,
            cur: Some(top_level),
        }
    }

    /// All top-level ids, i.e. ranges with `relative_id == 0` that carry
    /// [`TopLevelData`] (excludes fixed ranges).
    pub fn all_top_level_ids(&self) -> impl Iterator<Item = LiveRangeId> + '_ {
        self.ranges
            .keys()
            .filter(move |&id| self.top_level[id].is_some())
    }
}

/// Iterator over a sibling chain, in split order (oldest first).
pub struct SiblingIter<'a> {
    arena: &'a RangeArena,
    cur: Option<LiveRangeId>,
}

impl<'a> Iterator for SiblingIter<'a> {
    type Item = LiveRangeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        self.cur = self.arena.get(id).next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::UsePositionType;
    use crate::use_pos::UsePosition;
    use cranelift_entity::EntityRef;

    fn mk_vreg(n: u32) -> VReg {
        VReg::new(n as usize)
    }

    #[test]
    fn split_divides_interval_chain() {
        let mut arena = RangeArena::new();
        let id = arena.new_top_level(mk_vreg(0), RegisterKind::General, ByteWidth::DoubleWord);
        let iv = arena
            .intervals
            .alloc(UseInterval::new(LifetimePosition::instr_start(0), LifetimePosition::instr_start(10)));
        arena.get_mut(id).append_interval(iv, &arena.intervals);

        let sibling = arena.split(id, LifetimePosition::instr_start(5));
        assert_eq!(arena.get(id).end(&arena.intervals), LifetimePosition::instr_start(5));
        assert_eq!(arena.get(sibling).start(&arena.intervals), LifetimePosition::instr_start(5));
        assert_eq!(arena.get(id).next, Some(sibling));
    }

    #[test]
    fn split_moves_trailing_use_positions() {
        let mut arena = RangeArena::new();
        let id = arena.new_top_level(mk_vreg(0), RegisterKind::General, ByteWidth::DoubleWord);
        let iv = arena
            .intervals
            .alloc(UseInterval::new(LifetimePosition::instr_start(0), LifetimePosition::instr_start(10)));
        arena.get_mut(id).append_interval(iv, &arena.intervals);

        let up_early = arena.use_positions.alloc(UsePosition {
            pos: LifetimePosition::instr_start(1),
            ty: UsePositionType::RequiresRegister,
            register_beneficial: true,
            operand: crate::iface::OperandSlot::Input(1, 0),
            hint: crate::use_pos::UsePositionHint::None,
            next: None,
        });
        let up_late = arena.use_positions.alloc(UsePosition {
            pos: LifetimePosition::instr_start(7),
            ty: UsePositionType::RequiresRegister,
            register_beneficial: true,
            operand: crate::iface::OperandSlot::Input(7, 0),
            hint: crate::use_pos::UsePositionHint::None,
            next: None,
        });
        arena.use_positions.get_mut(up_early).next = Some(up_late);
        arena.get_mut(id).first_use_pos = Some(up_early);

        let sibling = arena.split(id, LifetimePosition::instr_start(5));
        assert_eq!(arena.get(id).first_use_pos, Some(up_early));
        assert_eq!(arena.use_positions.get(up_early).next, None);
        assert_eq!(arena.get(sibling).first_use_pos, Some(up_late));
    }
}
