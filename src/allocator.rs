//! Linear-scan allocation: the core loop that assigns a physical register
//! or a spill slot to every live range in one bank. Run once per
//! [`RegisterKind`], with a fresh [`LinearScanAllocator`] each time: no
//! state survives from one bank's pass to the next.

use log::{debug, trace};

use crate::data::AllocationData;
use crate::error::RegallocResult;
use crate::iface::{InstructionSequence, RegisterConfiguration, RegisterKind, TickCounter};
use crate::live_range::LiveRangeId;
use crate::position::LifetimePosition;

/// Register allocator tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct AllocatorOptions {
    /// How many predecessor blocks the phi-hint search in the range
    /// builder is allowed to look at. Not read by this module directly,
    /// but threaded through here since it is the one allocation-wide knob
    /// an embedder sets.
    pub hint_search_depth: usize,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            hint_search_depth: 2,
        }
    }
}

/// Run linear-scan allocation for every top-level range in `kind`'s bank.
pub fn allocate_bank(
    seq: &InstructionSequence,
    data: &mut AllocationData,
    reg_config: &dyn RegisterConfiguration,
    kind: RegisterKind,
    tick: &mut dyn TickCounter,
) -> RegallocResult<()> {
    let mut lsra = LinearScanAllocator::new(seq, reg_config, kind);
    lsra.seed(data);
    lsra.run(data, tick)
}

struct LinearScanAllocator<'a> {
    seq: &'a InstructionSequence,
    reg_config: &'a dyn RegisterConfiguration,
    kind: RegisterKind,
    num_registers: u16,
    unhandled: Vec<LiveRangeId>,
    active: Vec<LiveRangeId>,
    inactive: Vec<LiveRangeId>,
}

impl<'a> LinearScanAllocator<'a> {
    fn new(seq: &'a InstructionSequence, reg_config: &'a dyn RegisterConfiguration, kind: RegisterKind) -> Self {
        Self {
            seq,
            reg_config,
            kind,
            num_registers: reg_config.num_registers(kind),
            unhandled: Vec::new(),
            active: Vec::new(),
            inactive: Vec::new(),
        }
    }

    /// Populate the unhandled queue with every non-fixed top-level range in
    /// this bank, sorted so the soonest start pops last (`Vec::pop`).
    fn seed(&mut self, data: &AllocationData) {
        let mut ranges: Vec<LiveRangeId> = data
            .all_vreg_ranges()
            .filter(|&id| data.arena.get(id).kind == self.kind)
            .collect();
        ranges.sort_by(|&a, &b| {
            let pa = data.arena.get(b).start(&data.arena.intervals);
            let pb = data.arena.get(a).start(&data.arena.intervals);
            pa.cmp(&pb)
        });
        self.unhandled = ranges;
    }

    fn run(&mut self, data: &mut AllocationData, tick: &mut dyn TickCounter) -> RegallocResult<()> {
        let mut blocks_seen = 0u32;
        while let Some(current) = self.unhandled.pop() {
            if data.arena.get(current).assigned_register.is_some() || data.arena.get(current).spilled {
                continue;
            }
            let position = data.arena.get(current).start(&data.arena.intervals);
            self.forward_state_to(data, position);

            blocks_seen += 1;
            if blocks_seen % 64 == 0 && tick.should_abort() {
                return Err(crate::error::RegallocError::Aborted);
            }

            self.process_current_range(data, current);
        }
        Ok(())
    }

    /// Reclassify `active`/`inactive` for the new current `position`.
    fn forward_state_to(&mut self, data: &AllocationData, position: LifetimePosition) {
        let intervals = &data.arena.intervals;
        self.active.retain(|&id| data.arena.get(id).end(intervals) > position);
        let mut still_active = Vec::new();
        let mut newly_inactive = Vec::new();
        for &id in &self.active {
            if data.arena.get(id).covers(position, intervals) {
                still_active.push(id);
            } else {
                newly_inactive.push(id);
            }
        }
        self.active = still_active;
        self.inactive.extend(newly_inactive);

        let mut still_inactive = Vec::new();
        let mut reactivated = Vec::new();
        for &id in &self.inactive {
            let r = data.arena.get(id);
            if r.end(intervals) <= position {
                continue;
            }
            if r.covers(position, intervals) {
                reactivated.push(id);
            } else {
                still_inactive.push(id);
            }
        }
        self.inactive = still_inactive;
        self.active.extend(reactivated);
    }

    /// Assign `current` a register or a spill slot.
    fn process_current_range(&mut self, data: &mut AllocationData, current: LiveRangeId) {
        trace!(
            "processing range {:?} start={:?}",
            current,
            data.arena.get(current).start(&data.arena.intervals)
        );

        if let Some(reg) = self.try_allocate_preferred_reg(data, current) {
            self.commit(data, current, reg);
            return;
        }
        if let Some(reg) = self.try_allocate_free_reg(data, current) {
            self.commit(data, current, reg);
            return;
        }
        self.allocate_blocked_reg(data, current);
    }

    fn commit(&mut self, data: &mut AllocationData, current: LiveRangeId, reg: u16) {
        data.arena.get_mut(current).assigned_register = Some(reg);
        data.arena.get_mut(current).spilled = false;
        self.active.push(current);
    }

    /// Every position, within `current`'s span, at which each candidate
    /// register is free. Index is register code; value is the earliest
    /// conflicting position (or `current`'s own end, if never blocked).
    fn free_until_positions(&self, data: &AllocationData, current: LiveRangeId) -> Vec<LifetimePosition> {
        let current_end = data.arena.get(current).end(&data.arena.intervals);
        let mut free_until: Vec<LifetimePosition> = self
            .reg_config
            .allocatable_registers(self.kind)
            .iter()
            .map(|_| current_end)
            .collect();

        let fixed: Vec<LiveRangeId> = data.fixed_ranges_for(self.kind).collect();
        for (slot, &reg) in self.reg_config.allocatable_registers(self.kind).iter().enumerate() {
            for &other in &self.active {
                if data.arena.get(other).assigned_register == Some(reg) {
                    free_until[slot] = LifetimePosition::instr_start(0);
                }
            }
            for &other in fixed.iter().chain(self.inactive.iter()) {
                if data.arena.get(other).assigned_register == Some(reg) {
                    let p = data.arena.get(current).next_intersection(data.arena.get(other), &data.arena.intervals);
                    if p.is_valid() && p < free_until[slot] {
                        free_until[slot] = p;
                    }
                }
            }
        }
        free_until
    }

    /// Try `current`'s control-flow or coalescing hint, if it is free for
    /// `current`'s whole span.
    fn try_allocate_preferred_reg(&mut self, data: &AllocationData, current: LiveRangeId) -> Option<u16> {
        let r = data.arena.get(current);
        let hint = r
            .control_flow_hint
            .or_else(|| r.bundle.and_then(|b| data.bundles.get(b).reg_hint))
            .or_else(|| {
                let up = r.first_use_pos?;
                data.arena.use_positions.resolve_hint(data.arena.use_positions.get(up).hint, |rid| {
                    data.arena.get(rid).assigned_register
                })
            })?;
        let free_until = self.free_until_positions(data, current);
        let slot = self
            .reg_config
            .allocatable_registers(self.kind)
            .iter()
            .position(|&reg| reg == hint)?;
        if free_until[slot] >= data.arena.get(current).end(&data.arena.intervals) {
            Some(hint)
        } else {
            None
        }
    }

    /// Pick whichever allocatable register is free for longest. Returns
    /// `None` if none covers the whole range.
    fn try_allocate_free_reg(&mut self, data: &AllocationData, current: LiveRangeId) -> Option<u16> {
        let free_until = self.free_until_positions(data, current);
        let regs = self.reg_config.allocatable_registers(self.kind);
        let current_end = data.arena.get(current).end(&data.arena.intervals);

        let (best_slot, &best_until) = free_until
            .iter()
            .enumerate()
            .max_by_key(|&(_, &until)| until)?;
        if best_until < current_end {
            return None;
        }
        Some(regs[best_slot])
    }

    /// No register is free for the whole range. For each allocatable
    /// register, weigh how far away its current occupant's own next use is
    /// (`use_pos`) against when it becomes hard-blocked by a fixed or
    /// inactive holder (`block_pos`), then either evict the occupant whose
    /// own need is furthest away, or — if even that isn't far enough —
    /// spill `current` itself ahead of its own next hard requirement.
    fn allocate_blocked_reg(&mut self, data: &mut AllocationData, current: LiveRangeId) {
        let (use_pos, block_pos) = self.use_and_block_positions(data, current);
        let regs = self.reg_config.allocatable_registers(self.kind);
        let (best_slot, &best_use) = use_pos
            .iter()
            .enumerate()
            .max_by_key(|&(_, &p)| p)
            .expect("a register bank always has at least one allocatable register");
        let reg = regs[best_slot];

        let current_start = data.arena.get(current).start(&data.arena.intervals);
        let current_end = data.arena.get(current).end(&data.arena.intervals);
        let first_register_use = data
            .arena
            .get(current)
            .next_register_use(current_start, &data.arena.use_positions);

        let Some(required_pos) = first_register_use else {
            // `current` never strictly needs a register (only benefits from
            // one); no eviction is worth it when nothing frees up sooner.
            data.arena.get_mut(current).spilled = true;
            return;
        };
        if best_use < required_pos {
            // Every register's current occupant needs it back before
            // `current` even has a hard requirement of its own: spill
            // `current` up to that point instead of evicting anyone.
            self.split_and_spill(data, current, required_pos);
            return;
        }

        let block_until = block_pos[best_slot];
        if block_until < current_end {
            // `reg` becomes hard-blocked (by a fixed or inactive holder)
            // before `current` ends: split there and requeue the tail to
            // find its own register later.
            let pos = find_optimal_split_pos(self.seq, data, current, block_until);
            if pos > current_start && pos < current_end {
                let tail = data.arena.split(current, pos);
                self.unhandled.push(tail);
                self.resort_unhandled(data);
            }
        }

        self.evict_and_commit(data, current, reg);
    }

    /// `use_pos[r]`/`block_pos[r]` for each allocatable register `r`, as
    /// seen from `current`'s start: `use_pos` scores how costly evicting
    /// `r`'s current occupant would be (the occupant's own next register
    /// use, or its start if it can't be evicted at all), `block_pos` is the
    /// soonest position at which `r` becomes unavailable to `current` no
    /// matter what (from a fixed or inactive holder it will collide with
    /// later). Both default to [`LifetimePosition::INVALID`], which sorts
    /// as "never" and so reads as the best possible outcome for a register
    /// nothing currently touches.
    fn use_and_block_positions(
        &self,
        data: &AllocationData,
        current: LiveRangeId,
    ) -> (Vec<LifetimePosition>, Vec<LifetimePosition>) {
        let regs = self.reg_config.allocatable_registers(self.kind);
        let mut use_pos = vec![LifetimePosition::INVALID; regs.len()];
        let mut block_pos = vec![LifetimePosition::INVALID; regs.len()];
        let current_start = data.arena.get(current).start(&data.arena.intervals);

        for &other in &self.active {
            let Some(slot) = regs.iter().position(|&r| Some(r) == data.arena.get(other).assigned_register) else {
                continue;
            };
            if data.arena.get(other).is_fixed || self.is_in_deferred_only_tail(data, other, current_start) {
                // Either it can never be evicted, or its remaining liveness
                // only matters inside a deferred (cold) block: either way,
                // treat it as available right now rather than weighing a
                // real next-use distance.
                use_pos[slot] = current_start;
            } else {
                let next = data
                    .arena
                    .get(other)
                    .next_register_use(current_start, &data.arena.use_positions)
                    .unwrap_or(LifetimePosition::INVALID);
                if next < use_pos[slot] {
                    use_pos[slot] = next;
                }
            }
        }

        let fixed: Vec<LiveRangeId> = data.fixed_ranges_for(self.kind).collect();
        for &other in fixed.iter().chain(self.inactive.iter()) {
            let Some(slot) = regs.iter().position(|&r| Some(r) == data.arena.get(other).assigned_register) else {
                continue;
            };
            let ip = data
                .arena
                .get(current)
                .next_intersection(data.arena.get(other), &data.arena.intervals);
            if !ip.is_valid() {
                continue;
            }
            if ip < block_pos[slot] {
                block_pos[slot] = ip;
            }
            if data.arena.get(other).is_fixed && ip < use_pos[slot] {
                use_pos[slot] = ip;
            }
        }

        (use_pos, block_pos)
    }

    /// `true` if `other` is only still live because it's covering the
    /// inside of a deferred block: its own start lies in a deferred block
    /// and it has no required-register use outside of one. Evicting such a
    /// range costs nothing on the hot path.
    fn is_in_deferred_only_tail(&self, data: &AllocationData, other: LiveRangeId, from: LifetimePosition) -> bool {
        let start = data.arena.get(other).start(&data.arena.intervals);
        let block_idx = self.seq.block_containing(start.instruction_index()) as usize;
        if !self.seq.blocks[block_idx].deferred {
            return false;
        }
        data.arena
            .get(other)
            .next_register_use(from, &data.arena.use_positions)
            .map(|p| self.seq.blocks[self.seq.block_containing(p.instruction_index()) as usize].deferred)
            .unwrap_or(true)
    }

    /// Commit `current` to `reg`, evicting any active/inactive occupant of
    /// `reg` that intersects it: split the occupant at the intersection
    /// point and requeue the tail, or — if the intersection lands at or
    /// before the occupant's own start, meaning none of it survives —
    /// spill the occupant outright rather than leaving it to be silently
    /// dropped from tracking while still claiming the register.
    fn evict_and_commit(&mut self, data: &mut AllocationData, current: LiveRangeId, reg: u16) {
        let mut to_requeue = Vec::new();
        for group in [&mut self.active, &mut self.inactive] {
            group.retain(|&other| {
                if data.arena.get(other).assigned_register != Some(reg) {
                    return true;
                }
                let ip = data
                    .arena
                    .get(current)
                    .next_intersection(data.arena.get(other), &data.arena.intervals);
                if !ip.is_valid() {
                    return true;
                }
                let other_start = data.arena.get(other).start(&data.arena.intervals);
                if ip <= other_start {
                    data.arena.get_mut(other).assigned_register = None;
                    data.arena.get_mut(other).spilled = true;
                    false
                } else {
                    let tail = data.arena.split(other, ip);
                    to_requeue.push(tail);
                    true
                }
            });
        }
        self.unhandled.extend(to_requeue);
        self.resort_unhandled(data);

        self.commit(data, current, reg);
    }

    fn split_and_spill(&mut self, data: &mut AllocationData, current: LiveRangeId, split_pos: LifetimePosition) {
        let pos = find_optimal_split_pos(self.seq, data, current, split_pos);
        let start = data.arena.get(current).start(&data.arena.intervals);
        let end = data.arena.get(current).end(&data.arena.intervals);
        if pos <= start || pos >= end {
            debug!("range {:?} has no room to split before its next register use; spilling whole", current);
            data.arena.get_mut(current).spilled = true;
            return;
        }
        let tail = data.arena.split(current, pos);
        data.arena.get_mut(current).spilled = true;
        self.unhandled.push(tail);
        self.resort_unhandled(data);
    }

    /// Restore the descending-by-start order `run` relies on
    /// (`Vec::pop` yields the soonest start) after pushing new entries.
    fn resort_unhandled(&mut self, data: &AllocationData) {
        self.unhandled.sort_by(|&a, &b| {
            data.arena
                .get(b)
                .start(&data.arena.intervals)
                .cmp(&data.arena.get(a).start(&data.arena.intervals))
        });
    }
}

/// Walk backward from `pos` to the start of its enclosing loop header (if
/// any), preferring to split at a loop boundary over splitting inside the
/// loop body.
fn find_optimal_split_pos(
    seq: &InstructionSequence,
    data: &AllocationData,
    current: LiveRangeId,
    pos: LifetimePosition,
) -> LifetimePosition {
    let start = data.arena.get(current).start(&data.arena.intervals);
    if !pos.is_valid() || pos <= start {
        return pos;
    }
    let block_idx = seq.block_containing(pos.instruction_index()) as usize;
    let block = &seq.blocks[block_idx];
    let mut hoisted = None;
    let mut header_rpo = block.loop_header;
    while let Some(rpo) = header_rpo {
        let header = &seq.blocks[rpo as usize];
        let header_start = LifetimePosition::gap_start(header.first_instruction);
        if header_start <= start {
            break;
        }
        hoisted = Some(header_start);
        // Walk outward through the loop nest: a header's own `loop_header`
        // is itself unless it is nested in a further-enclosing loop.
        let outer = header.loop_header;
        if outer == Some(rpo) || outer.is_none() {
            break;
        }
        header_rpo = outer;
    }
    hoisted.unwrap_or_else(|| pos.to_gap_start())
}

/// Find the best position to insert a spill store for `current`, walking
/// backward from `spill_from` to the nearest position that is not inside a
/// deeper-nested loop than `spill_from` itself. Currently used only as a
/// documented seam for the assigner; the allocator spills eagerly at the
/// split point.
#[allow(dead_code)]
fn find_optimal_spilling_pos(
    seq: &InstructionSequence,
    spill_from: LifetimePosition,
) -> LifetimePosition {
    let block_idx = seq.block_containing(spill_from.instruction_index()) as usize;
    let mut idx = block_idx;
    while seq.blocks[idx].is_loop_header {
        if idx == 0 {
            break;
        }
        idx -= 1;
    }
    LifetimePosition::gap_start(seq.blocks[idx].first_instruction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::*;
    use cranelift_entity::EntityRef;

    struct TwoRegs;
    impl RegisterConfiguration for TwoRegs {
        fn num_registers(&self, _: RegisterKind) -> u16 {
            2
        }
        fn allocatable_registers(&self, _: RegisterKind) -> &[u16] {
            &[0, 1]
        }
        fn aliased_registers(&self, _: RegisterKind, _: u16) -> &[u16] {
            &[]
        }
        fn is_callee_saved(&self, _: RegisterKind, _: u16) -> bool {
            false
        }
    }

    fn vreg(n: u32) -> VReg {
        VReg::new(n as usize)
    }

    fn one_block_seq(num_insts: u32) -> InstructionSequence {
        InstructionSequence {
            value_kinds: vec![],
            is_reference: vec![],
            instructions: (0..num_insts).map(|_| Instruction::default()).collect(),
            blocks: vec![InstructionBlock {
                rpo_number: 0,
                first_instruction: 0,
                last_instruction: num_insts - 1,
                predecessors: vec![],
                successors: vec![],
                is_loop_header: false,
                loop_end: None,
                loop_header: None,
                deferred: false,
                phis: vec![],
            }],
        }
    }

    #[test]
    fn two_non_overlapping_ranges_fit_in_one_register() {
        let seq = one_block_seq(4);
        let mut data = AllocationData::new(1);
        let a = data.range_for_vreg(vreg(0), RegisterKind::General, ByteWidth::DoubleWord);
        let b = data.range_for_vreg(vreg(1), RegisterKind::General, ByteWidth::DoubleWord);
        let iv_a = data.arena.intervals.alloc(crate::interval::UseInterval::new(
            LifetimePosition::instr_start(0),
            LifetimePosition::instr_start(2),
        ));
        data.arena.get_mut(a).append_interval(iv_a, &data.arena.intervals);
        let iv_b = data.arena.intervals.alloc(crate::interval::UseInterval::new(
            LifetimePosition::instr_start(2),
            LifetimePosition::instr_start(4),
        ));
        data.arena.get_mut(b).append_interval(iv_b, &data.arena.intervals);

        let mut tick = crate::iface::NeverAbort;
        allocate_bank(&seq, &mut data, &TwoRegs, RegisterKind::General, &mut tick).unwrap();

        assert!(data.arena.get(a).assigned_register.is_some());
        assert!(data.arena.get(b).assigned_register.is_some());
        assert_eq!(
            data.arena.get(a).assigned_register,
            data.arena.get(b).assigned_register
        );
    }

    #[test]
    fn overlapping_ranges_get_distinct_registers() {
        let seq = one_block_seq(4);
        let mut data = AllocationData::new(1);
        let a = data.range_for_vreg(vreg(0), RegisterKind::General, ByteWidth::DoubleWord);
        let b = data.range_for_vreg(vreg(1), RegisterKind::General, ByteWidth::DoubleWord);
        let iv_a = data.arena.intervals.alloc(crate::interval::UseInterval::new(
            LifetimePosition::instr_start(0),
            LifetimePosition::instr_start(4),
        ));
        data.arena.get_mut(a).append_interval(iv_a, &data.arena.intervals);
        let iv_b = data.arena.intervals.alloc(crate::interval::UseInterval::new(
            LifetimePosition::instr_start(0),
            LifetimePosition::instr_start(4),
        ));
        data.arena.get_mut(b).append_interval(iv_b, &data.arena.intervals);

        let mut tick = crate::iface::NeverAbort;
        allocate_bank(&seq, &mut data, &TwoRegs, RegisterKind::General, &mut tick).unwrap();

        assert_ne!(
            data.arena.get(a).assigned_register,
            data.arena.get(b).assigned_register
        );
    }
}
