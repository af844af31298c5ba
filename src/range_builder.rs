//! Backward dataflow pass that creates intervals and use positions.

use log::debug;
use rustc_hash::FxHashSet;

use crate::allocator::AllocatorOptions;
use crate::data::{AllocationData, DelayedReference};
use crate::error::{RegallocError, RegallocResult};
use crate::iface::{
    InstructionSequence, Operand, OperandSlot, RegisterConfiguration, RegisterKind, UsePositionType,
    VReg,
};
use crate::interval::UseInterval;
use crate::live_range::LiveRangeId;
use crate::position::LifetimePosition;
use crate::use_pos::{UsePosition, UsePositionHint};

/// Run the live-range builder over the whole sequence, populating `data`.
///
/// Blocks are visited in reverse reverse-postorder (i.e. last rpo number
/// first); instructions within a block are visited in reverse.
pub fn build_live_ranges(
    seq: &InstructionSequence,
    data: &mut AllocationData,
    reg_config: &dyn RegisterConfiguration,
    options: &AllocatorOptions,
) -> RegallocResult<()> {
    data.live_in = vec![FxHashSet::default(); seq.blocks.len()];

    for block_idx in (0..seq.blocks.len()).rev() {
        debug!(
            "building live ranges for block {}",
            seq.blocks[block_idx].rpo_number
        );
        build_block(seq, data, reg_config, options, block_idx);
    }

    check_entry_block_definitions(seq, data)?;
    promote_constant_uses(data);
    Ok(())
}

fn block_bounds(seq: &InstructionSequence, block_idx: usize) -> (LifetimePosition, LifetimePosition) {
    let b = &seq.blocks[block_idx];
    (
        LifetimePosition::gap_start(b.first_instruction),
        LifetimePosition::gap_start(b.last_instruction + 1),
    )
}

fn build_block(
    seq: &InstructionSequence,
    data: &mut AllocationData,
    reg_config: &dyn RegisterConfiguration,
    options: &AllocatorOptions,
    block_idx: usize,
) {
    let block = &seq.blocks[block_idx];
    let (block_start, block_end) = block_bounds(seq, block_idx);

    // 1. Live-out set: union of live-in of all successors, plus the value
    // each successor phi draws from this block.
    let mut live: FxHashSet<VReg> = FxHashSet::default();
    for &succ_rpo in &block.successors {
        live.extend(data.live_in[succ_rpo as usize].iter().copied());
        let succ = &seq.blocks[succ_rpo as usize];
        if let Some(pred_pos) = succ.predecessors.iter().position(|&p| p == block.rpo_number) {
            for phi in &succ.phis {
                live.insert(phi.inputs[pred_pos]);
            }
        }
    }

    // 2. Initial intervals: every live-out value covers the whole block.
    for &vreg in &live {
        ensure_covers(seq, data, vreg, block_start, block_end);
    }

    // 3. Walk instructions in reverse.
    for inst_idx in (block.first_instruction..=block.last_instruction).rev() {
        build_instruction(seq, data, reg_config, block_idx, inst_idx, &mut live);
    }

    // 4. Phis: remove the output from `live`, add a define use-position at
    // block start, compute a predecessor-derived hint.
    for (phi_idx, phi) in block.phis.iter().enumerate() {
        live.remove(&phi.output);
        let (kind, width) = seq.kind_of(phi.output);
        let range = data.range_for_vreg(phi.output, kind, width);
        data.arena.top_level_data_mut(range).is_phi = true;
        if !block.is_loop_header {
            data.arena.top_level_data_mut(range).is_non_loop_phi = true;
        }
        ensure_covers(seq, data, phi.output, block_start, block_start.next_start());
        let hint = phi_hint(seq, data, block, phi_idx, options.hint_search_depth);
        if let Some(h) = hint {
            data.arena.get_mut(range).control_flow_hint = Some(h);
        }
    }

    // 5. Loop headers: extend every live value across the loop body, and
    // union `live` into every loop-body block's live-in.
    if block.is_loop_header {
        let loop_end = block.loop_end.expect("loop header must carry loop_end");
        let body_last = seq.blocks[loop_end as usize].last_instruction;
        let loop_tail_end = LifetimePosition::instr_end(body_last).next_full_start();
        for &vreg in &live {
            ensure_covers(seq, data, vreg, block_start, loop_tail_end);
        }
        for body_rpo in block.rpo_number..=loop_end {
            if body_rpo == block.rpo_number {
                continue;
            }
            data.live_in[body_rpo as usize].extend(live.iter().copied());
        }
    }

    data.live_in[block_idx] = live;
}

#[allow(clippy::too_many_arguments)]
fn build_instruction(
    seq: &InstructionSequence,
    data: &mut AllocationData,
    reg_config: &dyn RegisterConfiguration,
    block_idx: usize,
    inst_idx: u32,
    live: &mut FxHashSet<VReg>,
) {
    let (block_start, _) = block_bounds(seq, block_idx);
    let inst = &seq.instructions[inst_idx as usize];
    let def_pos = LifetimePosition::instr_start(inst_idx);
    let use_pos_point = LifetimePosition::instr_end(inst_idx);
    // Coverage extends one tick past the use itself: `UseInterval` is a
    // half-open `[start, end)` range, and a use must be `contains()`-true
    // at its own position.
    let use_coverage_end = use_pos_point.next_start();

    // Outputs: shorten/create the range so it starts here; drop from live.
    for (out_idx, &out) in inst.outputs.iter().enumerate() {
        if let Some(vreg) = out.vreg() {
            live.remove(&vreg);
            let (kind, width) = seq.kind_of(vreg);
            let range = data.range_for_vreg(vreg, kind, width);
            start_range_at(data, range, def_pos);
            let ty = output_use_type(out);
            add_use_position(
                data,
                range,
                def_pos,
                ty,
                true,
                OperandSlot::Output(inst_idx, out_idx as u32),
                UsePositionHint::None,
            );
        }
    }

    // Clobbers: a call zero-widths every caller-saved fixed range of both
    // banks at this instruction. Intervals are discovered latest-position
    // first (we walk backward), so this shares the same prepend-or-merge
    // logic as ordinary range extension rather than always appending.
    if inst.is_call {
        for kind in [RegisterKind::General, RegisterKind::Float] {
            for &reg in reg_config.allocatable_registers(kind) {
                if reg_config.is_callee_saved(kind, reg) {
                    continue;
                }
                let fixed = data.fixed_range(kind, reg);
                extend_range_to_cover(data, fixed, def_pos, LifetimePosition::instr_end(inst_idx));
            }
        }
    }

    // Inputs: extend to cover up to and including the use, add a use
    // position, mark live.
    for (in_idx, &input) in inst.inputs.iter().enumerate() {
        if let Some(vreg) = input.vreg() {
            let (kind, width) = seq.kind_of(vreg);
            let range = data.range_for_vreg(vreg, kind, width);
            extend_range_to_cover(data, range, block_start, use_coverage_end);
            let ty = input_use_type(input);
            let beneficial = !matches!(input, Operand::FixedRegister(..));
            add_use_position(
                data,
                range,
                use_pos_point,
                ty,
                beneficial,
                OperandSlot::Input(inst_idx, in_idx as u32),
                UsePositionHint::None,
            );
            if inst.tagged_inputs.contains(&(in_idx as u32)) && !inst.tagged_outputs.is_empty() {
                // "same as input" with a tagged input but untagged output
                // was already reconciled by the constraint builder; any
                // remaining mismatch becomes a delayed reference resolved
                // during reference-map population.
                data.delayed_references.push(DelayedReference {
                    instruction: inst_idx,
                    source: OperandSlot::Input(inst_idx, in_idx as u32),
                });
            }
            live.insert(vreg);
        }
    }

    // Temps: live only across this one instruction.
    for (temp_idx, &temp) in inst.temps.iter().enumerate() {
        if let Some(vreg) = temp.vreg() {
            let (kind, width) = seq.kind_of(vreg);
            let range = data.range_for_vreg(vreg, kind, width);
            extend_range_to_cover(data, range, def_pos, use_coverage_end);
            add_use_position(
                data,
                range,
                use_pos_point,
                UsePositionType::RequiresRegister,
                true,
                OperandSlot::Temp(inst_idx, temp_idx as u32),
                UsePositionHint::None,
            );
        }
    }

    // Gap moves: END then START. Both sides must be live across the gap,
    // and their use positions hint at one another.
    handle_gap(data, seq, inst_idx, true);
    handle_gap(data, seq, inst_idx, false);
}

fn handle_gap(data: &mut AllocationData, seq: &InstructionSequence, inst_idx: u32, end_of_gap: bool) {
    let inst = &seq.instructions[inst_idx as usize];
    let moves = if end_of_gap {
        &inst.end_gap_moves.moves
    } else {
        &inst.start_gap_moves.moves
    };
    let gap_pos = if end_of_gap {
        LifetimePosition::gap_end(inst_idx)
    } else {
        LifetimePosition::gap_start(inst_idx)
    };

    for (move_idx, &(from, to)) in moves.iter().enumerate() {
        let slot = OperandSlot::GapMove {
            instruction: inst_idx,
            end_of_gap,
            move_index: move_idx as u32,
        };

        // A fixed-input/output pin rewrites both sides of its gap move to
        // name the same virtual register: there is only one live range
        // here, needing exactly one use position pinned to the fixed
        // register, not two independent half-moves.
        if from.vreg() == to.vreg() && from.vreg().is_some() {
            let vreg = from.vreg().unwrap();
            let (kind, width) = seq.kind_of(vreg);
            let range = data.range_for_vreg(vreg, kind, width);
            extend_range_to_cover(data, range, gap_pos, gap_pos.next_start());
            let (ty, hint) = match (from, to) {
                (_, Operand::FixedRegister(_, reg)) | (Operand::FixedRegister(_, reg), _) => (
                    UsePositionType::RequiresRegister,
                    UsePositionHint::AlreadyAllocatedOperand(reg),
                ),
                _ => (UsePositionType::RegisterOrSlot, UsePositionHint::None),
            };
            add_use_position(data, range, gap_pos, ty, true, slot, hint);
            continue;
        }

        let mut dest_use = None;
        let mut dest_range = None;
        if let Some(vreg) = to.vreg() {
            let (kind, width) = seq.kind_of(vreg);
            let range = data.range_for_vreg(vreg, kind, width);
            extend_range_to_cover(data, range, gap_pos, gap_pos.next_start());
            dest_range = Some(range);
            dest_use = Some(add_use_position(
                data,
                range,
                gap_pos,
                UsePositionType::RegisterOrSlot,
                true,
                slot,
                UsePositionHint::None,
            ));
        }

        if let Some(vreg) = from.vreg() {
            let (kind, width) = seq.kind_of(vreg);
            let range = data.range_for_vreg(vreg, kind, width);
            extend_range_to_cover(data, range, gap_pos, gap_pos.next_start());
            // A move into a phi's output hints the phi's own register
            // directly, so the source prefers whatever the phi settles on
            // rather than chaining through an intermediate use position.
            let is_phi_dest = dest_range
                .map(|r| data.arena.top_level_data(r).is_phi)
                .unwrap_or(false);
            let hint = match (dest_use, dest_range, is_phi_dest, to) {
                (_, Some(r), true, _) => UsePositionHint::Phi(r),
                (Some(up), _, _, _) => UsePositionHint::AnotherUsePos(up),
                (None, _, _, Operand::FixedRegister(_, reg)) => {
                    UsePositionHint::AlreadyAllocatedOperand(reg)
                }
                _ => UsePositionHint::None,
            };
            add_use_position(data, range, gap_pos, UsePositionType::RegisterOrSlot, true, slot, hint);
        }
    }
}

fn output_use_type(op: Operand) -> UsePositionType {
    match op {
        Operand::FixedRegister(..) => UsePositionType::RequiresRegister,
        _ => UsePositionType::RegisterOrSlot,
    }
}

fn input_use_type(op: Operand) -> UsePositionType {
    match op {
        Operand::FixedRegister(..) => UsePositionType::RequiresRegister,
        Operand::Unallocated(_, ty) => ty,
        _ => UsePositionType::RegisterOrSlot,
    }
}

/// Ensure `range`'s interval chain covers `[start, end)`, creating the
/// first interval or prepending to cover an earlier start as needed. Used
/// for the live-out seeding step, which always works from the *front* of
/// what will eventually be the range (since we walk backward).
fn ensure_covers(
    seq: &InstructionSequence,
    data: &mut AllocationData,
    vreg: VReg,
    start: LifetimePosition,
    end: LifetimePosition,
) {
    let (kind, width) = seq.kind_of(vreg);
    let range = data.range_for_vreg(vreg, kind, width);
    extend_range_to_cover(data, range, start, end);
}

/// Extend `range` so its coverage includes `[start, end)`. Intervals are
/// only ever prepended during this backward pass (we discover earlier
/// coverage after later coverage), so this either grows the first
/// interval's start backward/merges, or inserts a brand new first
/// interval ahead of the current one.
fn extend_range_to_cover(
    data: &mut AllocationData,
    range: LiveRangeId,
    start: LifetimePosition,
    end: LifetimePosition,
) {
    debug_assert!(start < end, "cannot extend a range with an empty interval");
    let first = data.arena.get(range).first_interval;
    match first {
        None => {
            let iv = data.arena.intervals.alloc(UseInterval::new(start, end));
            let r = data.arena.get_mut(range);
            r.first_interval = Some(iv);
            r.last_interval = Some(iv);
        }
        Some(first_id) => {
            let (first_start, first_end) = {
                let iv = data.arena.intervals.get(first_id);
                (iv.start, iv.end)
            };
            if start >= first_start && end <= first_end {
                return; // already covered
            }
            if start <= first_end && end >= first_start {
                // Overlaps or touches: merge into the existing first
                // interval by widening it.
                let iv = data.arena.intervals.get_mut(first_id);
                iv.start = iv.start.min(start);
                iv.end = iv.end.max(end);
            } else {
                // Disjoint and strictly earlier: prepend a new interval.
                let iv = data
                    .arena
                    .intervals
                    .alloc(UseInterval::new(start, end));
                data.arena.intervals.get_mut(iv).next = Some(first_id);
                data.arena.get_mut(range).first_interval = Some(iv);
            }
        }
    }
}

/// Shorten `range`'s coverage to start exactly at `pos` (an output
/// definition): either it had no coverage yet (a dead-but-defined value)
/// or its first interval's start moves forward to `pos`.
fn start_range_at(data: &mut AllocationData, range: LiveRangeId, pos: LifetimePosition) {
    match data.arena.get(range).first_interval {
        None => {
            let iv = data
                .arena
                .intervals
                .alloc(UseInterval::new(pos, pos.next_start()));
            let r = data.arena.get_mut(range);
            r.first_interval = Some(iv);
            r.last_interval = Some(iv);
        }
        Some(first_id) => {
            let iv = data.arena.intervals.get_mut(first_id);
            if pos < iv.start {
                iv.start = pos;
            } else if pos >= iv.end {
                iv.end = pos.next_start();
                iv.start = pos;
            } else {
                iv.start = pos;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn add_use_position(
    data: &mut AllocationData,
    range: LiveRangeId,
    pos: LifetimePosition,
    ty: UsePositionType,
    register_beneficial: bool,
    operand: OperandSlot,
    hint: UsePositionHint,
) -> crate::use_pos::UsePosId {
    let id = data.arena.use_positions.alloc(UsePosition {
        pos,
        ty,
        register_beneficial,
        operand,
        hint,
        next: None,
    });
    // Insert in ascending order. Construction walks backward so the common
    // case is "insert at the front"; a short linear scan handles gap moves
    // that land a later position after an already-recorded earlier one.
    let head_pos = data.arena.get(range).first_use_pos;
    match head_pos {
        None => data.arena.get_mut(range).first_use_pos = Some(id),
        Some(head) => {
            if data.arena.use_positions.get(head).pos >= pos {
                data.arena.use_positions.get_mut(id).next = Some(head);
                data.arena.get_mut(range).first_use_pos = Some(id);
            } else {
                let mut cur = head;
                loop {
                    let next = data.arena.use_positions.get(cur).next;
                    match next {
                        Some(n) if data.arena.use_positions.get(n).pos < pos => cur = n,
                        _ => break,
                    }
                }
                let next = data.arena.use_positions.get(cur).next;
                data.arena.use_positions.get_mut(id).next = next;
                data.arena.use_positions.get_mut(cur).next = Some(id);
            }
        }
    }
    id
}

/// Bounded search over a phi's predecessors for a hint register, preferring
/// a non-deferred, already-allocated, empty-block predecessor. Deterministic
/// tie-break: lower predecessor rpo wins.
fn phi_hint(
    seq: &InstructionSequence,
    data: &AllocationData,
    block: &crate::iface::InstructionBlock,
    phi_idx: usize,
    max_hint_predecessors: usize,
) -> Option<u16> {
    let phi = &block.phis[phi_idx];
    let mut best: Option<(u32, u16)> = None;
    for (pred_pos, &pred_rpo) in block
        .predecessors
        .iter()
        .enumerate()
        .take(max_hint_predecessors)
    {
        let input_vreg = phi.inputs[pred_pos];
        let Some(range) = data.existing_range_for_vreg(input_vreg) else {
            continue;
        };
        let pred_block = &seq.blocks[pred_rpo as usize];
        let empty = pred_block.first_instruction == pred_block.last_instruction;
        if pred_block.deferred {
            continue;
        }
        if let Some(reg) = data.arena.get(range).assigned_register {
            let score_rpo = if empty { pred_rpo } else { pred_rpo + 1 };
            match best {
                Some((best_rpo, _)) if best_rpo <= score_rpo => {}
                _ => best = Some((score_rpo, reg)),
            }
        }
    }
    best.map(|(_, reg)| reg)
}

fn check_entry_block_definitions(
    seq: &InstructionSequence,
    data: &AllocationData,
) -> RegallocResult<()> {
    if seq.blocks.is_empty() {
        return Ok(());
    }
    if let Some(&vreg) = data.live_in[0].iter().next() {
        return Err(RegallocError::UseWithoutDefinition { vreg });
    }
    Ok(())
}

/// Post-pass: constant-backed ranges (`spill_operand` already set) have
/// their ambiguous register-or-slot-or-constant uses promoted to
/// `RequiresRegister`, since the constant itself already covers the slot
/// case — a use here only needs a register when it can't take the constant
/// directly. Non-constant spill-range allocation happens later, in the
/// operand assigner, once every sibling exists.
fn promote_constant_uses(data: &mut AllocationData) {
    let top_level_ids: Vec<LiveRangeId> = data.all_vreg_ranges().collect();
    for id in top_level_ids {
        let is_constant = data.arena.top_level_data(id).spill_operand.is_some();
        if !is_constant {
            continue;
        }
        let mut cur = data.arena.get(id).first_use_pos;
        while let Some(up) = cur {
            let pos = data.arena.use_positions.get(up);
            cur = pos.next;
            if matches!(pos.ty, UsePositionType::RegisterOrSlotOrConstant) {
                data.arena.use_positions.get_mut(up).ty = UsePositionType::RequiresRegister;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::*;
    use cranelift_entity::EntityRef;

    struct TestRegs;
    impl RegisterConfiguration for TestRegs {
        fn num_registers(&self, _: RegisterKind) -> u16 {
            1
        }
        fn allocatable_registers(&self, _: RegisterKind) -> &[u16] {
            &[0]
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

    #[test]
    fn straight_line_two_vregs_one_register() {
        // i0: def v0 ; i1: def v1 ; i2: use v0, use v1 ; i3: return (no uses)
        let mut seq = InstructionSequence {
            value_kinds: vec![(RegisterKind::General, ByteWidth::DoubleWord); 2],
            is_reference: vec![],
            instructions: vec![
                Instruction {
                    outputs: vec![Operand::Unallocated(vreg(0), UsePositionType::RegisterOrSlot)],
                    ..Default::default()
                },
                Instruction {
                    outputs: vec![Operand::Unallocated(vreg(1), UsePositionType::RegisterOrSlot)],
                    ..Default::default()
                },
                Instruction {
                    inputs: vec![
                        Operand::Unallocated(vreg(0), UsePositionType::RequiresRegister),
                        Operand::Unallocated(vreg(1), UsePositionType::RequiresRegister),
                    ],
                    ..Default::default()
                },
                Instruction::default(),
            ],
            blocks: vec![InstructionBlock {
                rpo_number: 0,
                first_instruction: 0,
                last_instruction: 3,
                predecessors: vec![],
                successors: vec![],
                is_loop_header: false,
                loop_end: None,
                loop_header: None,
                deferred: false,
                phis: vec![],
            }],
        };

        let mut data = AllocationData::new(1);
        build_live_ranges(&mut seq, &mut data, &TestRegs, &AllocatorOptions::default()).unwrap();

        let r0 = data.existing_range_for_vreg(vreg(0)).unwrap();
        let r1 = data.existing_range_for_vreg(vreg(1)).unwrap();
        assert_eq!(data.arena.get(r0).start(&data.arena.intervals), LifetimePosition::instr_start(0));
        assert_eq!(data.arena.get(r1).start(&data.arena.intervals), LifetimePosition::instr_start(1));
        // Both ranges are live across instruction 2's use.
        assert!(data.arena.get(r0).covers(LifetimePosition::instr_end(2), &data.arena.intervals));
        assert!(data.arena.get(r1).covers(LifetimePosition::instr_end(2), &data.arena.intervals));
    }
}
