//! Commits every live range's final home — a register or a shared stack
//! slot — and rewrites every use position to its final operand.

use crate::data::AllocationData;
use crate::error::RegallocResult;
use crate::iface::{Frame, Instruction, InstructionSequence, Operand, OperandSlot, VReg};
use crate::live_range::LiveRangeId;
use crate::spill::{SpillRange, SpillRangeId};

/// Run the operand assigner over `seq`, using the register/spill decisions
/// already recorded in `data` by the allocator.
pub fn assign_operands(
    seq: &mut InstructionSequence,
    data: &mut AllocationData,
    frame: &mut dyn Frame,
) -> RegallocResult<()> {
    resolve_spill_storage(seq, data, frame);
    rewrite_use_positions(seq, data);
    Ok(())
}

/// For every top-level range with at least one spilled sibling, build or
/// merge a [`SpillRange`]; then hand out a stack slot to every spill range
/// that doesn't have one yet.
fn resolve_spill_storage(seq: &InstructionSequence, data: &mut AllocationData, frame: &mut dyn Frame) {
    let top_ids: Vec<LiveRangeId> = data.arena.all_top_level_ids().collect();
    for id in top_ids {
        let any_spilled = data.arena.iter_siblings(id).any(|sib| data.arena.get(sib).spilled);
        if !any_spilled {
            continue;
        }

        if data.arena.top_level_data(id).spill_operand.is_some() {
            // Backed by a fixed memory operand (e.g. a constant); no stack
            // slot of our own to allocate.
            continue;
        }
        if data.arena.top_level_data(id).spill_type.spill_range().is_some() {
            continue;
        }

        let width = data.arena.get(id).width;
        let candidate = SpillRange::from_range(id, width, &data.arena);
        let surviving: Vec<SpillRangeId> = data.spill_ranges.surviving().collect();
        let mut merged_into = None;
        for existing in surviving {
            if data.spill_ranges.get(existing).width != width {
                continue;
            }
            if data.spill_ranges.get(existing).can_merge_with(&candidate) {
                data.spill_ranges.get_mut(existing).absorb(&candidate);
                merged_into = Some(existing);
                break;
            }
        }
        let spill_id = merged_into.unwrap_or_else(|| data.spill_ranges.alloc(candidate));

        let deferred = spills_only_in_deferred_blocks(seq, &data.arena, id);
        let spill_type = if deferred {
            crate::live_range::SpillType::DeferredSpillRange(spill_id)
        } else {
            crate::live_range::SpillType::SpillRange(spill_id)
        };
        data.arena.top_level_data_mut(id).spill_type = spill_type;
    }

    let surviving: Vec<SpillRangeId> = data.spill_ranges.surviving().collect();
    for sr in surviving {
        if data.spill_ranges.get(sr).slot.is_none() {
            let width = data.spill_ranges.get(sr).width;
            let slot = frame.allocate_spill_slot(width);
            data.spill_ranges.get_mut(sr).slot = Some(slot);
        }
    }
}

/// `true` if every spilled sibling of `top`'s chain only lives inside
/// blocks marked deferred: a store for it is never needed on the hot path,
/// only to support a reload if control actually enters the cold block.
fn spills_only_in_deferred_blocks(
    seq: &InstructionSequence,
    arena: &crate::live_range::RangeArena,
    top: LiveRangeId,
) -> bool {
    let last_instr = seq.num_instructions().saturating_sub(1);
    for sib in arena.iter_siblings(top) {
        if !arena.get(sib).spilled {
            continue;
        }
        for (_, iv) in arena.intervals.iter_chain(arena.get(sib).first_interval) {
            let instr = iv.start.instruction_index().min(last_instr);
            let block_idx = seq.block_containing(instr) as usize;
            if !seq.blocks[block_idx].deferred {
                return false;
            }
        }
    }
    true
}

/// Walk every sibling of every top-level range and rewrite each of its use
/// positions to the range's final operand.
fn rewrite_use_positions(seq: &mut InstructionSequence, data: &AllocationData) {
    let top_ids: Vec<LiveRangeId> = data.arena.all_top_level_ids().collect();
    for top in top_ids {
        let vreg = data
            .arena
            .top_level_data(top)
            .vreg
            .expect("top-level range from all_top_level_ids always names a vreg");
        for sib in data.arena.iter_siblings(top) {
            rewrite_range(seq, data, sib, top, vreg);
        }
    }
}

fn rewrite_range(
    seq: &mut InstructionSequence,
    data: &AllocationData,
    range: LiveRangeId,
    top: LiveRangeId,
    vreg: VReg,
) {
    let r = data.arena.get(range);
    let width = r.width;
    let assigned_register = r.assigned_register;
    let spilled = r.spilled;

    let mut cur = r.first_use_pos;
    while let Some(up_id) = cur {
        let up = data.arena.use_positions.get(up_id);
        cur = up.next;
        let slot = up.operand;
        let ty = up.ty;

        let operand = if let Some(reg) = assigned_register {
            Operand::Register(width, reg)
        } else {
            debug_assert!(spilled, "range {:?} neither assigned a register nor spilled", range);
            final_spill_operand(data, top, width, ty)
        };
        write_operand(seq, slot, vreg, operand);
    }
}

fn final_spill_operand(
    data: &AllocationData,
    top: LiveRangeId,
    width: crate::iface::ByteWidth,
    ty: crate::iface::UsePositionType,
) -> Operand {
    let top_data = data.arena.top_level_data(top);
    if ty.accepts_constant() {
        if let Some(op) = top_data.spill_operand {
            return op;
        }
    }
    let spill_id = top_data
        .spill_type
        .spill_range()
        .expect("a spilled range always has a spill range or a spill operand by assignment time");
    let resolved = data.spill_ranges.resolve(spill_id);
    let slot = data
        .spill_ranges
        .get(resolved)
        .slot
        .expect("every surviving spill range has a slot by the time use positions are rewritten");
    Operand::StackSlot(width, slot)
}

fn write_operand(seq: &mut InstructionSequence, slot: OperandSlot, vreg: VReg, operand: Operand) {
    match slot {
        OperandSlot::Input(inst, idx) => instruction(seq, inst).inputs[idx as usize] = operand,
        OperandSlot::Output(inst, idx) => instruction(seq, inst).outputs[idx as usize] = operand,
        OperandSlot::Temp(inst, idx) => instruction(seq, inst).temps[idx as usize] = operand,
        OperandSlot::GapMove {
            instruction: inst,
            end_of_gap,
            move_index,
        } => {
            let moves = if end_of_gap {
                &mut instruction(seq, inst).end_gap_moves.moves
            } else {
                &mut instruction(seq, inst).start_gap_moves.moves
            };
            let (from, to) = &mut moves[move_index as usize];
            // Both use positions recorded for a two-sided move share the
            // same `OperandSlot`; which half to overwrite is recovered from
            // which side still names this use position's own vreg. A
            // fixed-pin move names the same vreg on both sides and writes
            // the final operand to both.
            if from.vreg() == Some(vreg) {
                *from = operand;
            }
            if to.vreg() == Some(vreg) {
                *to = operand;
            }
        }
    }
}

fn instruction(seq: &mut InstructionSequence, idx: u32) -> &mut Instruction {
    &mut seq.instructions[idx as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::*;
    use cranelift_entity::EntityRef;

    struct OneSlotFrame {
        next: u32,
    }
    impl Frame for OneSlotFrame {
        fn allocate_spill_slot(&mut self, _width: ByteWidth) -> u32 {
            let slot = self.next;
            self.next += 1;
            slot
        }
        fn mark_needs_frame(&mut self, _block_rpo: u32) {}
    }

    fn vreg(n: u32) -> VReg {
        VReg::new(n as usize)
    }

    #[test]
    fn spilled_range_rewrites_to_stack_slot() {
        let mut seq = InstructionSequence {
            value_kinds: vec![(RegisterKind::General, ByteWidth::DoubleWord)],
            is_reference: vec![],
            instructions: vec![Instruction {
                inputs: vec![Operand::Unallocated(vreg(0), UsePositionType::RegisterOrSlot)],
                ..Default::default()
            }],
            blocks: vec![InstructionBlock {
                rpo_number: 0,
                first_instruction: 0,
                last_instruction: 0,
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
        let range = data.range_for_vreg(vreg(0), RegisterKind::General, ByteWidth::DoubleWord);
        let iv = data.arena.intervals.alloc(crate::interval::UseInterval::new(
            crate::position::LifetimePosition::instr_start(0),
            crate::position::LifetimePosition::instr_end(0).next_start(),
        ));
        data.arena.get_mut(range).append_interval(iv, &data.arena.intervals);
        data.arena.get_mut(range).spilled = true;
        let up = data.arena.use_positions.alloc(crate::use_pos::UsePosition {
            pos: crate::position::LifetimePosition::instr_end(0),
            ty: UsePositionType::RegisterOrSlot,
            register_beneficial: true,
            operand: OperandSlot::Input(0, 0),
            hint: crate::use_pos::UsePositionHint::None,
            next: None,
        });
        data.arena.get_mut(range).first_use_pos = Some(up);

        let mut frame = OneSlotFrame { next: 0 };
        assign_operands(&mut seq, &mut data, &mut frame).unwrap();

        assert_eq!(seq.instructions[0].inputs[0], Operand::StackSlot(ByteWidth::DoubleWord, 0));
    }
}
