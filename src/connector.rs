//! Stitches the allocation back into a single coherent program: moves
//! between split siblings of the same value, and moves across control-flow
//! edges where two blocks disagree about a live value's location.

use crate::data::AllocationData;
use crate::iface::{Frame, InstructionSequence, Operand};
use crate::live_range::LiveRangeId;
use crate::position::LifetimePosition;

/// Run the connector: sibling moves, control-flow-edge moves, and deferred-
/// block frame commitment, in that order.
pub fn connect(seq: &mut InstructionSequence, data: &AllocationData, frame: &mut dyn Frame) {
    connect_ranges(seq, data);
    resolve_control_flow(seq, data);
    commit_deferred_spill_frames(seq, data, frame);
}

/// The operand a range's value is committed to: its register if one was
/// assigned, otherwise its owning top-level range's spill location.
fn committed_operand(data: &AllocationData, range: LiveRangeId) -> Operand {
    let r = data.arena.get(range);
    if let Some(reg) = r.assigned_register {
        return Operand::Register(r.width, reg);
    }
    debug_assert!(r.spilled, "range {:?} neither assigned a register nor spilled", range);
    let top_data = data.arena.top_level_data(r.top_level);
    if let Some(op) = top_data.spill_operand {
        return op;
    }
    let spill_id = top_data
        .spill_type
        .spill_range()
        .expect("a spilled range always has a spill range or a spill operand by connect time");
    let resolved = data.spill_ranges.resolve(spill_id);
    let slot = data
        .spill_ranges
        .get(resolved)
        .slot
        .expect("every surviving spill range has a slot by connect time");
    Operand::StackSlot(r.width, slot)
}

/// For every pair of adjacent siblings left over after allocation (i.e. not
/// recombined), insert a move at the split point if the two actually
/// landed in different places.
fn connect_ranges(seq: &mut InstructionSequence, data: &AllocationData) {
    let tops: Vec<LiveRangeId> = data.arena.all_top_level_ids().collect();
    for top in tops {
        let mut cur = top;
        while let Some(next) = data.arena.get(cur).next {
            let from_op = committed_operand(data, cur);
            let to_op = committed_operand(data, next);
            if from_op != to_op {
                let pos = data.arena.get(next).start(&data.arena.intervals);
                debug_assert!(pos.is_gap(), "split positions always land on a gap");
                let end_of_gap = matches!(pos.phase(), crate::position::Phase::GapEnd);
                insert_move(seq, pos.instruction_index(), end_of_gap, from_op, to_op);
            }
            cur = next;
        }
    }
}

/// For every block boundary, reconcile where each value crossing it lives
/// on each side: live-through values keep their vreg, phi inputs resolve to
/// whichever vreg the predecessor contributed.
fn resolve_control_flow(seq: &mut InstructionSequence, data: &AllocationData) {
    for succ_rpo in 0..seq.blocks.len() as u32 {
        let succ_first = seq.blocks[succ_rpo as usize].first_instruction;
        let succ_entry = LifetimePosition::instr_start(succ_first);
        let predecessors = seq.blocks[succ_rpo as usize].predecessors.clone();

        for (pred_idx, &pred_rpo) in predecessors.iter().enumerate() {
            let pred_last = seq.blocks[pred_rpo as usize].last_instruction;
            let pred_exit = LifetimePosition::instr_end(pred_last);

            let live_through: Vec<_> = data.live_in[succ_rpo as usize].iter().copied().collect();
            for vreg in live_through {
                let Some(top) = data.existing_range_for_vreg(vreg) else {
                    continue;
                };
                let from = sibling_covering(data, top, pred_exit);
                let to = sibling_covering(data, top, succ_entry);
                let from_op = committed_operand(data, from);
                let to_op = committed_operand(data, to);
                if from_op != to_op {
                    place_edge_move(
                        seq,
                        pred_rpo,
                        pred_last,
                        succ_rpo,
                        succ_first,
                        from_op,
                        to_op,
                    );
                }
            }

            let phis = seq.blocks[succ_rpo as usize].phis.clone();
            for phi in &phis {
                let input_vreg = phi.inputs[pred_idx];
                let Some(input_top) = data.existing_range_for_vreg(input_vreg) else {
                    continue;
                };
                let Some(output_top) = data.existing_range_for_vreg(phi.output) else {
                    continue;
                };
                let from = sibling_covering(data, input_top, pred_exit);
                let to = sibling_covering(data, output_top, succ_entry);
                let from_op = committed_operand(data, from);
                let to_op = committed_operand(data, to);
                if from_op != to_op {
                    place_edge_move(
                        seq,
                        pred_rpo,
                        pred_last,
                        succ_rpo,
                        succ_first,
                        from_op,
                        to_op,
                    );
                }
            }
        }
    }
}

/// Choose where an edge move belongs: the predecessor's exit if it is the
/// only way out (so the move fires only along this edge), otherwise the
/// successor's entry if it is the only way in. A block with more than one
/// predecessor *and* more than one successor on the same edge is a critical
/// edge, which the frontend is expected to have split before handing the
/// sequence to this crate.
fn place_edge_move(
    seq: &mut InstructionSequence,
    pred_rpo: u32,
    pred_last: u32,
    succ_rpo: u32,
    succ_first: u32,
    from: Operand,
    to: Operand,
) {
    if seq.blocks[succ_rpo as usize].predecessors.len() == 1 {
        insert_move(seq, succ_first, false, from, to);
    } else if seq.blocks[pred_rpo as usize].successors.len() == 1 {
        insert_move(seq, pred_last, true, from, to);
    } else {
        debug_assert!(false, "critical edge from block {pred_rpo} to block {succ_rpo} was not split upstream");
        insert_move(seq, succ_first, false, from, to);
    }
}

fn sibling_covering(data: &AllocationData, top: LiveRangeId, pos: LifetimePosition) -> LiveRangeId {
    data.arena
        .iter_siblings(top)
        .find(|&sib| data.arena.get(sib).covers(pos, &data.arena.intervals))
        .expect("a value live across a boundary is covered by one of its siblings there")
}

/// Append `(from, to)` to the named gap's parallel move, replacing any
/// existing move already writing `to` (a later-discovered mapping for the
/// same destination supersedes an earlier one; two different sources never
/// legitimately target the same place in one parallel move).
fn insert_move(seq: &mut InstructionSequence, instruction: u32, end_of_gap: bool, from: Operand, to: Operand) {
    let moves = if end_of_gap {
        &mut seq.instructions[instruction as usize].end_gap_moves.moves
    } else {
        &mut seq.instructions[instruction as usize].start_gap_moves.moves
    };
    if let Some(existing) = moves.iter_mut().find(|(_, existing_to)| *existing_to == to) {
        existing.0 = from;
    } else {
        moves.push((from, to));
    }
}

/// Tell the frame manager that a deferred block holding a live spilled
/// value needs a real stack frame, even though deferred blocks are
/// otherwise allowed to stay frameless.
fn commit_deferred_spill_frames(seq: &InstructionSequence, data: &AllocationData, frame: &mut dyn Frame) {
    let last_instr = seq.num_instructions().saturating_sub(1);
    let tops: Vec<LiveRangeId> = data.arena.all_top_level_ids().collect();
    for top in tops {
        if !data.arena.top_level_data(top).spill_type.is_deferred() {
            continue;
        }
        for sib in data.arena.iter_siblings(top) {
            if !data.arena.get(sib).spilled {
                continue;
            }
            for (_, iv) in data.arena.intervals.iter_chain(data.arena.get(sib).first_interval) {
                let instr = iv.start.instruction_index().min(last_instr);
                let block_rpo = seq.block_containing(instr);
                if seq.blocks[block_rpo as usize].deferred {
                    frame.mark_needs_frame(block_rpo);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::*;
    use cranelift_entity::EntityRef;

    struct NoFrame;
    impl Frame for NoFrame {
        fn allocate_spill_slot(&mut self, _width: ByteWidth) -> u32 {
            0
        }
        fn mark_needs_frame(&mut self, _block_rpo: u32) {}
    }

    fn vreg(n: u32) -> VReg {
        VReg::new(n as usize)
    }

    #[test]
    fn split_siblings_in_different_registers_get_a_connecting_move() {
        let mut seq = InstructionSequence {
            value_kinds: vec![(RegisterKind::General, ByteWidth::DoubleWord)],
            is_reference: vec![],
            instructions: vec![Instruction::default(), Instruction::default()],
            blocks: vec![InstructionBlock {
                rpo_number: 0,
                first_instruction: 0,
                last_instruction: 1,
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
        let top = data.range_for_vreg(vreg(0), RegisterKind::General, ByteWidth::DoubleWord);
        let iv0 = data.arena.intervals.alloc(crate::interval::UseInterval::new(
            LifetimePosition::instr_start(0),
            LifetimePosition::instr_start(2),
        ));
        data.arena.get_mut(top).append_interval(iv0, &data.arena.intervals);

        let sibling = data.arena.split(top, LifetimePosition::gap_start(1));
        data.arena.get_mut(top).assigned_register = Some(0);
        data.arena.get_mut(sibling).assigned_register = Some(1);

        connect_ranges(&mut seq, &data);

        assert_eq!(
            seq.instructions[1].start_gap_moves.moves,
            vec![(
                Operand::Register(ByteWidth::DoubleWord, 0),
                Operand::Register(ByteWidth::DoubleWord, 1)
            )]
        );
    }

    #[test]
    fn frame_unused_in_this_test_module() {
        let mut f = NoFrame;
        f.mark_needs_frame(0);
    }
}
