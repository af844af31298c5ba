//! Populates each safepoint instruction's [`ReferenceMap`]: its own tagged
//! operands, same-as-input tagged uses left as a
//! [`crate::data::DelayedReference`], and every other reference-typed value
//! merely live across the safepoint.

use crate::data::AllocationData;
use crate::iface::{ByteWidth, InstructionSequence, Operand, OperandSlot};
use crate::live_range::LiveRangeId;
use crate::position::LifetimePosition;

/// Fill in `reported_operands` for every instruction carrying a
/// [`ReferenceMap`](crate::iface::ReferenceMap).
pub fn populate_reference_maps(seq: &mut InstructionSequence, data: &AllocationData) {
    for inst_idx in 0..seq.num_instructions() {
        if seq.instructions[inst_idx as usize].reference_map.is_none() {
            continue;
        }
        let tagged_inputs = seq.instructions[inst_idx as usize].tagged_inputs.clone();
        let tagged_outputs = seq.instructions[inst_idx as usize].tagged_outputs.clone();
        for idx in tagged_inputs {
            let op = seq.instructions[inst_idx as usize].inputs[idx as usize];
            report(seq, inst_idx, op);
        }
        for idx in tagged_outputs {
            let op = seq.instructions[inst_idx as usize].outputs[idx as usize];
            report(seq, inst_idx, op);
        }
    }

    for delayed in &data.delayed_references {
        let op = read_operand(seq, delayed.source);
        report(seq, delayed.instruction, op);
    }

    report_live_references(seq, data);
}

/// Walk every reference-typed top-level range against every safepoint it
/// spans, reporting whichever location (register or spill slot) actually
/// holds it at that point — not just the operands tagged on the safepoint's
/// own instruction. A value merely live across a call, with no operand of
/// its own on the call itself, would otherwise never be reported and the
/// collector would miss it.
fn report_live_references(seq: &mut InstructionSequence, data: &AllocationData) {
    let last_instr = seq.num_instructions().saturating_sub(1);
    for top in data.arena.all_top_level_ids() {
        let vreg = data
            .arena
            .top_level_data(top)
            .vreg
            .expect("all_top_level_ids always names a vreg");
        if !seq.is_reference(vreg) {
            continue;
        }

        let start_instr = data.arena.get(top).start(&data.arena.intervals).instruction_index();
        let end_instr = data
            .arena
            .iter_siblings(top)
            .map(|sib| data.arena.get(sib).end(&data.arena.intervals).instruction_index())
            .max()
            .unwrap_or(start_instr)
            .min(last_instr);

        for inst_idx in start_instr..=end_instr {
            if seq.instructions[inst_idx as usize].reference_map.is_none() {
                continue;
            }
            let pos = LifetimePosition::instr_start(inst_idx);
            let Some(sib) = data
                .arena
                .iter_siblings(top)
                .find(|&s| data.arena.get(s).covers(pos, &data.arena.intervals))
            else {
                continue;
            };
            let r = data.arena.get(sib);
            let operand = if let Some(reg) = r.assigned_register {
                Operand::Register(r.width, reg)
            } else if r.spilled {
                spill_operand(data, top, r.width)
            } else {
                continue;
            };
            report(seq, inst_idx, operand);
        }
    }
}

/// The operand backing `top`'s spill storage, once assignment has run: a
/// fixed memory operand if one was recorded directly, otherwise the shared
/// stack slot its spill range resolved to.
fn spill_operand(data: &AllocationData, top: LiveRangeId, width: ByteWidth) -> Operand {
    let top_data = data.arena.top_level_data(top);
    if let Some(op) = top_data.spill_operand {
        return op;
    }
    let spill_id = top_data
        .spill_type
        .spill_range()
        .expect("a spilled reference range always has a spill range or a spill operand by refmap time");
    let resolved = data.spill_ranges.resolve(spill_id);
    let slot = data
        .spill_ranges
        .get(resolved)
        .slot
        .expect("every surviving spill range has a slot by refmap time");
    Operand::StackSlot(width, slot)
}

fn read_operand(seq: &InstructionSequence, slot: OperandSlot) -> Operand {
    match slot {
        OperandSlot::Input(inst, idx) => seq.instructions[inst as usize].inputs[idx as usize],
        OperandSlot::Output(inst, idx) => seq.instructions[inst as usize].outputs[idx as usize],
        OperandSlot::Temp(inst, idx) => seq.instructions[inst as usize].temps[idx as usize],
        OperandSlot::GapMove {
            instruction,
            end_of_gap,
            move_index,
        } => {
            let moves = if end_of_gap {
                &seq.instructions[instruction as usize].end_gap_moves.moves
            } else {
                &seq.instructions[instruction as usize].start_gap_moves.moves
            };
            moves[move_index as usize].1
        }
    }
}

fn report(seq: &mut InstructionSequence, inst_idx: u32, operand: Operand) {
    if let Some(map) = seq.instructions[inst_idx as usize].reference_map.as_mut() {
        if !map.reported_operands.contains(&operand) {
            map.reported_operands.push(operand);
        }
    }
}
