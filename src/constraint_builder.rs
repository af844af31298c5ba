//! Lowers operand policies into fixed-register gap moves before live
//! ranges are built.
//!
//! This walks the sequence front-to-back, once, and only ever rewrites
//! operands and gap moves already present on [`Instruction`] — it never
//! touches [`AllocationData`], which the next stage (component F) owns
//! exclusively.

use crate::iface::{Instruction, InstructionSequence, Operand, UsePositionType, VReg};

/// Run the constraint builder over every instruction in `seq`, in place.
pub fn build_constraints(seq: &mut InstructionSequence) {
    for block_idx in 0..seq.blocks.len() {
        let (first, last) = {
            let b = &seq.blocks[block_idx];
            (b.first_instruction, b.last_instruction)
        };
        for inst_idx in first..=last {
            lower_instruction(seq, inst_idx, inst_idx == last, block_idx);
        }
        lower_phis(seq, block_idx);
    }
}

fn lower_instruction(seq: &mut InstructionSequence, inst_idx: u32, is_last: bool, block_idx: usize) {
    // Fixed inputs: pin the operand at the instruction and insert a gap-END
    // move from an unconstrained copy into the fixed register.
    let fixed_inputs = seq.instructions[inst_idx as usize].fixed_inputs.clone();
    for (idx, reg) in fixed_inputs {
        let vreg = unwrap_vreg(seq.instructions[inst_idx as usize].inputs[idx as usize]);
        seq.instructions[inst_idx as usize]
            .end_gap_moves
            .moves
            .push((
                Operand::Unallocated(vreg, UsePositionType::RegisterOrSlot),
                Operand::FixedRegister(vreg, reg),
            ));
        seq.instructions[inst_idx as usize].inputs[idx as usize] = Operand::FixedRegister(vreg, reg);
    }

    // Fixed outputs: produce directly in the fixed register, then move out
    // to an unconstrained copy at the START gap of the *next* instruction
    // so later uses go through ordinary allocation.
    let fixed_outputs = seq.instructions[inst_idx as usize].fixed_outputs.clone();
    for (idx, reg) in fixed_outputs {
        let vreg = unwrap_vreg(seq.instructions[inst_idx as usize].outputs[idx as usize]);
        seq.instructions[inst_idx as usize].outputs[idx as usize] = Operand::FixedRegister(vreg, reg);
        if let Some(next) = seq.instructions.get_mut((inst_idx + 1) as usize) {
            next.start_gap_moves.moves.push((
                Operand::FixedRegister(vreg, reg),
                Operand::Unallocated(vreg, UsePositionType::RegisterOrSlot),
            ));
        }
        if seq.instructions[inst_idx as usize]
            .tagged_outputs
            .contains(&idx)
        {
            if let Some(map) = seq.instructions[inst_idx as usize].reference_map.as_mut() {
                map.reported_operands.push(Operand::FixedRegister(vreg, reg));
            }
        }
    }

    // "Same as input" outputs: rewrite the single input to reference the
    // output's virtual register directly, and tie them together with an
    // END gap move.
    let same_as_input = seq.instructions[inst_idx as usize].same_as_input.clone();
    for (out_idx, in_idx) in same_as_input {
        let output_vreg = unwrap_vreg(seq.instructions[inst_idx as usize].outputs[out_idx as usize]);
        let input_vreg = unwrap_vreg(seq.instructions[inst_idx as usize].inputs[in_idx as usize]);
        seq.instructions[inst_idx as usize]
            .end_gap_moves
            .moves
            .push((
                Operand::Unallocated(input_vreg, UsePositionType::RegisterOrSlot),
                Operand::Unallocated(output_vreg, UsePositionType::RegisterOrSlot),
            ));
        seq.instructions[inst_idx as usize].inputs[in_idx as usize] =
            Operand::Unallocated(output_vreg, UsePositionType::RegisterOrSlot);

        let input_tagged = seq.instructions[inst_idx as usize]
            .tagged_inputs
            .contains(&in_idx);
        let output_tagged = seq.instructions[inst_idx as usize]
            .tagged_outputs
            .contains(&out_idx);
        if input_tagged && !output_tagged {
            seq.instructions[inst_idx as usize]
                .tagged_outputs
                .push(out_idx);
        }
    }

    // Last-instruction-of-block outputs.
    if is_last {
        let fixed_slot_outputs = seq.instructions[inst_idx as usize]
            .fixed_slot_outputs
            .clone();
        for (idx, slot) in fixed_slot_outputs {
            let vreg = unwrap_vreg(seq.instructions[inst_idx as usize].outputs[idx as usize]);
            // A fixed-slot output never needs a spill move: the slot *is*
            // the value's only home. Downstream stages see it as already
            // resolved once the constraint builder is done (represented
            // via `Operand::StackSlot`; width is filled in from the live
            // range's width when the range is first created).
            seq.instructions[inst_idx as usize].outputs[idx as usize] =
                Operand::StackSlot(crate::iface::ByteWidth::DoubleWord, slot);
            let _ = vreg;
        }
        // Non-fixed-slot outputs of a block's last instruction are turned
        // into spill-move insertion locations at each successor's entry
        // gap once component F knows their top-level range; nothing more
        // to do here.
    }
}

fn lower_phis(seq: &mut InstructionSequence, block_idx: usize) {
    let predecessors = seq.blocks[block_idx].predecessors.clone();
    let phis = seq.blocks[block_idx].phis.clone();
    for phi in &phis {
        for (pred_pos, &pred_rpo) in predecessors.iter().enumerate() {
            let input_vreg = phi.inputs[pred_pos];
            let pred_last = seq.blocks[pred_rpo as usize].last_instruction;
            seq.instructions[pred_last as usize]
                .end_gap_moves
                .moves
                .push((
                    Operand::Unallocated(input_vreg, UsePositionType::RegisterOrSlot),
                    Operand::Unallocated(phi.output, UsePositionType::RegisterOrSlot),
                ));
        }
    }
}

fn unwrap_vreg(op: Operand) -> VReg {
    op.vreg().expect("operand must still name a virtual register at constraint-build time")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::*;
    use cranelift_entity::EntityRef;

    fn vreg(n: u32) -> VReg {
        VReg::new(n as usize)
    }

    fn unconstrained(v: VReg) -> Operand {
        Operand::Unallocated(v, UsePositionType::RegisterOrSlot)
    }

    fn one_block(insts: Vec<Instruction>) -> InstructionSequence {
        let last = insts.len() as u32 - 1;
        InstructionSequence {
            instructions: insts,
            blocks: vec![InstructionBlock {
                rpo_number: 0,
                first_instruction: 0,
                last_instruction: last,
                predecessors: vec![],
                successors: vec![],
                is_loop_header: false,
                loop_end: None,
                loop_header: None,
                deferred: false,
                phis: vec![],
            }],
            value_kinds: vec![],
            is_reference: vec![],
        }
    }

    #[test]
    fn fixed_input_gets_pin_and_gap_move() {
        let mut inst = Instruction {
            inputs: vec![unconstrained(vreg(0))],
            ..Default::default()
        };
        inst.fixed_inputs.push((0, 3));
        let mut seq = one_block(vec![inst]);
        build_constraints(&mut seq);
        assert_eq!(
            seq.instructions[0].inputs[0],
            Operand::FixedRegister(vreg(0), 3)
        );
        assert_eq!(seq.instructions[0].end_gap_moves.moves.len(), 1);
        assert_eq!(
            seq.instructions[0].end_gap_moves.moves[0].1,
            Operand::FixedRegister(vreg(0), 3)
        );
    }

    #[test]
    fn same_as_input_rewrites_input_and_links_tag() {
        let mut inst = Instruction {
            inputs: vec![unconstrained(vreg(0))],
            outputs: vec![unconstrained(vreg(1))],
            ..Default::default()
        };
        inst.same_as_input.push((0, 0));
        inst.tagged_inputs.push(0);
        let mut seq = one_block(vec![inst]);
        build_constraints(&mut seq);
        assert_eq!(seq.instructions[0].inputs[0], unconstrained(vreg(1)));
        assert!(seq.instructions[0].tagged_outputs.contains(&0));
    }
}
