//! The single entry point: runs every component in order over one
//! [`InstructionSequence`].

use log::debug;

use crate::allocator::{allocate_bank, AllocatorOptions};
use crate::assigner::assign_operands;
use crate::bundle_builder::build_bundles;
use crate::connector::connect;
use crate::constraint_builder::build_constraints;
use crate::data::AllocationData;
use crate::error::RegallocResult;
use crate::iface::{Frame, InstructionSequence, RegisterConfiguration, RegisterKind, TickCounter};
use crate::range_builder::build_live_ranges;
use crate::refmap::populate_reference_maps;

/// Allocate registers and stack slots for every virtual operand in `seq`,
/// rewriting it in place and inserting whatever gap moves and spill stores
/// that requires.
///
/// Runs, in order: constraint lowering, live-range construction, phi-bundle
/// coalescing, linear-scan allocation (once per register bank), operand
/// assignment, reference-map population, and connection of split siblings
/// and control-flow edges.
pub fn allocate_registers(
    seq: &mut InstructionSequence,
    reg_config: &dyn RegisterConfiguration,
    frame: &mut dyn Frame,
    tick: &mut dyn TickCounter,
    options: &AllocatorOptions,
) -> RegallocResult<()> {
    debug!("allocating {} instructions over {} blocks", seq.num_instructions(), seq.blocks.len());

    build_constraints(seq);

    let mut data = AllocationData::new(seq.blocks.len());
    build_live_ranges(seq, &mut data, reg_config, options)?;
    build_bundles(seq, &mut data);

    debug!("allocating general-purpose bank");
    allocate_bank(seq, &mut data, reg_config, RegisterKind::General, tick)?;
    debug!("allocating floating-point bank");
    allocate_bank(seq, &mut data, reg_config, RegisterKind::Float, tick)?;

    assign_operands(seq, &mut data, frame)?;
    populate_reference_maps(seq, &data);
    connect(seq, &data, frame);

    Ok(())
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

    struct TestFrame {
        next: u32,
        frames_needed: Vec<u32>,
    }
    impl Frame for TestFrame {
        fn allocate_spill_slot(&mut self, _width: ByteWidth) -> u32 {
            let slot = self.next;
            self.next += 1;
            slot
        }
        fn mark_needs_frame(&mut self, block_rpo: u32) {
            self.frames_needed.push(block_rpo);
        }
    }

    fn vreg(n: u32) -> VReg {
        VReg::new(n as usize)
    }

    fn unconstrained(v: VReg) -> Operand {
        Operand::Unallocated(v, UsePositionType::RegisterOrSlot)
    }

    #[test]
    fn straight_line_sequence_ends_fully_allocated() {
        // i0: def v0 ; i1: def v1 ; i2: use v0 (register), use v1 (register)
        let mut seq = InstructionSequence {
            value_kinds: vec![(RegisterKind::General, ByteWidth::DoubleWord); 2],
            is_reference: vec![],
            instructions: vec![
                Instruction {
                    outputs: vec![unconstrained(vreg(0))],
                    ..Default::default()
                },
                Instruction {
                    outputs: vec![unconstrained(vreg(1))],
                    ..Default::default()
                },
                Instruction {
                    inputs: vec![
                        Operand::Unallocated(vreg(0), UsePositionType::RequiresRegister),
                        Operand::Unallocated(vreg(1), UsePositionType::RequiresRegister),
                    ],
                    ..Default::default()
                },
            ],
            blocks: vec![InstructionBlock {
                rpo_number: 0,
                first_instruction: 0,
                last_instruction: 2,
                predecessors: vec![],
                successors: vec![],
                is_loop_header: false,
                loop_end: None,
                loop_header: None,
                deferred: false,
                phis: vec![],
            }],
        };

        let mut frame = TestFrame {
            next: 0,
            frames_needed: Vec::new(),
        };
        let mut tick = NeverAbort;
        allocate_registers(&mut seq, &TwoRegs, &mut frame, &mut tick, &AllocatorOptions::default()).unwrap();

        for op in &seq.instructions[2].inputs {
            assert!(matches!(op, Operand::Register(..)), "unallocated operand left behind: {op:?}");
        }
        assert!(frame.frames_needed.is_empty(), "no deferred blocks in this sequence");
    }
}
