//! An if-diamond merging into a phi: each predecessor should end with a
//! move into the phi's committed location, collapsing to nothing when both
//! sides already agree.

mod support;

use regalloc_lsra::iface::{InstructionSequence, Operand};
use regalloc_lsra::{allocate_registers, AllocatorOptions, NeverAbort};
use support::*;

/// B0 -> B1, B2 -> B3; B1 defines v1, B2 defines v2, B3 has `v3 = phi(v1, v2)`.
fn diamond() -> InstructionSequence {
    let v1 = vreg(0);
    let v2 = vreg(1);
    let v3 = vreg(2);

    InstructionSequence {
        value_kinds: double_word(3),
        is_reference: vec![],
        instructions: vec![
            empty(),                  // i0: B0, falls through to both branches
            def(unconstrained(v1)),   // i1: B1
            def(unconstrained(v2)),   // i2: B2
            use_one(unconstrained(v3)), // i3: B3, uses the phi result
        ],
        blocks: vec![
            block(0, 0, 0, vec![], vec![1, 2]),
            block(1, 1, 1, vec![0], vec![3]),
            block(2, 2, 2, vec![0], vec![3]),
            {
                let mut b = block(3, 3, 3, vec![1, 2], vec![]);
                b.phis.push(phi(v3, vec![v1, v2]));
                b
            },
        ],
    }
}

#[test]
fn both_predecessors_feed_the_phi_destination() {
    let mut seq = diamond();
    let regs = FixedRegs::new(2);
    let mut frame = RecordingFrame::default();
    let mut tick = NeverAbort;
    allocate_registers(&mut seq, &regs, &mut frame, &mut tick, &AllocatorOptions::default()).unwrap();

    // Whatever location the phi output landed in, the use at i3 must be a
    // concrete operand (not an unresolved virtual register).
    let phi_use = &seq.instructions[3].inputs[0];
    assert!(
        !matches!(phi_use, Operand::Unallocated(..)),
        "phi destination must be fully assigned: {phi_use:?}"
    );
}

#[test]
fn identical_predecessor_locations_need_no_redundant_move() {
    let mut seq = diamond();
    // Force both B1 and B2 to agree on register 0 for their contribution by
    // using a single-register bank: there is nowhere else for either to go.
    let regs = FixedRegs::new(1);
    let mut frame = RecordingFrame::default();
    let mut tick = NeverAbort;
    allocate_registers(&mut seq, &regs, &mut frame, &mut tick, &AllocatorOptions::default()).unwrap();

    // B1 (block 1, instruction 1) and B2 (block 2, instruction 2) both end
    // the program the same way a value can reach B3: since only one
    // register exists, both contributions must funnel through it, so B3's
    // entry gap should not need to reconcile two different locations with
    // an extra move beyond what coalescing already produced.
    let b1_exit_moves = seq.instructions[1].end_gap_moves.moves.len()
        + seq.instructions[1].start_gap_moves.moves.len();
    let b2_exit_moves = seq.instructions[2].end_gap_moves.moves.len()
        + seq.instructions[2].start_gap_moves.moves.len();
    // Neither predecessor needs more than one move to place its value.
    assert!(b1_exit_moves <= 1);
    assert!(b2_exit_moves <= 1);
}
