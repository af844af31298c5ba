//! A value carried around a loop's back edge: when a register is available
//! for the whole loop, it should stay there with no move on the back edge.

mod support;

use regalloc_lsra::iface::InstructionSequence;
use regalloc_lsra::{allocate_registers, AllocatorOptions, NeverAbort};
use support::*;

#[test]
fn carried_value_needs_no_move_on_the_back_edge() {
    let v0 = vreg(0);

    // B0 (pre-header) -> B1 (header) -> B2 (body) -> B1 (back edge), and
    // B1 -> B3 (exit). v0 is defined in B0 and used every iteration in B2.
    let mut seq = InstructionSequence {
        value_kinds: double_word(1),
        is_reference: vec![],
        instructions: vec![
            def(requires_register(v0)), // i0: B0
            empty(),                    // i1: B1 (header)
            use_one(requires_register(v0)), // i2: B2 (body)
            empty(),                    // i3: B3 (exit)
        ],
        blocks: vec![
            block(0, 0, 0, vec![], vec![1]),
            {
                let mut b = block(1, 1, 1, vec![0, 2], vec![2, 3]);
                b.is_loop_header = true;
                b.loop_end = Some(2);
                b.loop_header = Some(1);
                b
            },
            {
                let mut b = block(2, 2, 2, vec![1], vec![1]);
                b.loop_header = Some(1);
                b
            },
            block(3, 3, 3, vec![1], vec![]),
        ],
    };

    let regs = FixedRegs::new(1);
    let mut frame = RecordingFrame::default();
    let mut tick = NeverAbort;
    allocate_registers(&mut seq, &regs, &mut frame, &mut tick, &AllocatorOptions::default()).unwrap();

    // The back edge out of the body (instruction 2, the block's only
    // instruction) carries no move: the one register is held for the
    // entire loop.
    assert!(
        seq.instructions[2].end_gap_moves.moves.is_empty(),
        "no move should be needed on the back edge when one register covers the whole loop"
    );
}
