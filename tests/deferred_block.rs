//! A deferred (cold) block that defines and only uses a value locally,
//! while a second value claims the only register across the whole span: the
//! deferred value's forced spill must not leak a store into the hot path.

mod support;

use regalloc_lsra::iface::InstructionSequence;
use regalloc_lsra::{allocate_registers, AllocatorOptions, NeverAbort};
use support::*;

#[test]
fn deferred_only_value_does_not_spill_on_the_hot_path() {
    let v_keep = vreg(0);
    let v0 = vreg(1);

    // B0 (hot) -> B1 (deferred) -> B2 (hot); v_keep holds the single
    // register from its definition in B0 to its use in B2, so v0 (defined
    // and used entirely inside B1) can never get a register of its own.
    let mut seq = InstructionSequence {
        value_kinds: double_word(2),
        is_reference: vec![],
        instructions: vec![
            def(requires_register(v_keep)),   // i0: B0
            def(unconstrained(v0)),           // i1: B1, defines v0
            use_one(requires_register(v0)),   // i2: B1, uses v0
            use_one(requires_register(v_keep)), // i3: B2
        ],
        blocks: vec![
            block(0, 0, 0, vec![], vec![1]),
            {
                let mut b = block(1, 1, 2, vec![0], vec![2]);
                b.deferred = true;
                b
            },
            block(2, 3, 3, vec![1], vec![]),
        ],
    };

    let regs = FixedRegs::new(1);
    let mut frame = RecordingFrame::default();
    let mut tick = NeverAbort;
    allocate_registers(&mut seq, &regs, &mut frame, &mut tick, &AllocatorOptions::default()).unwrap();

    // Only the deferred block itself may be told it needs a real frame, on
    // v0's account; v_keep never spills, so it never asks for one either.
    assert!(
        frame.frames_needed.iter().all(|&rpo| rpo == 1),
        "only the deferred block itself may be marked as needing a frame: {:?}",
        frame.frames_needed
    );

    // v0 never survives past the deferred block's exit, so it contributes
    // no gap moves at B0's or B2's boundaries.
    assert!(seq.instructions[0].start_gap_moves.moves.is_empty());
    assert!(seq.instructions[3].end_gap_moves.moves.is_empty());
}
