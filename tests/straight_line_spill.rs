//! Straight-line code with more live values than registers: one value must
//! be spilled and reloaded once the register it wanted frees up.

mod support;

use regalloc_lsra::iface::{InstructionSequence, Operand};
use regalloc_lsra::{allocate_registers, AllocatorOptions, NeverAbort};
use support::*;

#[test]
fn single_register_forces_a_spill_with_a_reload_at_the_later_use() {
    // i0: def v0 ; i1: def v1 ; i2: use v0 (register) ; i3: use v1 (register)
    //
    // v0 is live i0..i2, v1 is live i1..i3; they overlap over i1..i2, so
    // with one allocatable register only one of them can hold it there.
    let v0 = vreg(0);
    let v1 = vreg(1);

    let mut seq = InstructionSequence {
        value_kinds: double_word(2),
        is_reference: vec![],
        instructions: vec![
            def(unconstrained(v0)),
            def(unconstrained(v1)),
            use_one(requires_register(v0)),
            use_one(requires_register(v1)),
        ],
        blocks: vec![block(0, 0, 3, vec![], vec![])],
    };

    let regs = FixedRegs::new(1);
    let mut frame = RecordingFrame::default();
    let mut tick = NeverAbort;
    allocate_registers(&mut seq, &regs, &mut frame, &mut tick, &AllocatorOptions::default())
        .expect("one register is enough to allocate this sequence, with one spill");

    let use_v0 = &seq.instructions[2].inputs[0];
    let use_v1 = &seq.instructions[3].inputs[0];
    assert!(
        matches!(use_v0, Operand::Register(..)),
        "use of v0 must be rewritten to a register: {use_v0:?}"
    );
    assert!(
        matches!(use_v1, Operand::Register(..)),
        "use of v1 must be rewritten to a register: {use_v1:?}"
    );

    // v1 only reaches a register again after v0 has died; a reload move
    // must exist somewhere ahead of its use to get it there.
    let any_reload_move = seq.instructions[..=3]
        .iter()
        .any(|i| !i.start_gap_moves.moves.is_empty() || !i.end_gap_moves.moves.is_empty());
    assert!(any_reload_move, "v1 must be reloaded into the register through a gap move");
}
