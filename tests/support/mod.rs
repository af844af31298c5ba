//! Small builder helpers shared by the integration tests: just enough to
//! hand-assemble an `InstructionSequence` without repeating the same
//! boilerplate in every scenario file.

use cranelift_entity::EntityRef;
use regalloc_lsra::iface::{
    ByteWidth, Instruction, InstructionBlock, Operand, Phi, RegisterKind, UsePositionType,
};
use regalloc_lsra::{Frame, RegisterConfiguration, VReg};

pub fn vreg(n: u32) -> VReg {
    VReg::new(n as usize)
}

pub fn unconstrained(v: VReg) -> Operand {
    Operand::Unallocated(v, UsePositionType::RegisterOrSlot)
}

pub fn requires_register(v: VReg) -> Operand {
    Operand::Unallocated(v, UsePositionType::RequiresRegister)
}

pub fn def(output: Operand) -> Instruction {
    Instruction {
        outputs: vec![output],
        ..Default::default()
    }
}

pub fn use_one(input: Operand) -> Instruction {
    Instruction {
        inputs: vec![input],
        ..Default::default()
    }
}

pub fn use_two(a: Operand, b: Operand) -> Instruction {
    Instruction {
        inputs: vec![a, b],
        ..Default::default()
    }
}

pub fn empty() -> Instruction {
    Instruction::default()
}

pub fn block(
    rpo: u32,
    first: u32,
    last: u32,
    predecessors: Vec<u32>,
    successors: Vec<u32>,
) -> InstructionBlock {
    InstructionBlock {
        rpo_number: rpo,
        first_instruction: first,
        last_instruction: last,
        predecessors,
        successors,
        is_loop_header: false,
        loop_end: None,
        loop_header: None,
        deferred: false,
        phis: vec![],
    }
}

pub fn phi(output: VReg, inputs: Vec<VReg>) -> Phi {
    Phi { output, inputs }
}

/// A register file with `count` allocatable, non-aliasing registers, codes
/// `0..count`, none callee-saved.
pub struct FixedRegs {
    pub count: u16,
}

impl FixedRegs {
    pub fn new(count: u16) -> Self {
        Self { count }
    }
}

impl RegisterConfiguration for FixedRegs {
    fn num_registers(&self, _kind: RegisterKind) -> u16 {
        self.count
    }

    fn allocatable_registers(&self, _kind: RegisterKind) -> &[u16] {
        // Codes 0..count, materialized once since `count` is tiny in tests.
        match self.count {
            1 => &[0],
            2 => &[0, 1],
            3 => &[0, 1, 2],
            _ => &[0, 1, 2, 3],
        }
    }

    fn aliased_registers(&self, _kind: RegisterKind, _reg: u16) -> &[u16] {
        &[]
    }

    fn is_callee_saved(&self, _kind: RegisterKind, _reg: u16) -> bool {
        false
    }
}

/// A frame that hands out ever-increasing slot indices and records which
/// blocks were told they need a real frame.
#[derive(Default)]
pub struct RecordingFrame {
    pub next_slot: u32,
    pub frames_needed: Vec<u32>,
}

impl Frame for RecordingFrame {
    fn allocate_spill_slot(&mut self, _width: ByteWidth) -> u32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn mark_needs_frame(&mut self, block_rpo: u32) {
        self.frames_needed.push(block_rpo);
    }
}

pub fn double_word(n: usize) -> Vec<(RegisterKind, ByteWidth)> {
    vec![(RegisterKind::General, ByteWidth::DoubleWord); n]
}
