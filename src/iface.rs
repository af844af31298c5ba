//! The boundary the core consumes and produces.
//!
//! Everything in this module is supplied by, or owed to, an external
//! collaborator: the frontend builds the
//! [`InstructionSequence`]; the embedder supplies a [`RegisterConfiguration`]
//! describing the target machine and a [`Frame`] that hands out stack slot
//! indices; the surrounding compiler drives a [`TickCounter`]. None of these
//! types are constructed by the core itself.

use cranelift_entity::{entity_impl, EntityRef};

/// An abstract name for a value in the pre-allocation program.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VReg(u32);
entity_impl!(VReg, "v");

/// Which register bank a range belongs to. The allocator runs once per bank,
/// once for the integer bank and once for the floating-point bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    /// General-purpose integer/pointer registers.
    General,
    /// Floating-point / SIMD registers.
    Float,
}

/// The width, in bytes, of the value a range carries. Drives spill-slot
/// sizing and spill-range merge compatibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ByteWidth {
    /// 4-byte value.
    Word,
    /// 8-byte value.
    DoubleWord,
    /// 16-byte scalar value (e.g. i128), distinct from `Simd128`: same size,
    /// different register class, so the two never share a spill slot.
    QuadWord,
    /// 16-byte vector value (SIMD).
    Simd128,
}

impl ByteWidth {
    /// Size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            ByteWidth::Word => 4,
            ByteWidth::DoubleWord => 8,
            ByteWidth::QuadWord => 16,
            ByteWidth::Simd128 => 16,
        }
    }
}

/// The policy a use position must satisfy once the range commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UsePositionType {
    /// Must be rewritten to a register operand.
    RequiresRegister,
    /// Must be rewritten to a stack-slot operand.
    RequiresSlot,
    /// May be rewritten to either a register or a stack-slot operand.
    RegisterOrSlot,
    /// May be rewritten to a register, a stack-slot, or a constant operand.
    RegisterOrSlotOrConstant,
}

impl UsePositionType {
    /// Whether this policy can be satisfied by a constant operand directly,
    /// without ever materializing a register.
    pub fn accepts_constant(self) -> bool {
        matches!(self, UsePositionType::RegisterOrSlotOrConstant)
    }

    /// Whether this policy is satisfied by a stack-slot operand.
    pub fn accepts_slot(self) -> bool {
        matches!(
            self,
            UsePositionType::RequiresSlot
                | UsePositionType::RegisterOrSlot
                | UsePositionType::RegisterOrSlotOrConstant
        )
    }

    /// Whether this policy is satisfied by a register operand.
    pub fn accepts_register(self) -> bool {
        !matches!(self, UsePositionType::RequiresSlot)
    }
}

/// Where, within one instruction, an operand lives. Used as the "pointer"
/// a use position rewrites at commit time: rather than an owned
/// back-pointer, the index is simply into the caller's own
/// `InstructionSequence`, which already outlives the allocation zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperandSlot {
    /// The `n`th input of an instruction.
    Input(u32, u32),
    /// The `n`th output of an instruction.
    Output(u32, u32),
    /// The `n`th temp of an instruction.
    Temp(u32, u32),
    /// A slot inside a gap's parallel move: `(instruction, END-not-START,
    /// move index)`. `end_of_gap` distinguishes the START sub-gap (moves
    /// that should be visible to code entering the instruction) from the
    /// END sub-gap (moves visible to code leaving the previous one).
    GapMove {
        /// Owning instruction index.
        instruction: u32,
        /// `true` for the END gap, `false` for the START gap.
        end_of_gap: bool,
        /// Index of the move's destination operand within that gap's
        /// parallel move list.
        move_index: u32,
    },
}

/// A single virtual operand before allocation, or a concrete one after.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Not yet allocated; carries the virtual register and the policy this
    /// use must satisfy.
    Unallocated(VReg, UsePositionType),
    /// Pinned to a specific physical register already (used for fixed
    /// inputs/outputs before the constraint builder even runs, and for the
    /// final committed form).
    FixedRegister(VReg, u16),
    /// A register operand, after assignment.
    Register(ByteWidth, u16),
    /// A stack-slot operand, after assignment.
    StackSlot(ByteWidth, u32),
    /// A constant operand. Untouched by the allocator except that uses may
    /// be rewritten to point at it.
    Constant(VReg),
}

impl Operand {
    /// The virtual register this operand names, if it still names one.
    pub fn vreg(self) -> Option<VReg> {
        match self {
            Operand::Unallocated(v, _) | Operand::FixedRegister(v, _) | Operand::Constant(v) => {
                Some(v)
            }
            Operand::Register(..) | Operand::StackSlot(..) => None,
        }
    }
}

/// One gap's worth of parallel moves. Semantics: all sources are read
/// before any destination is written: a
/// later lowering pass, not this crate, serializes them.
#[derive(Clone, Debug, Default)]
pub struct ParallelMove {
    /// `(from, to)` pairs. `from` is `None` for a move whose source operand
    /// is not yet known at insertion time and is patched in later (used by
    /// the connector for split/phi resolution, which always knows both
    /// sides immediately, so in practice this is always `Some`).
    pub moves: Vec<(Operand, Operand)>,
}

/// The per-instruction reference map: for a safepoint instruction, which
/// operand slots must be reported to the garbage collector.
#[derive(Clone, Debug, Default)]
pub struct ReferenceMap {
    /// Operands, in arbitrary order, holding a live pointer at this
    /// instruction. Populated entirely by component J; empty until then.
    pub reported_operands: Vec<Operand>,
}

/// One instruction in the finalized sequence.
#[derive(Clone, Debug, Default)]
pub struct Instruction {
    /// Input operands, in order.
    pub inputs: Vec<Operand>,
    /// Output operands, in order.
    pub outputs: Vec<Operand>,
    /// Temp operands, in order: live only across this one instruction.
    pub temps: Vec<Operand>,
    /// `true` if this instruction clobbers every allocatable register in
    /// some bank (a call, typically).
    pub is_call: bool,
    /// Which virtual registers, if any, have an "output same as input"
    /// constraint, given as `(output_index, input_index)`.
    pub same_as_input: Vec<(u32, u32)>,
    /// Which output indices must land in a specific physical register.
    pub fixed_outputs: Vec<(u32, u16)>,
    /// Which input indices must be read from a specific physical register.
    pub fixed_inputs: Vec<(u32, u16)>,
    /// Which output indices are already pinned to a fixed stack slot (e.g.
    /// a value materialized directly into its home slot). Only meaningful
    /// on the last instruction of a block.
    pub fixed_slot_outputs: Vec<(u32, u32)>,
    /// Which output indices are pointer-typed (recorded into the owning
    /// instruction's reference map when spilled or kept in a register
    /// across a later safepoint).
    pub tagged_outputs: Vec<u32>,
    /// Which input indices are pointer-typed.
    pub tagged_inputs: Vec<u32>,
    /// The reference map for this instruction, if it is a safepoint.
    pub reference_map: Option<ReferenceMap>,
    /// Parallel move at the START sub-gap (before this instruction).
    pub start_gap_moves: ParallelMove,
    /// Parallel move at the END sub-gap (before this instruction, after
    /// the previous instruction's START gap).
    pub end_gap_moves: ParallelMove,
}

/// A phi at the head of a block: one operand contributed per predecessor,
/// in predecessor-list order, plus the virtual register it defines.
#[derive(Clone, Debug)]
pub struct Phi {
    /// The virtual register the phi defines.
    pub output: VReg,
    /// One virtual register contributed per predecessor, aligned with
    /// [`InstructionBlock::predecessors`].
    pub inputs: Vec<VReg>,
}

/// One basic block.
#[derive(Clone, Debug)]
pub struct InstructionBlock {
    /// Index of this block in reverse-postorder.
    pub rpo_number: u32,
    /// First instruction index (inclusive).
    pub first_instruction: u32,
    /// Last instruction index (inclusive).
    pub last_instruction: u32,
    /// Predecessor blocks, by rpo number.
    pub predecessors: Vec<u32>,
    /// Successor blocks, by rpo number.
    pub successors: Vec<u32>,
    /// `true` if this block begins a loop.
    pub is_loop_header: bool,
    /// If `is_loop_header`, the rpo number of the last block in the loop
    /// body (inclusive).
    pub loop_end: Option<u32>,
    /// The rpo number of the loop header enclosing this block, if any
    /// (including this block itself, if it is a header).
    pub loop_header: Option<u32>,
    /// `true` if this block is marked cold: the allocator may only spill
    /// (never permanently commit a spill slot) for its duration.
    pub deferred: bool,
    /// Phis defined at the head of this block.
    pub phis: Vec<Phi>,
}

impl InstructionBlock {
    /// Number of instructions in this block.
    pub fn len(&self) -> u32 {
        self.last_instruction - self.first_instruction + 1
    }
}

/// A finalized, linear instruction sequence with virtual operands, ready
/// for allocation.
#[derive(Clone, Debug, Default)]
pub struct InstructionSequence {
    /// Instructions, indexed by instruction index.
    pub instructions: Vec<Instruction>,
    /// Blocks, indexed by rpo number.
    pub blocks: Vec<InstructionBlock>,
    /// Register bank and byte width for each virtual register, indexed by
    /// `VReg::index()`. Supplied by the frontend; the allocator never
    /// infers a value's kind from how it's used.
    pub value_kinds: Vec<(RegisterKind, ByteWidth)>,
    /// Whether each virtual register, indexed by `VReg::index()`, carries a
    /// live pointer the garbage collector must be able to find. Missing
    /// entries (a shorter vec than `value_kinds`) are treated as non-
    /// reference, so a frontend with no GC-managed values can leave this
    /// empty.
    pub is_reference: Vec<bool>,
}

impl InstructionSequence {
    /// The bank and width of `vreg`.
    pub fn kind_of(&self, vreg: VReg) -> (RegisterKind, ByteWidth) {
        self.value_kinds[vreg.index()]
    }

    /// Whether `vreg` carries a live pointer that must be reported at every
    /// safepoint it's live across.
    pub fn is_reference(&self, vreg: VReg) -> bool {
        self.is_reference.get(vreg.index()).copied().unwrap_or(false)
    }
}

impl InstructionSequence {
    /// Total instruction count.
    pub fn num_instructions(&self) -> u32 {
        self.instructions.len() as u32
    }

    /// The block containing `instruction`, found by linear scan over
    /// blocks (sequences are small enough in practice, and this is only
    /// used during setup, never on the allocator's hot path).
    pub fn block_containing(&self, instruction: u32) -> u32 {
        self.blocks
            .iter()
            .position(|b| b.first_instruction <= instruction && instruction <= b.last_instruction)
            .expect("instruction index out of range") as u32
    }
}

/// Aliasing relation and allocatable-register enumeration for one bank,
/// supplied by the target descriptor.
pub trait RegisterConfiguration {
    /// Number of registers in `kind`'s bank.
    fn num_registers(&self, kind: RegisterKind) -> u16;

    /// Codes of the registers this allocator is permitted to hand out, in
    /// the priority order it should prefer them (e.g. caller-save before
    /// callee-save).
    fn allocatable_registers(&self, kind: RegisterKind) -> &[u16];

    /// For a bank with non-simple aliasing (e.g. a float register that is
    /// one half of a double register), the set of other physical registers
    /// that overlap `reg`. Empty for banks without aliasing.
    fn aliased_registers(&self, kind: RegisterKind, reg: u16) -> &[u16];

    /// Whether `reg` is callee-saved (used to break ties when several
    /// registers are available for the same duration).
    fn is_callee_saved(&self, kind: RegisterKind, reg: u16) -> bool;
}

/// Stack-slot allocator, supplied by the frame manager.
pub trait Frame {
    /// Allocate a new spill slot able to hold `width` bytes, returning its
    /// index. Slot indices are never reused by the frame manager itself;
    /// merging equivalent slots is entirely this crate's job (component I).
    fn allocate_spill_slot(&mut self, width: ByteWidth) -> u32;

    /// Record that `block`'s entry needs a valid frame even though the
    /// block may otherwise have been frameless (used by the deferred-block
    /// spill commitment).
    fn mark_needs_frame(&mut self, block_rpo: u32);
}

/// Cooperative abort check. Called once per block and once per top-level
/// range handled; never mid-operation.
pub trait TickCounter {
    /// Returns `true` if the surrounding compiler wants the allocator to
    /// stop at the next opportunity.
    fn should_abort(&mut self) -> bool;
}

/// A no-op tick counter that never aborts, for tests and embedders that
/// don't need cooperative cancellation.
#[derive(Default)]
pub struct NeverAbort;

impl TickCounter for NeverAbort {
    fn should_abort(&mut self) -> bool {
        false
    }
}

