//! A linear-scan, control-flow-aware register allocator for a finalized
//! instruction sequence.
//!
//! The caller hands over a fully lowered [`iface::InstructionSequence`] —
//! virtual registers, block boundaries, phis, and operand constraints
//! already decided — and [`allocate_registers`] rewrites every operand in
//! place to name a physical register or a stack slot, inserting whatever
//! gap moves and spill stores that requires. Nothing here decides
//! instruction selection, scheduling, or control flow; by the time this
//! crate sees a sequence those choices are already made (see [`iface`] for
//! the full boundary).
//!
//! Internally the pass runs in stages:
//!
//! 1. [`constraint_builder`] lowers fixed-register and same-as-input
//!    policies into explicit gap moves.
//! 2. [`range_builder`] walks the sequence backward to build one
//!    [`live_range::LiveRange`] per virtual register.
//! 3. [`bundle_builder`] coalesces phi inputs and outputs that never
//!    overlap into a shared [`spill::LiveRangeBundle`].
//! 4. [`allocator`] runs linear-scan once per register bank.
//! 5. [`assigner`] merges compatible spill ranges into shared stack slots
//!    and rewrites every use position to its final operand.
//! 6. [`refmap`] populates reference maps at safepoints.
//! 7. [`connector`] inserts the moves that stitch sibling ranges and
//!    block-boundary control flow back together.

#![deny(missing_docs)]

pub mod allocator;
pub mod assigner;
pub mod bundle_builder;
pub mod connector;
pub mod constraint_builder;
pub mod data;
pub mod error;
pub mod iface;
pub mod interval;
pub mod live_range;
pub mod pipeline;
pub mod position;
pub mod range_builder;
pub mod refmap;
pub mod spill;
pub mod use_pos;

pub use crate::allocator::AllocatorOptions;
pub use crate::data::AllocationData;
pub use crate::error::{RegallocError, RegallocResult};
pub use crate::iface::{
    Frame, Instruction, InstructionBlock, InstructionSequence, NeverAbort, Operand, OperandSlot,
    Phi, RegisterConfiguration, RegisterKind, TickCounter, VReg,
};
pub use crate::pipeline::allocate_registers;

/// Version of this crate, for embedders that record it alongside compiled
/// artifacts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
