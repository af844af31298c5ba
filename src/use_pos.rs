//! Use positions: point constraints pinned to a [`LifetimePosition`].

use cranelift_entity::{entity_impl, PrimaryMap};

use crate::iface::{OperandSlot, UsePositionType};
use crate::live_range::LiveRangeId;
use crate::position::LifetimePosition;

/// An index into a [`UsePosPool`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsePosId(u32);
entity_impl!(UsePosId, "up");

/// What a use position's register hint points at. Resolving a hint means
/// the pointed-to entity now has an assigned register; the hint's
/// `resolve` query then yields that register code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsePositionHint {
    /// No hint.
    None,
    /// A hint exists but has not been connected to anything concrete yet
    /// (used transiently while the range builder walks a gap move before
    /// it has seen the move's other side).
    Unresolved,
    /// Hints at another use position: once that use position's range has
    /// an assigned register, this use inherits it as a preference.
    AnotherUsePos(UsePosId),
    /// Hints at a register that is already fixed, independent of any
    /// range's assignment (e.g. a fixed-register move's destination).
    AlreadyAllocatedOperand(u16),
    /// Hints at a phi: once the phi's own range has an assigned register,
    /// this use inherits it.
    Phi(LiveRangeId),
}

/// A constraint pinned at a single [`LifetimePosition`].
#[derive(Clone, Copy, Debug)]
pub struct UsePosition {
    /// Where this use occurs.
    pub pos: LifetimePosition,
    /// The policy this use must satisfy once the range commits.
    pub ty: UsePositionType,
    /// Performance hint: does occupying a register (rather than a slot)
    /// at this position actually help? Never affects correctness.
    pub register_beneficial: bool,
    /// Where to rewrite the operand once the owning range is assigned.
    pub operand: OperandSlot,
    /// Optional register hint.
    pub hint: UsePositionHint,
    /// Next use position in ascending order, or `None` at the tail.
    pub next: Option<UsePosId>,
}

impl UsePosition {
    /// `true` if `ty` can only be satisfied by a register.
    pub fn requires_register(&self) -> bool {
        matches!(self.ty, UsePositionType::RequiresRegister)
    }

    /// `true` if `ty` can only be satisfied by a stack slot.
    pub fn requires_slot(&self) -> bool {
        matches!(self.ty, UsePositionType::RequiresSlot)
    }
}

/// Pool owning every [`UsePosition`] allocated for one allocation pass.
#[derive(Default)]
pub struct UsePosPool {
    positions: PrimaryMap<UsePosId, UsePosition>,
}

impl UsePosPool {
    /// A new, empty pool.
    pub fn new() -> Self {
        Self {
            positions: PrimaryMap::new(),
        }
    }

    /// Allocate a new use position.
    pub fn alloc(&mut self, pos: UsePosition) -> UsePosId {
        self.positions.push(pos)
    }

    /// Borrow a use position.
    pub fn get(&self, id: UsePosId) -> &UsePosition {
        &self.positions[id]
    }

    /// Mutably borrow a use position.
    pub fn get_mut(&mut self, id: UsePosId) -> &mut UsePosition {
        &mut self.positions[id]
    }

    /// Iterate a chain of use positions starting at `head`.
    pub fn iter_chain(&self, head: Option<UsePosId>) -> UsePosChainIter<'_> {
        UsePosChainIter {
            pool: self,
            cur: head,
        }
    }

    /// Resolve `hint` to a concrete register code, if possible, given the
    /// register currently assigned to the range each hint variant points
    /// at. `range_register` maps a [`LiveRangeId`] to its assigned register,
    /// if any.
    pub fn resolve_hint(
        &self,
        hint: UsePositionHint,
        range_register: impl Fn(LiveRangeId) -> Option<u16>,
    ) -> Option<u16> {
        match hint {
            UsePositionHint::None | UsePositionHint::Unresolved => None,
            UsePositionHint::AlreadyAllocatedOperand(reg) => Some(reg),
            UsePositionHint::AnotherUsePos(other) => {
                let other = self.get(other);
                match other.hint {
                    UsePositionHint::AlreadyAllocatedOperand(reg) => Some(reg),
                    UsePositionHint::Phi(range) => range_register(range),
                    _ => None,
                }
            }
            UsePositionHint::Phi(range) => range_register(range),
        }
    }
}

/// Iterator over a use-position chain.
pub struct UsePosChainIter<'a> {
    pool: &'a UsePosPool,
    cur: Option<UsePosId>,
}

impl<'a> Iterator for UsePosChainIter<'a> {
    type Item = (UsePosId, &'a UsePosition);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let up = self.pool.get(id);
        self.cur = up.next;
        Some((id, up))
    }
}
