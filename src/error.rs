//! Recoverable failure modes of the allocator.
//!
//! Almost every failure mode described by the algorithm is a programmer
//! error: an invalid interval chain, a double assignment, a split at a
//! block boundary. Those are all `debug_assert!`s scattered through the
//! relevant modules, not `Result`s, because there is nothing a caller can
//! do about them other than fix the bug that produced them. The two
//! exceptions are a genuine missing definition (the embedder may want to
//! bail out of compiling this one function) and a cooperative abort
//! requested through the `TickCounter` callback.

use thiserror::Error;

use crate::iface::VReg;

/// Everything that can cause [`crate::pipeline::allocate_registers`] to
/// return early without having produced a full assignment.
#[derive(Debug, Error)]
pub enum RegallocError {
    /// A virtual register was used before any definition reaches it along
    /// every path into the entry block. Detected by the post-build scan of
    /// the entry block's live-in set.
    #[error("virtual register {vreg} is used without a reaching definition")]
    UseWithoutDefinition {
        /// The offending virtual register.
        vreg: VReg,
    },

    /// The surrounding compiler asked to stop via [`crate::iface::TickCounter`].
    /// The allocation data is left in a partial but consistent state; the
    /// embedder is expected to discard it rather than resume.
    #[error("register allocation aborted by tick counter")]
    Aborted,
}

/// Shorthand used throughout the crate for the two recoverable failure
/// modes above.
pub type RegallocResult<T> = Result<T, RegallocError>;
