//! Coalesces phi inputs and outputs into [`LiveRangeBundle`]s ahead of
//! allocation.

use crate::data::AllocationData;
use crate::iface::InstructionSequence;
use crate::live_range::LiveRangeId;
use crate::spill::LiveRangeBundle;

/// For every phi, try to union its output and each of its inputs into one
/// bundle: a register chosen for any member becomes a hint for all of them,
/// and the allocator may eventually place every member in the same
/// register without a move at the block boundary.
pub fn build_bundles(seq: &InstructionSequence, data: &mut AllocationData) {
    for block in &seq.blocks {
        for phi in &block.phis {
            let Some(output_range) = data.existing_range_for_vreg(phi.output) else {
                continue;
            };
            let bundle = data.bundles.alloc(LiveRangeBundle::singleton(output_range));
            data.arena.get_mut(output_range).bundle = Some(bundle);

            for &input_vreg in &phi.inputs {
                let Some(input_range) = data.existing_range_for_vreg(input_vreg) else {
                    continue;
                };
                try_add_to_bundle(data, bundle, input_range);
            }
        }
    }
}

fn try_add_to_bundle(data: &mut AllocationData, bundle: crate::spill::BundleId, candidate: LiveRangeId) {
    if data.arena.get(candidate).bundle.is_some() {
        // Already coalesced via an earlier phi (e.g. two phis sharing an
        // input on a critical edge); leave it with its first bundle.
        return;
    }
    if !data.bundles.get(bundle).compatible_with(candidate, &data.arena) {
        return;
    }
    data.bundles.get_mut(bundle).members.push(candidate);
    data.arena.get_mut(candidate).bundle = Some(bundle);
}
