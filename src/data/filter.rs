use std::collections::{BTreeMap, BTreeSet};

use super::model::Dataset;

// ---------------------------------------------------------------------------
// User inclusion flags
// ---------------------------------------------------------------------------

/// User rejection flags per block number: `(block rejected, rejected cycles)`.
/// Blocks absent from the map carry no flags.
pub type RejectionState = BTreeMap<usize, (bool, BTreeSet<usize>)>;

/// Capture the flags currently set on a dataset.
pub fn rejection_state(dataset: &Dataset) -> RejectionState {
    dataset
        .blocks
        .iter()
        .filter(|b| b.rejected || !b.rejected_cycles.is_empty())
        .map(|b| (b.number, (b.rejected, b.rejected_cycles.clone())))
        .collect()
}

/// Re-apply captured flags after blocks were reloaded. Flags for block
/// numbers that no longer exist are dropped; cycle positions past the end
/// of a block are ignored.
pub fn apply_rejections(dataset: &mut Dataset, state: &RejectionState) {
    for block in &mut dataset.blocks {
        if let Some((rejected, cycles)) = state.get(&block.number) {
            let count = block.cycle_count();
            block.rejected = *rejected;
            block.rejected_cycles = cycles.iter().copied().filter(|&c| c < count).collect();
        }
    }
}

/// Set or clear a block's rejection flag. Returns whether the flag changed;
/// `None` when no block has that number.
pub fn set_block_rejected(dataset: &mut Dataset, number: usize, rejected: bool) -> Option<bool> {
    let block = dataset.blocks.iter_mut().find(|b| b.number == number)?;
    let changed = block.rejected != rejected;
    block.rejected = rejected;
    Some(changed)
}

/// Set or clear one cycle's rejection flag. `None` when the block or the
/// cycle position does not exist.
pub fn set_cycle_rejected(
    dataset: &mut Dataset,
    number: usize,
    cycle: usize,
    rejected: bool,
) -> Option<bool> {
    let block = dataset.blocks.iter_mut().find(|b| b.number == number)?;
    if cycle >= block.cycle_count() {
        return None;
    }
    let changed = if rejected {
        block.rejected_cycles.insert(cycle)
    } else {
        block.rejected_cycles.remove(&cycle)
    };
    Some(changed)
}
