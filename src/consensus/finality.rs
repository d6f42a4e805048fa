// Finality tracking
//
// Finality advances once validators holding enough of the total stake
// have produced blocks above the finalized height, counting each
// validator once, at a height at least `finality_min_depth` behind the tip.
// The finalized snapshot is rebuilt forward from the previous snapshot,
// never from genesis.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::config::{ConsensusConfig, normalize_fraction};
use crate::consensus::chain::{ChainError, apply_block};
use crate::consensus::fork_choice::Evaluation;
use crate::consensus::state::{ChainState, Ledger, Snapshot};
use crate::primitives::block::{Block, short_hash};

const DEFAULT_STAKE_THRESHOLD: f64 = 0.67;

/// Heights below finality for which equivocation records are retained.
pub const EQUIVOCATION_RETENTION: u64 = 64;

/// Replays canonical blocks from the finalized snapshot up to
/// `target_height` and returns the resulting snapshot.
pub fn snapshot_at_height(
    config: &ConsensusConfig,
    state: &ChainState,
    target_height: u64,
) -> Result<Snapshot, ChainError> {
    let mut ledger = match &state.finalized_snapshot {
        Some(snapshot) => snapshot.ledger.clone(),
        None => state.ledger.clone(),
    };
    let base_height = ledger.tip().map(|b| b.index);

    for block in &state.ledger.blocks {
        if base_height.is_some_and(|h| block.index <= h) {
            continue;
        }
        if block.index > target_height {
            break;
        }
        apply_block(config, &mut ledger, block)?;
    }
    ledger.blocks.retain(|b| b.index <= target_height);
    Ok(Snapshot::new(ledger))
}

/// Highest height the evaluated chain can finalize, if above the current
/// finalized height.
fn finality_candidate(
    state: &ChainState,
    evaluation: &Evaluation,
    config: &ConsensusConfig,
) -> Option<(u64, String)> {
    let current = state.finalized_height();
    let tip_height = evaluation.chain().last()?.index;
    let limit = tip_height.checked_sub(config.finality_min_depth)?;
    if limit <= current {
        return None;
    }

    let fraction = normalize_fraction(config.finality_stake_threshold, DEFAULT_STAKE_THRESHOLD);
    let threshold = evaluation.ledger.total_stake() as f64 * fraction;
    let mut seen = HashSet::new();
    let mut observed: u128 = 0;
    let mut found = None;

    for block in evaluation.chain() {
        if block.index <= current {
            continue;
        }
        if block.index > limit {
            break;
        }
        if seen.insert(block.validator.as_str()) {
            observed += evaluation.validator_stakes.get(&block.hash).copied().unwrap_or(0) as u128;
        }
        if observed as f64 >= threshold {
            found = Some((block.index, block.hash.clone()));
        }
    }
    found
}

/// Advances finality after `evaluation` has been committed to `state`.
/// Returns the new finalized height when it moved. On error finality is
/// left unchanged.
pub fn update_finalization(
    state: &mut ChainState,
    evaluation: &Evaluation,
    config: &ConsensusConfig,
) -> Result<Option<u64>, ChainError> {
    let Some((height, hash)) = finality_candidate(state, evaluation, config) else {
        return Ok(None);
    };

    let snapshot = snapshot_at_height(config, state, height)?;
    info!(
        height,
        hash = %short_hash(&hash),
        snapshot = %short_hash(&snapshot.hash),
        "finality advanced"
    );
    state.finalized_height = Some(height);
    state.finalized_hash = Some(hash);
    state.finalized_snapshot = Some(snapshot);
    evict_stale(state);
    Ok(Some(height))
}

/// Drops fork blocks that can no longer become canonical and equivocation
/// records too far below finality to matter.
pub fn evict_stale(state: &mut ChainState) {
    let finalized = state.finalized_height();
    let ledger = &state.ledger;
    let before = state.block_index.len();
    state
        .block_index
        .retain(|_, block| block.index > finalized || ledger_has(ledger, block));
    let evicted = before - state.block_index.len();

    let horizon = finalized.saturating_sub(EQUIVOCATION_RETENTION);
    for heights in state.equivocations.values_mut() {
        heights.retain(|h, _| *h >= horizon);
    }
    state.equivocations.retain(|_, heights| !heights.is_empty());

    if evicted > 0 {
        debug!(evicted, finalized, "evicted non-canonical blocks");
    }
}

fn ledger_has(ledger: &Ledger, block: &Block) -> bool {
    usize::try_from(block.index)
        .ok()
        .and_then(|i| ledger.blocks.get(i))
        .is_some_and(|b| b.hash == block.hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::consensus::chain::create_block_on;
    use crate::consensus::fork_choice::evaluate_chain;
    use crate::consensus::genesis::initialize_state;
    use crate::primitives::account::Account;

    fn config(stakes: &[(&str, u64)], min_depth: u64, threshold: f64) -> ConsensusConfig {
        let mut config = ConsensusConfig::with_chain_id("bulencoin-test");
        config.finality_min_depth = min_depth;
        config.finality_stake_threshold = threshold;
        for (addr, stake) in stakes {
            config.genesis_allocations.insert(
                addr.to_string(),
                Account {
                    stake: *stake,
                    ..Account::default()
                },
            );
        }
        config
    }

    /// Extends the canonical chain directly, bypassing fork choice.
    fn extend(config: &ConsensusConfig, state: &mut ChainState, validator: &str) -> Evaluation {
        let parent = Arc::clone(state.ledger.tip().unwrap());
        let block = Arc::new(create_block_on(
            config,
            Some(&*parent),
            validator,
            vec![],
            None,
            parent.index + 1,
        ));
        state.block_index.insert(block.hash.clone(), Arc::clone(&block));
        let eval = evaluate_chain(config, state, &block.hash).unwrap();
        state.ledger = eval.ledger.clone();
        state.best_tip_hash = Some(eval.tip_hash.clone());
        eval
    }

    #[test]
    fn test_two_validators_finalize_with_half_threshold() {
        let config = config(&[("val1", 40), ("val2", 100)], 0, 0.5);
        let mut state = initialize_state(&config);

        let eval = extend(&config, &mut state, "val1");
        assert_eq!(update_finalization(&mut state, &eval, &config).unwrap(), None);
        assert_eq!(state.finalized_height(), 0);

        let eval = extend(&config, &mut state, "val2");
        assert_eq!(update_finalization(&mut state, &eval, &config).unwrap(), Some(2));
        assert_eq!(state.finalized_hash.as_deref(), Some(eval.tip_hash.as_str()));
        let snap = state.finalized_snapshot.as_ref().unwrap();
        assert_eq!(snap.height(), 2);
        assert_eq!(snap.hash, snap.ledger.content_hash());
    }

    #[test]
    fn test_min_depth_holds_finality_back() {
        let config = config(&[("val1", 100)], 2, 0.67);
        let mut state = initialize_state(&config);
        for expected in [None, None, Some(1), Some(2)] {
            let eval = extend(&config, &mut state, "val1");
            assert_eq!(update_finalization(&mut state, &eval, &config).unwrap(), expected);
        }
    }

    #[test]
    fn test_single_validator_counted_once() {
        // val1 alone holds 40 of 140; repeated blocks never reach 0.5
        let config = config(&[("val1", 40), ("val2", 100)], 0, 0.5);
        let mut state = initialize_state(&config);
        for _ in 0..5 {
            let eval = extend(&config, &mut state, "val1");
            assert_eq!(update_finalization(&mut state, &eval, &config).unwrap(), None);
        }
        assert_eq!(state.finalized_height(), 0);
    }

    #[test]
    fn test_snapshot_replays_from_previous_snapshot() {
        let config = config(&[("val1", 100)], 0, 0.5);
        let mut state = initialize_state(&config);
        let eval = extend(&config, &mut state, "val1");
        update_finalization(&mut state, &eval, &config).unwrap();
        extend(&config, &mut state, "val1");
        extend(&config, &mut state, "val1");

        let snap = snapshot_at_height(&config, &state, 2).unwrap();
        assert_eq!(snap.height(), 2);
        assert_eq!(snap.ledger.blocks.len(), 3);
        assert_eq!(snap.ledger.blocks[2].hash, state.ledger.blocks[2].hash);
    }

    #[test]
    fn test_eviction_keeps_canonical_and_recent() {
        let config = config(&[("val1", 100)], 0, 0.5);
        let mut state = initialize_state(&config);
        let genesis = Arc::clone(&state.ledger.blocks[0]);
        let stale = Arc::new(create_block_on(&config, Some(&*genesis), "val2", vec![], None, 99));
        state.block_index.insert(stale.hash.clone(), Arc::clone(&stale));
        state
            .equivocations
            .entry("old".into())
            .or_default()
            .insert(0, "h".into());

        let eval = extend(&config, &mut state, "val1");
        update_finalization(&mut state, &eval, &config).unwrap();
        assert_eq!(state.finalized_height(), 1);
        assert!(!state.block_index.contains_key(&stale.hash));
        assert!(state.block_index.contains_key(&genesis.hash));
        // height 0 is still within the retention window
        assert!(state.equivocations.contains_key("old"));
    }
}
