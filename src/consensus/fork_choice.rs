// Fork evaluation and best-chain selection
//
// A candidate tip is scored by replaying its ancestry from the finalized
// snapshot. Live state is never touched: every evaluation owns its working
// ledger and is discarded unless the engine commits it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::ConsensusConfig;
use crate::consensus::chain::apply_block;
use crate::consensus::engine::{ConsensusError, ensure_consensus_state};
use crate::consensus::state::{ChainState, Ledger};
use crate::primitives::block::Block;

/// Result of replaying one candidate chain.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Cumulative stake weight of the blocks above the finalized height.
    pub weight: u64,
    pub tip_height: u64,
    pub tip_hash: String,
    /// Post-replay ledger; its `blocks` is the full candidate chain.
    pub ledger: Ledger,
    /// block hash -> weight the block contributed
    pub validator_stakes: HashMap<String, u64>,
    pub included_tx_ids: HashSet<String>,
}

impl Evaluation {
    pub fn chain(&self) -> &[Arc<Block>] {
        &self.ledger.blocks
    }

    fn rank(&self) -> (u64, u64, &str) {
        (self.weight, self.tip_height, self.tip_hash.as_str())
    }
}

/// Walks `previous_hash` links back from `tip_hash` through every known
/// block until genesis or the finalized block. Returns root-to-tip order.
pub fn collect_chain<'a>(
    state: &'a ChainState,
    tip_hash: &str,
    finalized_hash: Option<&str>,
) -> Result<Vec<&'a Arc<Block>>, ConsensusError> {
    let max_hops = state.ledger.blocks.len() + state.block_index.len() + 4;
    let mut path: Vec<&'a Arc<Block>> = Vec::new();
    let mut seen: HashSet<&'a str> = HashSet::new();
    let mut current: &str = tip_hash;

    loop {
        let block = state.block(current).ok_or(ConsensusError::UnknownAncestor)?;
        path.push(block);
        let Some(parent) = block.previous_hash.as_deref() else {
            break;
        };
        if finalized_hash == Some(block.hash.as_str()) {
            break;
        }
        if !seen.insert(block.hash.as_str()) {
            return Err(ConsensusError::CycleDetected);
        }
        current = parent;
        if path.len() > max_hops {
            return Err(ConsensusError::AncestrySearchLimit);
        }
    }

    path.reverse();
    Ok(path)
}

/// Initializes bookkeeping, then evaluates the chain ending at `tip_hash`.
pub fn evaluate_chain(
    config: &ConsensusConfig,
    state: &mut ChainState,
    tip_hash: &str,
) -> Result<Evaluation, ConsensusError> {
    ensure_consensus_state(state);
    evaluate_prepared(config, state, tip_hash)
}

/// Read-only evaluation over already-initialized state. Safe to run for
/// several tips in parallel.
pub fn evaluate_prepared(
    config: &ConsensusConfig,
    state: &ChainState,
    tip_hash: &str,
) -> Result<Evaluation, ConsensusError> {
    if tip_hash.is_empty() {
        return Err(ConsensusError::MissingTipHash);
    }

    let finalized_height = state.finalized_height();
    let chain = collect_chain(state, tip_hash, state.finalized_hash.as_deref())?;

    let mut working = match &state.finalized_snapshot {
        Some(snapshot) => snapshot.ledger.clone(),
        None => state.ledger.clone(),
    };
    let floor_weight = config.minimum_validator_weight.max(1);
    let mut weight = 0u64;
    let mut tip_height = finalized_height;
    let mut validator_stakes = HashMap::new();
    let mut included_tx_ids = HashSet::new();

    for block in &chain {
        if block.index <= finalized_height {
            tip_height = block.index;
            continue;
        }
        let contribution = working.stake_of(&block.validator).max(floor_weight);
        validator_stakes.insert(block.hash.clone(), contribution);
        weight = weight.saturating_add(contribution);

        apply_block(config, &mut working, block)?;
        tip_height = block.index;
        included_tx_ids.extend(
            block
                .transactions
                .iter()
                .filter(|tx| !tx.id.is_empty())
                .map(|tx| tx.id.clone()),
        );
    }

    let tip_hash = chain
        .last()
        .map(|b| b.hash.clone())
        .unwrap_or_else(|| tip_hash.to_string());

    Ok(Evaluation {
        weight,
        tip_height,
        tip_hash,
        ledger: working,
        validator_stakes,
        included_tx_ids,
    })
}

/// Total order used for fork choice: weight, then height, then tip hash.
/// An absent candidate never wins; any candidate beats an absent current.
pub fn is_better_chain(candidate: Option<&Evaluation>, current: Option<&Evaluation>) -> bool {
    match (candidate, current) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(cand), Some(cur)) => cand.rank() > cur.rank(),
    }
}
