// Consensus engine: the block acceptance state machine
//
// Every block, produced locally or received from a peer, enters through
// `handle_incoming_block`. The caller holds exclusive access to the
// context for the whole call; evaluation of the candidate and current
// tips runs in parallel, commit happens afterwards under the same borrow.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::ConsensusConfig;
use crate::consensus::chain::{ChainError, compute_monetary};
use crate::consensus::finality::update_finalization;
use crate::consensus::fork_choice::{Evaluation, evaluate_prepared, is_better_chain};
use crate::consensus::slashing::record_equivocation_and_slash;
use crate::consensus::state::{ChainState, Snapshot};
use crate::crypto::security::verify_producer_signature;
use crate::net::mempool::Mempool;
use crate::primitives::block::{Block, short_hash};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("Validator not allowed")]
    ValidatorNotAllowed,
    #[error("Invalid producer signature")]
    InvalidProducerSignature,
    #[error("Missing parent")]
    MissingParent,
    #[error("Unexpected height for parent")]
    UnexpectedParentHeight,
    #[error("Block hash mismatch")]
    BlockHashMismatch,
    #[error("Monetary summary mismatch")]
    MonetaryMismatch,
    #[error("Equivocation detected")]
    EquivocationDetected,
    #[error("Block is not allowed below finalized height")]
    BelowFinalized,
    #[error("Block already known")]
    AlreadyKnown,
    #[error("Unknown ancestor")]
    UnknownAncestor,
    #[error("Cycle detected")]
    CycleDetected,
    #[error("Exceeded ancestry search limit")]
    AncestrySearchLimit,
    #[error("Missing tip hash")]
    MissingTipHash,
    #[error("Not a better chain")]
    NotBetterChain,
    #[error("{0}")]
    Chain(#[from] ChainError),
}

impl ConsensusError {
    /// Rejections raised before any bookkeeping touched chain state.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ConsensusError::ValidatorNotAllowed
                | ConsensusError::InvalidProducerSignature
                | ConsensusError::MissingParent
                | ConsensusError::UnexpectedParentHeight
                | ConsensusError::BlockHashMismatch
                | ConsensusError::MonetaryMismatch
        )
    }
}

/// Where a block came from. Used for logging only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSource {
    Local,
    Peer(String),
}

impl fmt::Display for BlockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSource::Local => write!(f, "local"),
            BlockSource::Peer(peer) => write!(f, "peer:{peer}"),
        }
    }
}

/// Everything the engine mutates, owned by a single writer.
#[derive(Debug)]
pub struct NodeContext {
    pub config: ConsensusConfig,
    pub state: ChainState,
    pub mempool: Mempool,
}

impl NodeContext {
    pub fn new(config: ConsensusConfig, mut state: ChainState, mempool: Mempool) -> Self {
        ensure_consensus_state(&mut state);
        NodeContext {
            config,
            state,
            mempool,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Accepted {
    /// The new chain won without extending the previous tip.
    pub reorg: bool,
    /// Blocks newly canonical, ordered by height.
    pub new_blocks: Vec<Arc<Block>>,
    pub weight: u64,
    pub finalized_height: u64,
}

/// Fills in derived bookkeeping: block index, finality seed, finalized
/// snapshot and best tip. Calling it again changes nothing.
pub fn ensure_consensus_state(state: &mut ChainState) {
    for block in &state.ledger.blocks {
        state
            .block_index
            .entry(block.hash.clone())
            .or_insert_with(|| Arc::clone(block));
    }

    let tip = state.ledger.tip().cloned();
    if state.finalized_height.is_none() {
        state.finalized_height = Some(tip.as_ref().map(|b| b.index).unwrap_or(0));
    }
    if state.finalized_hash.is_none()
        && let Some(tip) = &tip
    {
        state.finalized_hash = Some(tip.hash.clone());
    }
    if state.finalized_snapshot.is_none() {
        let height = state.finalized_height();
        let mut ledger = state.ledger.clone();
        ledger.blocks.retain(|b| b.index <= height);
        state.finalized_snapshot = Some(Snapshot::new(ledger));
    }
    if state.best_tip_hash.is_none()
        && let Some(tip) = &tip
    {
        state.best_tip_hash = Some(tip.hash.clone());
    }
}

/// Validates `block`, updates equivocation records, and switches the
/// canonical chain when the block's chain wins fork choice.
pub fn handle_incoming_block(
    ctx: &mut NodeContext,
    block: Block,
    source: &BlockSource,
) -> Result<Accepted, ConsensusError> {
    let NodeContext {
        config,
        state,
        mempool,
    } = ctx;
    ensure_consensus_state(state);

    if !config.is_validator_allowed(&block.validator) {
        return Err(ConsensusError::ValidatorNotAllowed);
    }
    if !verify_producer_signature(config, &block) {
        warn!(source = %source, validator = %block.validator, "invalid producer signature");
        return Err(ConsensusError::InvalidProducerSignature);
    }

    let parent = block.previous_hash.as_deref().and_then(|h| state.block(h));
    if block.index > 0 && parent.is_none() {
        return Err(ConsensusError::MissingParent);
    }
    if let Some(parent) = parent
        && parent.index + 1 != block.index
    {
        return Err(ConsensusError::UnexpectedParentHeight);
    }
    if !block.has_valid_hash() {
        return Err(ConsensusError::BlockHashMismatch);
    }
    if block.monetary != compute_monetary(config, &block.transactions) {
        return Err(ConsensusError::MonetaryMismatch);
    }

    if record_equivocation_and_slash(state, &block, config) {
        warn!(
            source = %source,
            validator = %block.validator,
            height = block.index,
            hash = %block.short_hash(),
            "equivocating block rejected"
        );
        return Err(ConsensusError::EquivocationDetected);
    }

    if block.index <= state.finalized_height() {
        return Err(ConsensusError::BelowFinalized);
    }
    if state.is_canonical(&block) {
        return Err(ConsensusError::AlreadyKnown);
    }

    let block = Arc::new(block);
    state
        .block_index
        .insert(block.hash.clone(), Arc::clone(&block));

    let current_tip = state
        .best_tip_hash
        .clone()
        .or_else(|| state.ledger.tip().map(|b| b.hash.clone()));

    let view: &ChainState = state;
    let (candidate, current) = rayon::join(
        || evaluate_prepared(config, view, &block.hash),
        || {
            current_tip
                .as_deref()
                .and_then(|tip| evaluate_prepared(config, view, tip).ok())
        },
    );
    let candidate = candidate.inspect_err(|e| {
        debug!(hash = %block.short_hash(), reason = %e, "candidate evaluation failed");
    })?;

    let better = is_better_chain(Some(&candidate), current.as_ref());
    let extends_current =
        current_tip.is_some() && block.previous_hash.as_deref() == current_tip.as_deref();
    if !better && !extends_current {
        debug!(
            source = %source,
            hash = %block.short_hash(),
            weight = candidate.weight,
            "block indexed but not a better chain"
        );
        return Err(ConsensusError::NotBetterChain);
    }

    let new_blocks = commit(state, mempool, &candidate);
    let finalized_height = match update_finalization(state, &candidate, config) {
        Ok(_) => state.finalized_height(),
        Err(e) => {
            error!(error = %e, "finality snapshot rebuild failed, finality unchanged");
            state.finalized_height()
        }
    };

    let reorg = better && !extends_current;
    info!(
        source = %source,
        height = candidate.tip_height,
        hash = %short_hash(&candidate.tip_hash),
        validator = %block.validator,
        weight = candidate.weight,
        reorg,
        new_blocks = new_blocks.len(),
        finalized = finalized_height,
        "accepted block"
    );

    Ok(Accepted {
        reorg,
        new_blocks,
        weight: candidate.weight,
        finalized_height,
    })
}

/// Swaps the evaluated ledger in, prunes the mempool and returns the
/// blocks that were not canonical before.
fn commit(state: &mut ChainState, mempool: &mut Mempool, evaluation: &Evaluation) -> Vec<Arc<Block>> {
    let previous: HashSet<&str> = state.ledger.blocks.iter().map(|b| b.hash.as_str()).collect();
    let new_blocks: Vec<Arc<Block>> = evaluation
        .chain()
        .iter()
        .filter(|b| !previous.contains(b.hash.as_str()))
        .cloned()
        .collect();

    state.ledger = evaluation.ledger.clone();
    state.best_tip_hash = Some(evaluation.tip_hash.clone());
    state.best_chain_weight = evaluation.weight;

    let pruned = mempool.prune(&evaluation.included_tx_ids);
    if pruned > 0 {
        debug!(pruned, "pruned mempool");
    }
    new_blocks
}
