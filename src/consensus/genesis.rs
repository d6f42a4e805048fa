// Genesis block definition
//
// The genesis block has no previous hash, no transactions and is stamped
// with the configured genesis timestamp, so every node on a chain derives
// the same genesis hash. Initial balances and stakes come from the
// configured allocations.

use std::sync::Arc;

use tracing::info;

use crate::config::ConsensusConfig;
use crate::consensus::engine::ensure_consensus_state;
use crate::consensus::state::{ChainState, Ledger, ensure_account};
use crate::primitives::block::{Block, GENESIS_VALIDATOR, MonetarySummary};

pub fn genesis_block(config: &ConsensusConfig) -> Block {
    let mut block = Block {
        index: 0,
        previous_hash: None,
        chain_id: config.chain_id.clone(),
        timestamp: config.genesis_timestamp,
        validator: GENESIS_VALIDATOR.to_string(),
        transactions: vec![],
        monetary: MonetarySummary::default(),
        producer_public_key: None,
        producer_signature: None,
        hash: String::new(),
    };
    block.seal();
    block
}

/// Appends the genesis block and seeds allocations. No-op when the ledger
/// already holds any block. Returns whether genesis was created.
pub fn create_genesis_block(config: &ConsensusConfig, ledger: &mut Ledger) -> bool {
    if !ledger.blocks.is_empty() {
        return false;
    }
    for (address, allocation) in &config.genesis_allocations {
        let account = ensure_account(ledger, address);
        account.balance = account.balance.saturating_add(allocation.balance);
        account.stake = account.stake.saturating_add(allocation.stake);
        account.nonce = account.nonce.max(allocation.nonce);
        account.reputation += allocation.reputation;
    }
    let block = genesis_block(config);
    info!(hash = %block.short_hash(), chain_id = %config.chain_id, "created genesis block");
    ledger.blocks.push(Arc::new(block));
    true
}

/// Fresh chain state with genesis applied and consensus bookkeeping seeded.
pub fn initialize_state(config: &ConsensusConfig) -> ChainState {
    let mut state = ChainState::new(&config.chain_id);
    create_genesis_block(config, &mut state.ledger);
    ensure_consensus_state(&mut state);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::account::Account;

    #[test]
    fn test_genesis_block_structure() {
        let config = ConsensusConfig::default();
        let genesis = genesis_block(&config);
        assert_eq!(genesis.index, 0);
        assert!(genesis.previous_hash.is_none());
        assert_eq!(genesis.validator, "genesis");
        assert!(genesis.transactions.is_empty());
        assert!(genesis.has_valid_hash());
    }

    #[test]
    fn test_genesis_is_deterministic_per_chain() {
        let a = genesis_block(&ConsensusConfig::with_chain_id("chain-a"));
        let b = genesis_block(&ConsensusConfig::with_chain_id("chain-a"));
        let c = genesis_block(&ConsensusConfig::with_chain_id("chain-b"));
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_create_genesis_is_idempotent() {
        let mut config = ConsensusConfig::default();
        config.genesis_allocations.insert(
            "val1".into(),
            Account {
                balance: 100,
                stake: 50,
                ..Account::default()
            },
        );
        let mut ledger = Ledger::new(&config.chain_id);
        assert!(create_genesis_block(&config, &mut ledger));
        assert!(!create_genesis_block(&config, &mut ledger));
        assert_eq!(ledger.blocks.len(), 1);
        assert_eq!(ledger.account("val1").stake, 50);
        assert_eq!(ledger.account("val1").balance, 100);
    }

    #[test]
    fn test_initialize_state_seeds_finality() {
        let config = ConsensusConfig::default();
        let state = initialize_state(&config);
        let genesis = genesis_block(&config);
        assert_eq!(state.finalized_height, Some(0));
        assert_eq!(state.finalized_hash.as_deref(), Some(genesis.hash.as_str()));
        assert_eq!(state.best_tip_hash.as_deref(), Some(genesis.hash.as_str()));
        assert!(state.block_index.contains_key(&genesis.hash));
        assert_eq!(state.finalized_snapshot.as_ref().map(|s| s.height()), Some(0));
    }
}
