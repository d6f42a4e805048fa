// Block production: assemble template → sign → run through the engine.
// The produced block takes exactly the same acceptance path as a peer block.

use tracing::debug;

use crate::consensus::chain::create_block;
use crate::consensus::engine::{Accepted, BlockSource, ConsensusError, NodeContext, handle_incoming_block};
use crate::crypto::dilithium::CryptoError;
use crate::crypto::keys::NodeIdentity;
use crate::crypto::security::sign_block;

#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    #[error("block signing failed: {0}")]
    Signing(#[from] CryptoError),
    #[error("{0}")]
    Rejected(#[from] ConsensusError),
}

/// Builds a block on the current tip from up to `max_txs` mempool
/// transactions and submits it locally.
///
/// With an identity the block is signed and produced under the identity's
/// address; without one it is produced unsigned under `node_id`.
pub fn produce_block(
    ctx: &mut NodeContext,
    node_id: &str,
    identity: Option<&NodeIdentity>,
    max_txs: usize,
) -> Result<Accepted, ProduceError> {
    let evicted = ctx.mempool.evict_invalid(&ctx.state.ledger);
    if !evicted.is_empty() {
        debug!(count = evicted.len(), "dropped stale mempool entries before template");
    }

    let transactions = ctx.mempool.select(max_txs);
    let validator = identity.map(|id| id.address.as_str()).unwrap_or(node_id);
    let mut block = create_block(&ctx.config, &ctx.state.ledger, validator, transactions, None);
    if let Some(id) = identity {
        sign_block(&mut block, &id.public_key, &id.secret_key)?;
    }
    debug!(
        height = block.index,
        txs = block.transactions.len(),
        "produced block template"
    );

    Ok(handle_incoming_block(ctx, block, &BlockSource::Local)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusConfig;
    use crate::consensus::genesis::initialize_state;
    use crate::net::mempool::Mempool;
    use crate::primitives::account::Account;
    use crate::primitives::transaction::Transaction;

    fn context(config: ConsensusConfig) -> NodeContext {
        let state = initialize_state(&config);
        NodeContext::new(config, state, Mempool::default())
    }

    #[test]
    fn test_unsigned_production_includes_mempool() {
        let mut config = ConsensusConfig::with_chain_id("bulencoin-test");
        config.genesis_allocations.insert(
            "alice".into(),
            Account {
                balance: 100,
                ..Account::default()
            },
        );
        let mut ctx = context(config);
        let mut tx = Transaction::transfer("alice", "bob", 10, 2).with_nonce(1);
        tx.id = "tx-a".into();
        ctx.mempool.add(tx).unwrap();

        let accepted = produce_block(&mut ctx, "node-1", None, 10).unwrap();
        assert_eq!(accepted.new_blocks.len(), 1);
        let block = &accepted.new_blocks[0];
        assert_eq!(block.validator, "node-1");
        assert_eq!(block.transactions.len(), 1);
        assert!(ctx.mempool.is_empty());
        assert_eq!(ctx.state.ledger.account("bob").balance, 10);
    }

    #[test]
    fn test_signed_production_when_unsigned_disallowed() {
        let mut config = ConsensusConfig::with_chain_id("bulencoin-test");
        config.allow_unsigned_blocks = false;
        let mut ctx = context(config);
        let identity = NodeIdentity::from_seed(&[4u8; 64]).unwrap();

        assert!(matches!(
            produce_block(&mut ctx, "node-1", None, 10),
            Err(ProduceError::Rejected(ConsensusError::InvalidProducerSignature))
        ));
        let accepted = produce_block(&mut ctx, "node-1", Some(&identity), 10).unwrap();
        assert_eq!(accepted.new_blocks[0].validator, identity.address);
        assert!(accepted.new_blocks[0].producer_signature.is_some());
    }
}
