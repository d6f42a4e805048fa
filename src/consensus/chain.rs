// Block construction, block application and monetary accounting
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{ConsensusConfig, normalize_fraction};
use crate::consensus::state::{
    Ledger, TxRejection, apply_transaction, ensure_account, validate_transaction,
};
use crate::primitives::block::{Block, MonetarySummary};
use crate::primitives::transaction::Transaction;

const DEFAULT_PRODUCER_FRACTION: f64 = 0.4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("Previous hash mismatch")]
    PreviousHashMismatch,
    #[error("Unexpected block height")]
    UnexpectedHeight,
    #[error("Block chainId mismatch")]
    ChainIdMismatch,
    #[error("Invalid block hash")]
    InvalidHash,
    #[error("Monetary summary mismatch")]
    MonetaryMismatch,
    #[error("{0}")]
    Ledger(#[from] TxRejection),
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplits {
    pub burned: u64,
    pub ecosystem: u64,
    pub validator: u64,
}

fn fraction_of(amount: u64, fraction: f64) -> u64 {
    // f64 -> u64 casts saturate
    (amount as f64 * fraction).floor() as u64
}

/// Splits collected fees into burned, ecosystem and validator shares.
/// The validator share takes whatever rounding leaves behind.
pub fn compute_fee_splits(config: &ConsensusConfig, total_fees: u64) -> FeeSplits {
    let burn = normalize_fraction(config.fee_burn_fraction, 0.0);
    let eco = normalize_fraction(config.fee_ecosystem_fraction, 0.0);
    let burned = fraction_of(total_fees, burn).min(total_fees);
    let ecosystem = fraction_of(total_fees, eco).min(total_fees - burned);
    FeeSplits {
        burned,
        ecosystem,
        validator: total_fees - burned - ecosystem,
    }
}

/// Expected monetary summary for a block carrying `transactions`.
pub fn compute_monetary(config: &ConsensusConfig, transactions: &[Transaction]) -> MonetarySummary {
    let total_fees = transactions
        .iter()
        .fold(0u64, |sum, tx| sum.saturating_add(tx.fee));
    let splits = compute_fee_splits(config, total_fees);
    MonetarySummary {
        total_fees,
        burned: splits.burned,
        ecosystem: splits.ecosystem,
        minted: if config.enable_protocol_rewards {
            config.block_reward
        } else {
            0
        },
    }
}

fn credit(ledger: &mut Ledger, address: &str, amount: u64) {
    if amount == 0 {
        return;
    }
    let account = ensure_account(ledger, address);
    account.balance = account.balance.saturating_add(amount);
}

/// Pays out fees actually collected by a block plus the minted reward.
///
/// The producer takes its configured fraction; the remainder is shared by
/// all stakers in proportion to stake, with integer dust going back to the
/// producer. With rewards disabled, collected fees are burned.
pub fn distribute_protocol_rewards(
    config: &ConsensusConfig,
    ledger: &mut Ledger,
    producer: &str,
    collected_fees: u64,
) {
    if !config.enable_protocol_rewards {
        ledger.fee_burned_total = ledger.fee_burned_total.saturating_add(collected_fees);
        return;
    }

    let splits = compute_fee_splits(config, collected_fees);
    let reward = config.block_reward;
    let pool = splits.validator.saturating_add(reward);
    let producer_fraction =
        normalize_fraction(config.block_producer_reward_fraction, DEFAULT_PRODUCER_FRACTION);
    let mut producer_portion = fraction_of(pool, producer_fraction).min(pool);
    let stake_pool = pool - producer_portion;

    let total_stake = ledger.total_stake();
    if stake_pool > 0 && total_stake > 0 {
        let shares: Vec<(String, u64)> = ledger
            .accounts
            .iter()
            .filter(|(_, acc)| acc.stake > 0)
            .map(|(addr, acc)| {
                let share = (stake_pool as u128 * acc.stake as u128 / total_stake) as u64;
                (addr.clone(), share)
            })
            .collect();
        let paid: u64 = shares.iter().map(|(_, s)| *s).sum();
        producer_portion += stake_pool - paid;
        for (addr, share) in shares {
            credit(ledger, &addr, share);
        }
    } else {
        producer_portion += stake_pool;
    }
    credit(ledger, producer, producer_portion);

    ledger.fee_burned_total = ledger.fee_burned_total.saturating_add(splits.burned);
    ledger.ecosystem_pool = ledger.ecosystem_pool.saturating_add(splits.ecosystem);
    ledger.minted_rewards_total = ledger.minted_rewards_total.saturating_add(reward);
}

/// Builds (but does not apply) a block on top of `parent`.
pub fn create_block_on(
    config: &ConsensusConfig,
    parent: Option<&Block>,
    validator: &str,
    transactions: Vec<Transaction>,
    producer_public_key: Option<String>,
    timestamp: u64,
) -> Block {
    let monetary = compute_monetary(config, &transactions);
    let mut block = Block {
        index: parent.map(|p| p.index + 1).unwrap_or(0),
        previous_hash: parent.map(|p| p.hash.clone()),
        chain_id: config.chain_id.clone(),
        timestamp,
        validator: validator.to_string(),
        transactions,
        monetary,
        producer_public_key,
        producer_signature: None,
        hash: String::new(),
    };
    block.seal();
    block
}

/// Builds the next block on the ledger tip, stamped with the current time.
pub fn create_block(
    config: &ConsensusConfig,
    ledger: &Ledger,
    validator: &str,
    transactions: Vec<Transaction>,
    producer_public_key: Option<String>,
) -> Block {
    create_block_on(
        config,
        ledger.tip().map(|b| b.as_ref()),
        validator,
        transactions,
        producer_public_key,
        now_ms(),
    )
}

/// Applies `block` on top of the ledger tip.
///
/// Transactions that no longer validate are skipped; the block is still
/// appended. On error the ledger may be partially updated, so callers apply
/// onto a working copy.
pub fn apply_block(
    config: &ConsensusConfig,
    ledger: &mut Ledger,
    block: &Arc<Block>,
) -> Result<(), ChainError> {
    if let Some(tip) = ledger.tip() {
        if block.previous_hash.as_deref() != Some(tip.hash.as_str()) {
            return Err(ChainError::PreviousHashMismatch);
        }
        if block.index != tip.index + 1 {
            return Err(ChainError::UnexpectedHeight);
        }
    }
    if block.chain_id != config.chain_id {
        return Err(ChainError::ChainIdMismatch);
    }
    if !block.has_valid_hash() {
        return Err(ChainError::InvalidHash);
    }
    if block.monetary != compute_monetary(config, &block.transactions) {
        return Err(ChainError::MonetaryMismatch);
    }

    let mut collected_fees = 0u64;
    for tx in &block.transactions {
        if validate_transaction(ledger, tx).is_err() {
            continue;
        }
        apply_transaction(ledger, tx)?;
        collected_fees = collected_fees.saturating_add(tx.fee);
    }

    distribute_protocol_rewards(config, ledger, &block.validator, collected_fees);
    ledger.blocks.push(Arc::clone(block));
    Ok(())
}
