// Chain state and ledger rules
//
// `Ledger` is the replayable part of the chain: canonical blocks, accounts
// and monetary counters. `ChainState` wraps it with the consensus
// bookkeeping (block index, equivocation records, finality).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::hash::canonical_hash;
use crate::primitives::account::{Account, Address};
use crate::primitives::block::Block;
use crate::primitives::transaction::{MAX_MEMO_CHARS, Transaction, TxAction};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxRejection {
    #[error("Missing from address")]
    MissingFrom,
    #[error("Missing to address")]
    MissingTo,
    #[error("Stake/unstake must target own account")]
    StakeTargetMismatch,
    #[error("Amount must be positive number")]
    NonPositiveAmount,
    #[error("Memo too long (max 256 chars)")]
    MemoTooLong,
    #[error("Transaction chainId mismatch")]
    ChainIdMismatch,
    #[error("Nonce must be greater than current account nonce")]
    StaleNonce,
    #[error("Amount overflow")]
    AmountOverflow,
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("Insufficient stake to unstake")]
    InsufficientStake,
    #[error("Insufficient balance for fee")]
    InsufficientFeeBalance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub chain_id: String,
    pub blocks: Vec<Arc<Block>>,
    pub accounts: BTreeMap<Address, Account>,
    pub fee_burned_total: u64,
    pub ecosystem_pool: u64,
    pub minted_rewards_total: u64,
}

impl Ledger {
    pub fn new(chain_id: &str) -> Self {
        Ledger {
            chain_id: chain_id.to_string(),
            ..Ledger::default()
        }
    }

    pub fn tip(&self) -> Option<&Arc<Block>> {
        self.blocks.last()
    }

    pub fn height(&self) -> u64 {
        self.tip().map(|b| b.index).unwrap_or(0)
    }

    /// Account by address; unknown addresses read as zeroed.
    pub fn account(&self, address: &str) -> Account {
        self.accounts.get(address).cloned().unwrap_or_default()
    }

    pub fn stake_of(&self, address: &str) -> u64 {
        self.accounts.get(address).map(|a| a.stake).unwrap_or(0)
    }

    pub fn total_stake(&self) -> u128 {
        self.accounts.values().map(|a| a.stake as u128).sum()
    }

    /// Balances plus stakes across all accounts.
    pub fn circulating_supply(&self) -> u128 {
        self.accounts
            .values()
            .map(|a| a.balance as u128 + a.stake as u128)
            .sum()
    }

    /// Content hash over chain id, blocks, accounts and counters.
    pub fn content_hash(&self) -> String {
        canonical_hash(self)
    }
}

/// Finalized replica of the ledger used as the replay base for fork
/// evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub ledger: Ledger,
    pub hash: String,
}

impl Snapshot {
    pub fn new(ledger: Ledger) -> Self {
        let hash = ledger.content_hash();
        Snapshot { ledger, hash }
    }

    pub fn height(&self) -> u64 {
        self.ledger.height()
    }

    pub fn rehash(&mut self) {
        self.hash = self.ledger.content_hash();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlashEvent {
    pub validator: Address,
    pub penalty: u64,
    pub reason: String,
    pub height: u64,
    /// Unix milliseconds.
    pub at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChainState {
    pub ledger: Ledger,
    /// Every known block by hash, canonical or not. Derived; rebuilt on load.
    #[serde(skip)]
    pub block_index: HashMap<String, Arc<Block>>,
    /// validator -> height -> first hash seen at that height
    pub equivocations: BTreeMap<Address, BTreeMap<u64, String>>,
    /// `validator:height` keys already slashed
    pub slash_records: BTreeSet<String>,
    pub slash_events: Vec<SlashEvent>,
    pub finalized_height: Option<u64>,
    pub finalized_hash: Option<String>,
    pub finalized_snapshot: Option<Snapshot>,
    pub best_tip_hash: Option<String>,
    pub best_chain_weight: u64,
}

impl ChainState {
    pub fn new(chain_id: &str) -> Self {
        ChainState {
            ledger: Ledger::new(chain_id),
            ..ChainState::default()
        }
    }

    /// Looks a block up in the index, falling back to the canonical list.
    pub fn block(&self, hash: &str) -> Option<&Arc<Block>> {
        self.block_index
            .get(hash)
            .or_else(|| self.ledger.blocks.iter().find(|b| b.hash == hash))
    }

    pub fn finalized_height(&self) -> u64 {
        self.finalized_height.unwrap_or(0)
    }

    pub fn is_canonical(&self, block: &Block) -> bool {
        usize::try_from(block.index)
            .ok()
            .and_then(|i| self.ledger.blocks.get(i))
            .is_some_and(|b| b.hash == block.hash)
    }
}

pub fn slash_key(validator: &str, height: u64) -> String {
    format!("{validator}:{height}")
}

/// Get-or-create with zeroed fields.
pub fn ensure_account<'a>(ledger: &'a mut Ledger, address: &str) -> &'a mut Account {
    ledger.accounts.entry(address.to_string()).or_default()
}

/// Checks a transaction against the ledger without touching it.
pub fn validate_transaction(ledger: &Ledger, tx: &Transaction) -> Result<(), TxRejection> {
    if tx.from.is_empty() {
        return Err(TxRejection::MissingFrom);
    }
    match tx.action {
        TxAction::Transfer if tx.to.is_empty() => return Err(TxRejection::MissingTo),
        TxAction::Stake | TxAction::Unstake if !tx.to.is_empty() && tx.to != tx.from => {
            return Err(TxRejection::StakeTargetMismatch);
        }
        _ => {}
    }
    if tx.amount == 0 {
        return Err(TxRejection::NonPositiveAmount);
    }
    if tx.memo.as_ref().is_some_and(|m| m.chars().count() > MAX_MEMO_CHARS) {
        return Err(TxRejection::MemoTooLong);
    }
    if tx.chain_id.as_ref().is_some_and(|c| *c != ledger.chain_id) {
        return Err(TxRejection::ChainIdMismatch);
    }

    let sender = ledger.accounts.get(&tx.from);
    let balance = sender.map(|a| a.balance).unwrap_or(0);
    let stake = sender.map(|a| a.stake).unwrap_or(0);
    let nonce = sender.map(|a| a.nonce).unwrap_or(0);

    if tx.nonce.is_some_and(|n| n <= nonce) {
        return Err(TxRejection::StaleNonce);
    }
    let total_cost = tx
        .amount
        .checked_add(tx.fee)
        .ok_or(TxRejection::AmountOverflow)?;

    match tx.action {
        TxAction::Transfer => {
            if balance < total_cost {
                return Err(TxRejection::InsufficientBalance);
            }
            if tx.to != tx.from {
                let receiver = ledger.accounts.get(&tx.to).map(|a| a.balance).unwrap_or(0);
                receiver
                    .checked_add(tx.amount)
                    .ok_or(TxRejection::AmountOverflow)?;
            }
        }
        TxAction::Stake => {
            if balance < total_cost {
                return Err(TxRejection::InsufficientBalance);
            }
            stake
                .checked_add(tx.amount)
                .ok_or(TxRejection::AmountOverflow)?;
        }
        TxAction::Unstake => {
            if stake < tx.amount {
                return Err(TxRejection::InsufficientStake);
            }
            if balance < tx.fee {
                return Err(TxRejection::InsufficientFeeBalance);
            }
            (balance - tx.fee)
                .checked_add(tx.amount)
                .ok_or(TxRejection::AmountOverflow)?;
        }
    }
    Ok(())
}

/// Re-validates, then moves funds and advances the sender nonce.
///
/// Callers validate first; an error here means the caller broke that order.
pub fn apply_transaction(ledger: &mut Ledger, tx: &Transaction) -> Result<(), TxRejection> {
    validate_transaction(ledger, tx)?;

    // validated above: none of the arithmetic below can wrap
    let total_cost = tx.amount + tx.fee;
    match tx.action {
        TxAction::Transfer => {
            ensure_account(ledger, &tx.from).balance -= total_cost;
            ensure_account(ledger, &tx.to).balance += tx.amount;
        }
        TxAction::Stake => {
            let sender = ensure_account(ledger, &tx.from);
            sender.balance -= total_cost;
            sender.stake += tx.amount;
        }
        TxAction::Unstake => {
            let sender = ensure_account(ledger, &tx.from);
            sender.stake -= tx.amount;
            sender.balance = sender.balance - tx.fee + tx.amount;
        }
    }

    let sender = ensure_account(ledger, &tx.from);
    if let Some(n) = tx.nonce {
        sender.nonce = sender.nonce.max(n);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded(address: &str, balance: u64) -> Ledger {
        let mut ledger = Ledger::new("bulencoin-test");
        ensure_account(&mut ledger, address).balance = balance;
        ledger
    }

    #[test]
    fn test_validate_does_not_create_accounts() {
        let ledger = funded("alice", 100);
        let tx = Transaction::transfer("alice", "bob", 10, 1);
        assert!(validate_transaction(&ledger, &tx).is_ok());
        assert!(!ledger.accounts.contains_key("bob"));
    }

    #[test]
    fn test_rejection_reasons() {
        let ledger = funded("alice", 100);
        let cases = [
            (Transaction::transfer("", "bob", 1, 0), TxRejection::MissingFrom),
            (Transaction::transfer("alice", "", 1, 0), TxRejection::MissingTo),
            (Transaction::transfer("alice", "bob", 0, 0), TxRejection::NonPositiveAmount),
            (Transaction::transfer("alice", "bob", 97, 4), TxRejection::InsufficientBalance),
            (
                Transaction::transfer("alice", "bob", u64::MAX, 1),
                TxRejection::AmountOverflow,
            ),
            (
                Transaction::transfer("alice", "bob", 1, 0).with_action(TxAction::Stake),
                TxRejection::StakeTargetMismatch,
            ),
            (
                Transaction::transfer("alice", "", 1, 0).with_action(TxAction::Unstake),
                TxRejection::InsufficientStake,
            ),
        ];
        for (tx, expected) in cases {
            assert_eq!(validate_transaction(&ledger, &tx), Err(expected));
        }

        let mut memo = Transaction::transfer("alice", "bob", 1, 0);
        memo.memo = Some("x".repeat(257));
        assert_eq!(validate_transaction(&ledger, &memo), Err(TxRejection::MemoTooLong));
        memo.memo = Some("é".repeat(256));
        assert!(validate_transaction(&ledger, &memo).is_ok());

        let mut foreign = Transaction::transfer("alice", "bob", 1, 0);
        foreign.chain_id = Some("other-chain".into());
        let err = validate_transaction(&ledger, &foreign).unwrap_err();
        assert!(err.to_string().contains("chainId"));
    }

    #[test]
    fn test_apply_transfer_and_nonce() {
        let mut ledger = funded("alice", 100);
        let tx = Transaction::transfer("alice", "bob", 10, 4).with_nonce(1);
        apply_transaction(&mut ledger, &tx).unwrap();
        assert_eq!(ledger.account("alice").balance, 86);
        assert_eq!(ledger.account("alice").nonce, 1);
        assert_eq!(ledger.account("bob").balance, 10);

        assert_eq!(apply_transaction(&mut ledger, &tx), Err(TxRejection::StaleNonce));
        assert_eq!(ledger.account("alice").balance, 86);
    }

    #[test]
    fn test_nonce_is_optional_and_never_decreases() {
        let mut ledger = funded("alice", 100);
        apply_transaction(&mut ledger, &Transaction::transfer("alice", "bob", 1, 0).with_nonce(5))
            .unwrap();
        apply_transaction(&mut ledger, &Transaction::transfer("alice", "bob", 1, 0)).unwrap();
        assert_eq!(ledger.account("alice").nonce, 5);
    }

    #[test]
    fn test_stake_and_unstake() {
        let mut ledger = funded("alice", 100);
        let stake = Transaction::transfer("alice", "", 60, 2).with_action(TxAction::Stake);
        apply_transaction(&mut ledger, &stake).unwrap();
        assert_eq!(ledger.account("alice").balance, 38);
        assert_eq!(ledger.account("alice").stake, 60);

        let unstake = Transaction::transfer("alice", "alice", 20, 1).with_action(TxAction::Unstake);
        apply_transaction(&mut ledger, &unstake).unwrap();
        assert_eq!(ledger.account("alice").balance, 57);
        assert_eq!(ledger.account("alice").stake, 40);
        assert_eq!(ledger.circulating_supply(), 97);
    }

    #[test]
    fn test_unstake_needs_fee_balance() {
        let mut ledger = funded("alice", 0);
        ensure_account(&mut ledger, "alice").stake = 50;
        let tx = Transaction::transfer("alice", "", 10, 1).with_action(TxAction::Unstake);
        assert_eq!(
            validate_transaction(&ledger, &tx),
            Err(TxRejection::InsufficientFeeBalance)
        );
    }

    #[test]
    fn test_snapshot_hash_tracks_content() {
        let mut ledger = funded("alice", 100);
        let snap = Snapshot::new(ledger.clone());
        assert_eq!(snap.hash, ledger.content_hash());
        ledger.fee_burned_total = 1;
        assert_ne!(snap.hash, ledger.content_hash());
    }
}
