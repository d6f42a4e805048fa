// Transaction Mempool
//
// In-memory pool of submitted transactions awaiting inclusion. Supports
// Replace-by-Fee on the same (sender, nonce) with a 10% bump, a fee floor
// and a size cap that evicts the cheapest entry. Entries are pruned once
// they appear in the canonical chain.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::config::DEFAULT_MEMPOOL_MAX_SIZE;
use crate::consensus::state::{Ledger, validate_transaction};
use crate::primitives::transaction::Transaction;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MempoolError {
    #[error("Transaction id missing")]
    MissingId,
    #[error("Duplicate transaction")]
    Duplicate,
    #[error("Fee below minimum ({min})")]
    FeeBelowMinimum { min: u64 },
    #[error("Replacement fee too low (need at least {required})")]
    ReplacementFeeTooLow { required: u64 },
    #[error("Mempool full")]
    PoolFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Added,
    /// Replaced the entry with this id.
    Replaced(String),
}

#[derive(Debug)]
pub struct Mempool {
    /// id -> transaction
    entries: HashMap<String, Transaction>,
    /// (sender, nonce) -> id, for Replace-by-Fee lookup
    by_sender_nonce: HashMap<(String, u64), String>,
    max_size: usize,
    min_fee: u64,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(DEFAULT_MEMPOOL_MAX_SIZE, 0)
    }
}

impl Mempool {
    pub fn new(max_size: usize, min_fee: u64) -> Self {
        Mempool {
            entries: HashMap::new(),
            by_sender_nonce: HashMap::new(),
            max_size: max_size.max(1),
            min_fee,
        }
    }

    fn min_replacement_fee(existing_fee: u64) -> u64 {
        existing_fee.saturating_add((existing_fee / 10).max(1))
    }

    fn remove_entry(&mut self, id: &str) -> Option<Transaction> {
        let tx = self.entries.remove(id)?;
        if let Some(nonce) = tx.nonce {
            let key = (tx.from.clone(), nonce);
            if self.by_sender_nonce.get(&key).is_some_and(|owner| owner == id) {
                self.by_sender_nonce.remove(&key);
            }
        }
        Some(tx)
    }

    /// Admits a transaction the caller has already validated.
    pub fn add(&mut self, tx: Transaction) -> Result<Admission, MempoolError> {
        if tx.id.is_empty() {
            return Err(MempoolError::MissingId);
        }
        if self.entries.contains_key(&tx.id) {
            return Err(MempoolError::Duplicate);
        }
        if tx.fee < self.min_fee {
            return Err(MempoolError::FeeBelowMinimum { min: self.min_fee });
        }

        let sender_nonce = tx.nonce.map(|n| (tx.from.clone(), n));
        let mut replaced = None;
        if let Some(key) = &sender_nonce
            && let Some(existing_id) = self.by_sender_nonce.get(key).cloned()
            && let Some(existing_fee) = self.entries.get(&existing_id).map(|t| t.fee)
        {
            let required = Self::min_replacement_fee(existing_fee);
            if tx.fee < required {
                return Err(MempoolError::ReplacementFeeTooLow { required });
            }
            self.remove_entry(&existing_id);
            replaced = Some(existing_id);
        }

        if replaced.is_none() && self.entries.len() >= self.max_size {
            let cheapest = self
                .entries
                .values()
                .min_by(|a, b| a.fee.cmp(&b.fee).then_with(|| b.id.cmp(&a.id)))
                .map(|t| (t.id.clone(), t.fee));
            match cheapest {
                Some((id, fee)) if fee < tx.fee => {
                    debug!(evicted = %id, fee, "mempool full, evicting cheapest");
                    self.remove_entry(&id);
                }
                _ => return Err(MempoolError::PoolFull),
            }
        }

        if let Some(key) = sender_nonce {
            self.by_sender_nonce.insert(key, tx.id.clone());
        }
        self.entries.insert(tx.id.clone(), tx);
        Ok(match replaced {
            Some(id) => Admission::Replaced(id),
            None => Admission::Added,
        })
    }

    /// Removes every transaction whose id is in `included`. Returns how
    /// many were removed.
    pub fn prune(&mut self, included: &HashSet<String>) -> usize {
        if included.is_empty() {
            return 0;
        }
        let hits: Vec<String> = self
            .entries
            .keys()
            .filter(|id| included.contains(*id))
            .cloned()
            .collect();
        for id in &hits {
            self.remove_entry(id);
        }
        hits.len()
    }

    /// Drops entries that no longer validate against `ledger`.
    pub fn evict_invalid(&mut self, ledger: &Ledger) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|tx| validate_transaction(ledger, tx).is_err())
            .map(|tx| tx.id.clone())
            .collect();
        for id in &stale {
            self.remove_entry(id);
        }
        stale
    }

    /// Up to `max_count` transactions for a block template, highest fee
    /// first. A sender's transactions keep ascending nonce order.
    pub fn select(&self, max_count: usize) -> Vec<Transaction> {
        let mut ranked: Vec<&Transaction> = self.entries.values().collect();
        ranked.sort_by(|a, b| b.fee.cmp(&a.fee).then_with(|| a.id.cmp(&b.id)));

        let mut per_sender: HashMap<&str, VecDeque<&Transaction>> = HashMap::new();
        for tx in ranked.iter().copied() {
            per_sender.entry(tx.from.as_str()).or_default().push_back(tx);
        }
        for queue in per_sender.values_mut() {
            queue
                .make_contiguous()
                .sort_by(|a, b| a.nonce.unwrap_or(u64::MAX).cmp(&b.nonce.unwrap_or(u64::MAX)));
        }

        ranked
            .iter()
            .filter_map(|tx| per_sender.get_mut(tx.from.as_str())?.pop_front())
            .take(max_count)
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Transaction> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn highest_pending_nonce(&self, sender: &str) -> Option<u64> {
        self.by_sender_nonce
            .keys()
            .filter(|(s, _)| s == sender)
            .map(|(_, n)| *n)
            .max()
    }
}
