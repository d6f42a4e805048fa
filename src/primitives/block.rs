// Data Structures: Block
use serde::{Deserialize, Serialize};

use super::account::Address;
use super::transaction::Transaction;
use crate::crypto::hash::canonical_hash;

/// Validator name stamped on the genesis block.
pub const GENESIS_VALIDATOR: &str = "genesis";

/// Fee and reward accounting declared by the producer and re-checked by
/// every node that applies the block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonetarySummary {
    pub total_fees: u64,
    pub burned: u64,
    pub ecosystem: u64,
    pub minted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    /// `None` only for genesis.
    pub previous_hash: Option<String>,
    pub chain_id: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub validator: Address,
    pub transactions: Vec<Transaction>,
    pub monetary: MonetarySummary,
    #[serde(default)]
    pub producer_public_key: Option<String>,
    #[serde(default)]
    pub producer_signature: Option<String>,
    pub hash: String,
}

/// Hashed view of a block: everything except the hash and the signature
/// over it.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BlockContent<'a> {
    index: u64,
    previous_hash: Option<&'a str>,
    chain_id: &'a str,
    timestamp: u64,
    validator: &'a str,
    transactions: &'a [Transaction],
    monetary: &'a MonetarySummary,
    producer_public_key: Option<&'a str>,
}

impl Block {
    /// Recomputes the content hash from the canonical fields.
    pub fn compute_hash(&self) -> String {
        canonical_hash(&BlockContent {
            index: self.index,
            previous_hash: self.previous_hash.as_deref(),
            chain_id: &self.chain_id,
            timestamp: self.timestamp,
            validator: &self.validator,
            transactions: &self.transactions,
            monetary: &self.monetary,
            producer_public_key: self.producer_public_key.as_deref(),
        })
    }

    /// Stamps the recomputed hash. Any existing producer signature no
    /// longer covers the block afterwards.
    pub fn seal(&mut self) {
        self.hash = self.compute_hash();
    }

    pub fn has_valid_hash(&self) -> bool {
        self.compute_hash() == self.hash
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_hash.is_none()
    }

    pub fn short_hash(&self) -> &str {
        short_hash(&self.hash)
    }
}

/// Hash prefix for log lines.
pub fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
