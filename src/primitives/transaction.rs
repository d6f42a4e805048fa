// Data Structures: Transaction
use serde::{Deserialize, Serialize};

use super::account::Address;
use crate::crypto::hash::{canonical_bytes, hash_sha3_256};

pub const MAX_MEMO_CHARS: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxAction {
    #[default]
    Transfer,
    /// Moves balance into the sender's own stake.
    Stake,
    /// Moves stake back into the sender's own balance.
    Unstake,
}

/// A plain value transfer (or stake movement) with an optional memo.
/// Immutable once created; applies fully or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Opaque identity assigned by the submitting node.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub from: Address,
    /// Empty means absent; stake/unstake may leave it empty.
    #[serde(default)]
    pub to: Address,
    pub amount: u64,
    #[serde(default)]
    pub fee: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub action: TxAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    /// Unix milliseconds.
    #[serde(default)]
    pub timestamp: u64,
    /// Hex-encoded ML-DSA-65 key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Fields covered by the current signature scheme.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningPayload<'a> {
    chain_id: &'a str,
    from: &'a str,
    to: &'a str,
    amount: u64,
    fee: u64,
    nonce: Option<u64>,
    action: TxAction,
    memo: Option<&'a str>,
    timestamp: u64,
}

/// Payload accepted from older clients that signed fewer fields.
#[derive(Serialize)]
struct LegacySigningPayload<'a> {
    from: &'a str,
    to: &'a str,
    amount: u64,
    fee: u64,
    nonce: Option<u64>,
}

impl Transaction {
    pub fn transfer(from: &str, to: &str, amount: u64, fee: u64) -> Self {
        Transaction {
            id: String::new(),
            from: from.to_string(),
            to: to.to_string(),
            amount,
            fee,
            nonce: None,
            action: TxAction::Transfer,
            memo: None,
            chain_id: None,
            timestamp: 0,
            public_key: None,
            signature: None,
        }
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_action(mut self, action: TxAction) -> Self {
        self.action = action;
        self
    }

    /// Receiver of the credited amount: `to`, or the sender for stake moves.
    pub fn effective_to(&self) -> &str {
        if self.to.is_empty() { &self.from } else { &self.to }
    }

    /// Canonical bytes signed by the sender. `chain_id` is the transaction's
    /// own chain id when present, otherwise the verifying node's.
    pub fn signing_payload(&self, chain_id: &str) -> Vec<u8> {
        canonical_bytes(&SigningPayload {
            chain_id: self.chain_id.as_deref().unwrap_or(chain_id),
            from: &self.from,
            to: &self.to,
            amount: self.amount,
            fee: self.fee,
            nonce: self.nonce,
            action: self.action,
            memo: self.memo.as_deref(),
            timestamp: self.timestamp,
        })
    }

    pub fn legacy_signing_payload(&self) -> Vec<u8> {
        canonical_bytes(&LegacySigningPayload {
            from: &self.from,
            to: &self.to,
            amount: self.amount,
            fee: self.fee,
            nonce: self.nonce,
        })
    }

    /// SHA3-256 over the signed payload and signature. Used as the id when
    /// the submitter did not supply one.
    pub fn compute_id(&self, chain_id: &str) -> String {
        let mut buffer = self.signing_payload(chain_id);
        if let Some(sig) = &self.signature {
            buffer.extend_from_slice(sig.as_bytes());
        }
        format!("tx-{}", hex::encode(hash_sha3_256(&buffer)))
    }
}
