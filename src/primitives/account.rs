// Data Structures: Account
use serde::{Deserialize, Serialize};

/// Base units per whole coin. Amounts are integers in base units, which is
/// how fractional coin amounts are represented.
pub const UNITS_PER_BLN: u64 = 1_000_000;

pub type Address = String;

/// Per-address ledger entry. Created lazily on first reference, never deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub balance: u64,
    /// Consensus weight.
    pub stake: u64,
    /// Last applied transaction sequence number.
    pub nonce: u64,
    /// Decreases on slashing.
    pub reputation: i64,
}
