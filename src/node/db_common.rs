// Shared on-disk record types for the chain store.
// These types define the on-disk format and must remain stable.

use crate::consensus::state::ChainState;
use crate::crypto::hash::hash_sha256;

/// Tip and finality metadata kept beside the serialized state.
///
/// Serialization Format (append-only for forward compatibility):
///   [0..8]    tip height (LE u64)
///   [8..16]   best chain weight (LE u64)
///   [16..24]  finalized height (LE u64)
///   [24]      has_finalized_hash flag (0|1)
///   [25..27]  tip hash length (LE u16), then tip hash bytes
///   [..]      finalized hash length (LE u16), then bytes (only if flag == 1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipRecord {
    pub height: u64,
    pub weight: u64,
    pub hash: String,
    pub finalized_height: u64,
    pub finalized_hash: Option<String>,
}

impl TipRecord {
    /// Metadata for `state`, or `None` before genesis.
    pub fn from_state(state: &ChainState) -> Option<Self> {
        let tip = state.ledger.tip()?;
        Some(TipRecord {
            height: tip.index,
            weight: state.best_chain_weight,
            hash: tip.hash.clone(),
            finalized_height: state.finalized_height(),
            finalized_hash: state.finalized_hash.clone(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(27 + self.hash.len() + 66);
        b.extend_from_slice(&self.height.to_le_bytes());
        b.extend_from_slice(&self.weight.to_le_bytes());
        b.extend_from_slice(&self.finalized_height.to_le_bytes());
        b.push(u8::from(self.finalized_hash.is_some()));
        push_str(&mut b, &self.hash);
        if let Some(h) = &self.finalized_hash {
            push_str(&mut b, h);
        }
        b
    }

    pub fn from_bytes(d: &[u8]) -> Result<Self, &'static str> {
        if d.len() < 25 {
            return Err("tip record too short");
        }
        let height = read_u64(d, 0)?;
        let weight = read_u64(d, 8)?;
        let finalized_height = read_u64(d, 16)?;
        let has_finalized = match d[24] {
            0 => false,
            1 => true,
            _ => return Err("invalid finalized flag"),
        };

        let mut off = 25usize;
        let hash = read_str(d, &mut off)?;
        let finalized_hash = if has_finalized {
            Some(read_str(d, &mut off)?)
        } else {
            None
        };

        Ok(TipRecord {
            height,
            weight,
            hash,
            finalized_height,
            finalized_hash,
        })
    }
}

fn push_str(b: &mut Vec<u8>, s: &str) {
    // hashes are 64 hex chars; anything longer is truncated at u16::MAX
    let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
    b.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    b.extend_from_slice(bytes);
}

fn read_u64(d: &[u8], off: usize) -> Result<u64, &'static str> {
    d.get(off..off + 8)
        .and_then(|s| s.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or("truncated integer")
}

fn read_str(d: &[u8], off: &mut usize) -> Result<String, &'static str> {
    let len_bytes: [u8; 2] = d
        .get(*off..*off + 2)
        .and_then(|s| s.try_into().ok())
        .ok_or("truncated length")?;
    let len = u16::from_le_bytes(len_bytes) as usize;
    *off += 2;
    let raw = d.get(*off..*off + len).ok_or("truncated string")?;
    *off += len;
    String::from_utf8(raw.to_vec()).map_err(|_| "invalid utf-8")
}

/// Hex SHA-256 over the serialized state bytes.
pub fn state_checksum(bytes: &[u8]) -> String {
    hex::encode(hash_sha256(bytes))
}

/// Canonical height key: big endian so RocksDB iterates in height order.
pub fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}
