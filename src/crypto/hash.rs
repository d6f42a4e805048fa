// Cryptographic Hashing Wrappers
use serde::Serialize;
use sha2::{Digest, Sha256};
use sha3::Sha3_256;

/// SHA-256: block hashes, snapshot hashes and address derivation
pub fn hash_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA3-256: transaction ids
pub fn hash_sha3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Canonical byte encoding shared by hashing and signature payloads.
///
/// Struct fields serialize in declaration order and every map in the crate
/// is a `BTreeMap`, so the output is deterministic across nodes.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    // plain derive(Serialize) data with string keys cannot fail to encode
    serde_json::to_vec(value).unwrap_or_default()
}

/// Hex SHA-256 of the canonical encoding of `value`.
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> String {
    hex::encode(hash_sha256(&canonical_bytes(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_sha256_length() {
        let hash = hash_sha256(b"bulencoin");
        assert_eq!(hash.len(), 32);
    }

    #[test]
    fn test_sha3_256_differs_from_sha256() {
        assert_ne!(hash_sha3_256(b"bulencoin"), hash_sha256(b"bulencoin"));
    }

    #[test]
    fn test_canonical_hash_ignores_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("zeta", 1u64);
        a.insert("alpha", 2u64);
        let mut b = BTreeMap::new();
        b.insert("alpha", 2u64);
        b.insert("zeta", 1u64);
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
        assert_eq!(canonical_hash(&a).len(), 64);
    }
}
