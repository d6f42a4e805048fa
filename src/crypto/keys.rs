// Key Derivation and Address Management
use std::fs;
use std::path::Path;

use crate::crypto::dilithium::{self, CryptoError, PublicKey, SecretKey};
use crate::crypto::hash::hash_sha256;

pub const ADDRESS_PREFIX: &str = "addr_";
/// Hex characters of SHA-256(public key) kept in an address.
pub const ADDRESS_HEX_CHARS: usize = 40;

/// Derives a Bulencoin address from a public key.
/// Rule: address = "addr_" + first 40 hex chars of SHA-256(public_key)
pub fn derive_address(pk: &PublicKey) -> String {
    let digest = hex::encode(hash_sha256(&pk.0));
    format!("{ADDRESS_PREFIX}{}", &digest[..ADDRESS_HEX_CHARS])
}

/// Same rule applied to a hex-encoded key as carried on the wire.
pub fn derive_address_from_hex(public_key_hex: &str) -> Result<String, CryptoError> {
    Ok(derive_address(&PublicKey::from_hex(public_key_hex)?))
}

const SEED_BYTES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum IdentityFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Identity seed file corrupted")]
    Corrupted,
    #[error("{0}")]
    Crypto(#[from] CryptoError),
}

/// Signing identity of a node: producer key for blocks and handshakes.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub public_key: PublicKey,
    pub secret_key: SecretKey,
    pub address: String,
}

impl NodeIdentity {
    pub fn from_seed(seed: &[u8; 64]) -> Result<Self, CryptoError> {
        let (public_key, secret_key) = dilithium::generate_keypair(seed)?;
        let address = derive_address(&public_key);
        Ok(NodeIdentity {
            public_key,
            secret_key,
            address,
        })
    }

    /// Fresh identity from OS randomness.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = [0u8; 64];
        getrandom::getrandom(&mut seed).map_err(|_| CryptoError::KeyGeneration("RNG failure"))?;
        Self::from_seed(&seed)
    }

    pub fn public_key_hex(&self) -> String {
        self.public_key.to_hex()
    }

    /// Reads the hex seed at `path`, or writes a fresh one there, so the
    /// validator address stays stable across restarts.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityFileError> {
        if path.exists() {
            let text = fs::read_to_string(path)?;
            let bytes = hex::decode(text.trim()).map_err(|_| IdentityFileError::Corrupted)?;
            let seed: [u8; SEED_BYTES] =
                bytes.try_into().map_err(|_| IdentityFileError::Corrupted)?;
            return Ok(Self::from_seed(&seed)?);
        }

        let mut seed = [0u8; SEED_BYTES];
        getrandom::getrandom(&mut seed).map_err(|_| CryptoError::KeyGeneration("RNG failure"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, hex::encode(seed))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(Self::from_seed(&seed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_derivation() {
        let pk = PublicKey([1u8; 1952]);
        let addr = derive_address(&pk);
        assert!(addr.starts_with("addr_"));
        assert_eq!(addr.len(), ADDRESS_PREFIX.len() + ADDRESS_HEX_CHARS);
        assert_eq!(derive_address_from_hex(&pk.to_hex()).unwrap(), addr);
    }

    #[test]
    fn test_identity_file_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.seed");
        let first = NodeIdentity::load_or_create(&path).unwrap();
        let second = NodeIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.address, second.address);

        fs::write(&path, "zz").unwrap();
        assert!(matches!(
            NodeIdentity::load_or_create(&path),
            Err(IdentityFileError::Corrupted)
        ));
    }

    #[test]
    fn test_identity_address_matches_key() {
        let id = NodeIdentity::from_seed(&[9u8; 64]).unwrap();
        assert_eq!(id.address, derive_address(&id.public_key));
    }
}
