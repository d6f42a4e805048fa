// ML-DSA-65 (Dilithium3) Digital Signatures - NIST FIPS 204
//
// Used for transaction signatures, block producer signatures and peer
// handshakes.
//
// Key sizes:
//   Public key  : 1,952 bytes
//   Secret key  : 4,032 bytes
//   Signature   : 3,309 bytes

use fips204::ml_dsa_65;
use fips204::traits::{SerDes, Signer, Verifier};
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;

pub const DILITHIUM3_PUBKEY_BYTES: usize = 1952;
pub const DILITHIUM3_PRIVKEY_BYTES: usize = 4032;
pub const DILITHIUM3_SIG_BYTES: usize = 3309;

/// Domain separation context passed to every sign/verify call.
const SIGNING_CONTEXT: &[u8] = b"bulencoin";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(&'static str),
    #[error("signing failed: {0}")]
    Signing(&'static str),
    #[error("invalid key encoding")]
    InvalidKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub [u8; DILITHIUM3_PUBKEY_BYTES]);

impl PublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidKey)?;
        let arr: [u8; DILITHIUM3_PUBKEY_BYTES] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(PublicKey(arr))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({} bytes)", DILITHIUM3_PUBKEY_BYTES)
    }
}

#[derive(Clone)]
pub struct SecretKey(pub [u8; DILITHIUM3_PRIVKEY_BYTES]);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub [u8; DILITHIUM3_SIG_BYTES]);

impl Signature {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidSignature)?;
        let arr: [u8; DILITHIUM3_SIG_BYTES] =
            bytes.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Signature(arr))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({} bytes)", DILITHIUM3_SIG_BYTES)
    }
}

/// Generates an ML-DSA-65 keypair deterministically from a 64-byte seed.
///
/// The first 32 bytes seed a ChaCha20 RNG, so the same seed always yields
/// the same node identity.
pub fn generate_keypair(seed: &[u8; 64]) -> Result<(PublicKey, SecretKey), CryptoError> {
    let mut seed_32 = [0u8; 32];
    seed_32.copy_from_slice(&seed[0..32]);
    let mut rng = ChaCha20Rng::from_seed(seed_32);

    let (fips_pk, fips_sk) =
        ml_dsa_65::try_keygen_with_rng(&mut rng).map_err(CryptoError::KeyGeneration)?;

    Ok((PublicKey(fips_pk.into_bytes()), SecretKey(fips_sk.into_bytes())))
}

/// Signs a message with an ML-DSA-65 detached signature.
pub fn sign(message: &[u8], sk: &SecretKey) -> Result<Signature, CryptoError> {
    let key = ml_dsa_65::PrivateKey::try_from_bytes(sk.0).map_err(|_| CryptoError::InvalidKey)?;
    let sig = key
        .try_sign(message, SIGNING_CONTEXT)
        .map_err(CryptoError::Signing)?;
    Ok(Signature(sig))
}

/// Verifies an ML-DSA-65 detached signature.
/// Returns false on any malformed input.
pub fn verify(message: &[u8], sig: &Signature, pk: &PublicKey) -> bool {
    let key = match ml_dsa_65::PublicKey::try_from_bytes(pk.0) {
        Ok(k) => k,
        Err(_) => return false,
    };
    key.verify(message, &sig.0, SIGNING_CONTEXT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let (pk, sk) = generate_keypair(&[0u8; 64]).unwrap();
        let msg = b"bulencoin genesis";
        let sig = sign(msg, &sk).unwrap();
        assert!(verify(msg, &sig, &pk), "valid signature must verify");
    }

    #[test]
    fn test_wrong_message_fails() {
        let (pk, sk) = generate_keypair(&[0u8; 64]).unwrap();
        let sig = sign(b"correct message", &sk).unwrap();
        assert!(!verify(b"wrong message", &sig, &pk));
    }

    #[test]
    fn test_wrong_key_fails() {
        let (_pk1, sk1) = generate_keypair(&[0u8; 64]).unwrap();
        let (pk2, _sk2) = generate_keypair(&[1u8; 64]).unwrap();
        let sig = sign(b"test", &sk1).unwrap();
        assert!(!verify(b"test", &sig, &pk2));
    }

    #[test]
    fn test_corrupted_signature_rejected() {
        let (pk, sk) = generate_keypair(&[0u8; 64]).unwrap();
        let msg = b"bulencoin";
        let mut sig = sign(msg, &sk).unwrap();
        sig.0[100] ^= 0xFF;
        assert!(!verify(msg, &sig, &pk), "corrupted signature must fail");
    }

    #[test]
    fn test_deterministic_keygen() {
        let (pk1, sk1) = generate_keypair(&[42u8; 64]).unwrap();
        let (pk2, sk2) = generate_keypair(&[42u8; 64]).unwrap();
        assert_eq!(pk1.0, pk2.0, "Same seed must produce same public key");
        assert_eq!(sk1.0, sk2.0, "Same seed must produce same secret key");

        let (pk3, _sk3) = generate_keypair(&[43u8; 64]).unwrap();
        assert_ne!(pk1.0, pk3.0, "Different seeds must produce different keys");
    }

    #[test]
    fn test_hex_roundtrip_rejects_wrong_length() {
        let (pk, _sk) = generate_keypair(&[7u8; 64]).unwrap();
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(Signature::from_hex("zz").is_err());
    }
}
