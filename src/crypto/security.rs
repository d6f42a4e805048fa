// Signature Verification and Peer Authentication
//
// Transaction signatures bind the sender address to the signing key, block
// producer signatures bind a block hash to its validator, and peer
// handshakes prove possession of either a node key or a shared token.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::ConsensusConfig;
use crate::crypto::dilithium::{self, PublicKey, SecretKey, Signature};
use crate::crypto::hash::canonical_hash;
use crate::crypto::keys::derive_address;
use crate::primitives::account::Account;
use crate::primitives::block::Block;
use crate::primitives::transaction::Transaction;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Missing publicKey or signature")]
    MissingSignature,
    #[error("Malformed publicKey")]
    MalformedPublicKey,
    #[error("Malformed signature")]
    MalformedSignature,
    #[error("From address does not match publicKey")]
    AddressMismatch,
    #[error("Transaction chainId mismatch")]
    ChainIdMismatch,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Nonce must be an integer")]
    MissingNonce,
    #[error("Invalid nonce (expected {expected}, got {got})")]
    UnexpectedNonce { expected: u64, got: u64 },
    #[error("Validator does not match producer key")]
    ProducerMismatch,
    #[error("Handshake chainId mismatch")]
    HandshakeChainMismatch,
    #[error("Invalid peer proof")]
    InvalidPeerProof,
}

fn decode_key_and_signature(
    public_key: Option<&str>,
    signature: Option<&str>,
) -> Result<(PublicKey, Signature), SignatureError> {
    let (Some(pk_hex), Some(sig_hex)) = (public_key, signature) else {
        return Err(SignatureError::MissingSignature);
    };
    let pk = PublicKey::from_hex(pk_hex).map_err(|_| SignatureError::MalformedPublicKey)?;
    let sig = Signature::from_hex(sig_hex).map_err(|_| SignatureError::MalformedSignature)?;
    Ok((pk, sig))
}

/// Signs a transaction in place with the current payload format.
pub fn sign_transaction(
    tx: &mut Transaction,
    chain_id: &str,
    public_key: &PublicKey,
    secret_key: &SecretKey,
) -> Result<(), dilithium::CryptoError> {
    tx.public_key = Some(public_key.to_hex());
    let sig = dilithium::sign(&tx.signing_payload(chain_id), secret_key)?;
    tx.signature = Some(sig.to_hex());
    Ok(())
}

/// Checks the sender's signature when the node requires signatures.
///
/// Either the current payload or the legacy one is accepted. Under the
/// authenticated path the nonce must be exactly `account.nonce + 1`.
pub fn verify_transaction_signature(
    config: &ConsensusConfig,
    account: &Account,
    tx: &Transaction,
) -> Result<(), SignatureError> {
    if !config.require_signatures {
        return Ok(());
    }

    let (pk, sig) = decode_key_and_signature(tx.public_key.as_deref(), tx.signature.as_deref())?;
    if derive_address(&pk) != tx.from {
        return Err(SignatureError::AddressMismatch);
    }
    if tx.chain_id.as_deref().is_some_and(|c| c != config.chain_id) {
        return Err(SignatureError::ChainIdMismatch);
    }

    let current = tx.signing_payload(&config.chain_id);
    if !dilithium::verify(&current, &sig, &pk)
        && !dilithium::verify(&tx.legacy_signing_payload(), &sig, &pk)
    {
        return Err(SignatureError::InvalidSignature);
    }

    let expected = account.nonce + 1;
    match tx.nonce {
        None => Err(SignatureError::MissingNonce),
        Some(got) if got != expected => Err(SignatureError::UnexpectedNonce { expected, got }),
        Some(_) => Ok(()),
    }
}

/// Attaches the producer key and signature. The key is part of the hashed
/// content, so the block is resealed before signing.
pub fn sign_block(
    block: &mut Block,
    public_key: &PublicKey,
    secret_key: &SecretKey,
) -> Result<(), dilithium::CryptoError> {
    block.producer_public_key = Some(public_key.to_hex());
    block.seal();
    let sig = dilithium::sign(block.hash.as_bytes(), secret_key)?;
    block.producer_signature = Some(sig.to_hex());
    Ok(())
}

/// Unsigned blocks pass only when `allow_unsigned_blocks` is set.
pub fn verify_producer_signature(config: &ConsensusConfig, block: &Block) -> bool {
    if block.producer_public_key.is_none() || block.producer_signature.is_none() {
        return config.allow_unsigned_blocks;
    }
    let Ok((pk, sig)) = decode_key_and_signature(
        block.producer_public_key.as_deref(),
        block.producer_signature.as_deref(),
    ) else {
        return false;
    };
    if derive_address(&pk) != block.validator {
        return false;
    }
    dilithium::verify(block.hash.as_bytes(), &sig, &pk)
}

// ---------------------------------------------------------------------------
// Peer handshakes
// ---------------------------------------------------------------------------

/// Handshake body sent by a node that authenticates with its own key.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub node_id: String,
    pub chain_id: String,
    pub nonce: String,
    pub public_key: String,
    pub signature: String,
}

fn handshake_payload(node_id: &str, chain_id: &str, nonce: &str) -> String {
    format!("{node_id}|{chain_id}|{nonce}")
}

pub fn create_handshake(
    node_id: &str,
    chain_id: &str,
    nonce: &str,
    public_key: &PublicKey,
    secret_key: &SecretKey,
) -> Result<HandshakeRequest, dilithium::CryptoError> {
    let sig = dilithium::sign(
        handshake_payload(node_id, chain_id, nonce).as_bytes(),
        secret_key,
    )?;
    Ok(HandshakeRequest {
        node_id: node_id.to_string(),
        chain_id: chain_id.to_string(),
        nonce: nonce.to_string(),
        public_key: public_key.to_hex(),
        signature: sig.to_hex(),
    })
}

pub fn verify_handshake(chain_id: &str, request: &HandshakeRequest) -> Result<(), SignatureError> {
    if request.chain_id != chain_id {
        return Err(SignatureError::HandshakeChainMismatch);
    }
    let (pk, sig) =
        decode_key_and_signature(Some(&request.public_key), Some(&request.signature))?;
    let payload = handshake_payload(&request.node_id, &request.chain_id, &request.nonce);
    if dilithium::verify(payload.as_bytes(), &sig, &pk) {
        Ok(())
    } else {
        Err(SignatureError::InvalidSignature)
    }
}

fn hmac_hex(token: &str, message: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(token.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Proof of the shared P2P token for token-authenticated deployments.
pub fn create_peer_proof(token: &str, node_id: &str, chain_id: &str, nonce: &str) -> String {
    hmac_hex(token, &handshake_payload(node_id, chain_id, nonce))
}

pub fn verify_peer_proof(
    token: &str,
    node_id: &str,
    chain_id: &str,
    nonce: &str,
    proof: &str,
) -> Result<(), SignatureError> {
    let mut mac = HmacSha256::new_from_slice(token.as_bytes())
        .map_err(|_| SignatureError::InvalidPeerProof)?;
    mac.update(handshake_payload(node_id, chain_id, nonce).as_bytes());
    let expected = hex::decode(proof).map_err(|_| SignatureError::InvalidPeerProof)?;
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::InvalidPeerProof)
}

/// Session token handed out after a successful token handshake.
pub fn create_session_token(token: &str, node_id: &str, chain_id: &str, nonce: &str) -> String {
    hmac_hex(token, &format!("session|{}", handshake_payload(node_id, chain_id, nonce)))
}

/// Deterministic server nonce for a peer, stable across restarts.
pub fn derive_server_nonce(local_identity: &str, peer_id: &str) -> String {
    #[derive(serde::Serialize)]
    struct Seed<'a> {
        seed: &'a str,
    }
    let seed = format!("{local_identity}:{peer_id}");
    let mut digest = canonical_hash(&Seed { seed: &seed });
    digest.truncate(32);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeIdentity;

    fn signed_config() -> ConsensusConfig {
        ConsensusConfig {
            chain_id: "bulencoin-test".into(),
            require_signatures: true,
            allow_unsigned_blocks: false,
            ..ConsensusConfig::default()
        }
    }

    fn signed_transfer(id: &NodeIdentity, nonce: u64) -> Transaction {
        let mut tx = Transaction::transfer(&id.address, "addr_bob", 10, 1).with_nonce(nonce);
        sign_transaction(&mut tx, "bulencoin-test", &id.public_key, &id.secret_key).unwrap();
        tx
    }

    #[test]
    fn test_signature_skipped_when_not_required() {
        let config = ConsensusConfig::default();
        let tx = Transaction::transfer("alice", "bob", 1, 0);
        assert!(verify_transaction_signature(&config, &Account::default(), &tx).is_ok());
    }

    #[test]
    fn test_valid_signature_and_exact_nonce() {
        let id = NodeIdentity::from_seed(&[3u8; 64]).unwrap();
        let config = signed_config();
        let tx = signed_transfer(&id, 1);
        assert!(verify_transaction_signature(&config, &Account::default(), &tx).is_ok());

        // strict nonce under the authenticated path
        let tx = signed_transfer(&id, 3);
        assert_eq!(
            verify_transaction_signature(&config, &Account::default(), &tx),
            Err(SignatureError::UnexpectedNonce { expected: 1, got: 3 })
        );
    }

    #[test]
    fn test_tampered_amount_rejected() {
        let id = NodeIdentity::from_seed(&[3u8; 64]).unwrap();
        let mut tx = signed_transfer(&id, 1);
        tx.amount = 1_000;
        assert_eq!(
            verify_transaction_signature(&signed_config(), &Account::default(), &tx),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn test_legacy_payload_accepted() {
        let id = NodeIdentity::from_seed(&[4u8; 64]).unwrap();
        let mut tx = Transaction::transfer(&id.address, "addr_bob", 10, 1).with_nonce(1);
        let sig = dilithium::sign(&tx.legacy_signing_payload(), &id.secret_key).unwrap();
        tx.public_key = Some(id.public_key_hex());
        tx.signature = Some(sig.to_hex());
        assert!(verify_transaction_signature(&signed_config(), &Account::default(), &tx).is_ok());
    }

    #[test]
    fn test_address_must_match_key() {
        let id = NodeIdentity::from_seed(&[5u8; 64]).unwrap();
        let mut tx = signed_transfer(&id, 1);
        tx.from = "addr_someone_else".into();
        assert_eq!(
            verify_transaction_signature(&signed_config(), &Account::default(), &tx),
            Err(SignatureError::AddressMismatch)
        );
    }

    #[test]
    fn test_foreign_chain_id_rejected() {
        let id = NodeIdentity::from_seed(&[5u8; 64]).unwrap();
        let mut tx = Transaction::transfer(&id.address, "addr_bob", 10, 1).with_nonce(1);
        tx.chain_id = Some("other-chain".into());
        sign_transaction(&mut tx, "other-chain", &id.public_key, &id.secret_key).unwrap();
        assert_eq!(
            verify_transaction_signature(&signed_config(), &Account::default(), &tx),
            Err(SignatureError::ChainIdMismatch)
        );
    }

    #[test]
    fn test_missing_signature() {
        let tx = Transaction::transfer("alice", "bob", 1, 0).with_nonce(1);
        assert_eq!(
            verify_transaction_signature(&signed_config(), &Account::default(), &tx),
            Err(SignatureError::MissingSignature)
        );
    }

    #[test]
    fn test_handshake_roundtrip() {
        let id = NodeIdentity::from_seed(&[6u8; 64]).unwrap();
        let req =
            create_handshake("node-a", "bulencoin-test", "abcd", &id.public_key, &id.secret_key)
                .unwrap();
        assert!(verify_handshake("bulencoin-test", &req).is_ok());
        assert_eq!(
            verify_handshake("other", &req),
            Err(SignatureError::HandshakeChainMismatch)
        );

        let mut forged = req.clone();
        forged.nonce = "ffff".into();
        assert_eq!(
            verify_handshake("bulencoin-test", &forged),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn test_peer_proof() {
        let proof = create_peer_proof("secret", "node-a", "chain", "n1");
        assert!(verify_peer_proof("secret", "node-a", "chain", "n1", &proof).is_ok());
        assert!(verify_peer_proof("wrong", "node-a", "chain", "n1", &proof).is_err());
        assert!(verify_peer_proof("secret", "node-a", "chain", "n2", &proof).is_err());
        assert_ne!(
            create_session_token("secret", "node-a", "chain", "n1"),
            proof
        );
    }

    #[test]
    fn test_server_nonce_is_deterministic() {
        let a = derive_server_nonce("node-a", "peer-1");
        assert_eq!(a, derive_server_nonce("node-a", "peer-1"));
        assert_ne!(a, derive_server_nonce("node-a", "peer-2"));
        assert_eq!(a.len(), 32);
    }
}
