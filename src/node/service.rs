// Node service: the single-writer front door to the consensus core.
//
// All mutations go through one tokio Mutex around the NodeContext. A call
// that changes chain state persists it before the lock is released, so a
// caller that saw success will see the same state after a restart.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::db_rocksdb::{ChainStore, DbError};
use crate::config::{NodeConfig, NodeRole};
use crate::consensus::engine::{
    Accepted, BlockSource, ConsensusError, NodeContext, handle_incoming_block,
};
use crate::consensus::genesis::initialize_state;
use crate::consensus::state::{ChainState, TxRejection, validate_transaction};
use crate::crypto::dilithium::CryptoError;
use crate::crypto::keys::NodeIdentity;
use crate::crypto::security::{
    HandshakeRequest, SignatureError, create_handshake, create_session_token,
    derive_server_nonce, verify_handshake, verify_peer_proof, verify_transaction_signature,
};
use crate::net::mempool::{Mempool, MempoolError};
use crate::primitives::account::Account;
use crate::primitives::block::Block;
use crate::primitives::transaction::Transaction;
use crate::producer::producer::{ProduceError, produce_block};

const STORE_DIR: &str = "chaindb";

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("storage: {0}")]
    Db(#[from] DbError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Transaction(#[from] TxRejection),
    #[error("{0}")]
    Signature(#[from] SignatureError),
    #[error("{0}")]
    Mempool(#[from] MempoolError),
    #[error("{0}")]
    Consensus(#[from] ConsensusError),
    #[error("{0}")]
    Produce(#[from] ProduceError),
    #[error("{0}")]
    Crypto(#[from] CryptoError),
    #[error("stored chain {stored} does not match configured chain {configured}")]
    ChainMismatch { stored: String, configured: String },
    #[error("node has no signing identity")]
    NoIdentity,
    #[error("peer authentication required")]
    PeerAuthRequired,
}

/// Finality checkpoint as reported to peers and operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub finalized_height: u64,
    pub finalized_hash: Option<String>,
    pub snapshot_hash: Option<String>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<Mutex<NodeContext>>,
    store: Option<ChainStore>,
    identity: Option<Arc<NodeIdentity>>,
    config: Arc<NodeConfig>,
}

impl NodeHandle {
    /// Opens the on-disk store under `config.data_dir`, loading the saved
    /// chain or initializing genesis.
    pub fn open(config: NodeConfig, identity: Option<NodeIdentity>) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = ChainStore::open(&config.data_dir.join(STORE_DIR))?;

        let state = match store.load_state()? {
            Some(state) => {
                if state.ledger.chain_id != config.consensus.chain_id {
                    return Err(NodeError::ChainMismatch {
                        stored: state.ledger.chain_id,
                        configured: config.consensus.chain_id.clone(),
                    });
                }
                info!(
                    height = state.ledger.height(),
                    finalized = state.finalized_height(),
                    "restored chain state"
                );
                state
            }
            None => {
                let state = initialize_state(&config.consensus);
                store.save_state(&state)?;
                state
            }
        };

        Ok(Self::build(config, state, Some(store), identity))
    }

    /// Node without persistence, starting from genesis.
    pub fn in_memory(config: NodeConfig, identity: Option<NodeIdentity>) -> Self {
        let state = initialize_state(&config.consensus);
        Self::build(config, state, None, identity)
    }

    fn build(
        config: NodeConfig,
        state: ChainState,
        store: Option<ChainStore>,
        identity: Option<NodeIdentity>,
    ) -> Self {
        let mempool = Mempool::new(config.mempool_max_size, config.mempool_min_fee);
        let ctx = NodeContext::new(config.consensus.clone(), state, mempool);
        NodeHandle {
            inner: Arc::new(Mutex::new(ctx)),
            store,
            identity: identity.map(Arc::new),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn identity(&self) -> Option<&NodeIdentity> {
        self.identity.as_deref()
    }

    fn persist(&self, state: &ChainState) -> Result<(), NodeError> {
        if let Some(store) = &self.store {
            store.save_state(state)?;
        }
        Ok(())
    }

    // ========== TRANSACTIONS ==========

    /// Validates and admits a transaction to the mempool. Returns its id.
    pub async fn submit_transaction(&self, mut tx: Transaction) -> Result<String, NodeError> {
        let mut guard = self.inner.lock().await;
        let ctx = &mut *guard;

        if tx.id.is_empty() {
            tx.id = tx.compute_id(&ctx.config.chain_id);
        }
        validate_transaction(&ctx.state.ledger, &tx)?;
        let sender = ctx.state.ledger.account(&tx.from);
        verify_transaction_signature(&ctx.config, &sender, &tx)?;

        let id = tx.id.clone();
        let admission = ctx.mempool.add(tx)?;
        debug!(id = %id, ?admission, pending = ctx.mempool.len(), "transaction admitted");
        Ok(id)
    }

    // ========== BLOCKS ==========

    /// Runs a peer block through the engine. State is persisted whenever
    /// bookkeeping changed, including for rejected forks and equivocations.
    pub async fn submit_block(&self, block: Block, peer: &str) -> Result<Accepted, NodeError> {
        let mut guard = self.inner.lock().await;
        let ctx = &mut *guard;
        let result = handle_incoming_block(ctx, block, &BlockSource::Peer(peer.to_string()));
        match &result {
            Ok(_) => {
                ctx.mempool.evict_invalid(&ctx.state.ledger);
                self.persist(&ctx.state)?;
            }
            Err(e) if !e.is_structural() => self.persist(&ctx.state)?,
            Err(_) => {}
        }
        Ok(result?)
    }

    /// Produces one block from the mempool on the current tip.
    pub async fn produce_block(&self) -> Result<Accepted, NodeError> {
        let mut guard = self.inner.lock().await;
        let ctx = &mut *guard;
        let accepted = produce_block(
            ctx,
            &self.config.node_id,
            self.identity.as_deref(),
            self.config.max_block_transactions,
        )?;
        self.persist(&ctx.state)?;
        Ok(accepted)
    }

    /// Spawns the block production loop. Observers get no loop.
    pub fn run_producer(&self) -> Option<JoinHandle<()>> {
        if self.config.role != NodeRole::Validator {
            info!("observer role, block production disabled");
            return None;
        }
        let node = self.clone();
        let period = Duration::from_millis(self.config.block_interval_ms.max(1));
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if node.inner.lock().await.mempool.is_empty() {
                    continue;
                }
                match node.produce_block().await {
                    Ok(accepted) => debug!(
                        weight = accepted.weight,
                        finalized = accepted.finalized_height,
                        "producer slot filled"
                    ),
                    Err(e) => warn!(error = %e, "block production failed"),
                }
            }
        }))
    }

    // ========== QUERIES ==========

    pub async fn checkpoint(&self) -> Checkpoint {
        let ctx = self.inner.lock().await;
        Checkpoint {
            finalized_height: ctx.state.finalized_height(),
            finalized_hash: ctx.state.finalized_hash.clone(),
            snapshot_hash: ctx.state.finalized_snapshot.as_ref().map(|s| s.hash.clone()),
        }
    }

    pub async fn account(&self, address: &str) -> Account {
        self.inner.lock().await.state.ledger.account(address)
    }

    pub async fn tip(&self) -> Option<Arc<Block>> {
        self.inner.lock().await.state.ledger.tip().cloned()
    }

    pub async fn mempool_len(&self) -> usize {
        self.inner.lock().await.mempool.len()
    }

    /// Runs `f` against a read-only view of the chain state.
    pub async fn with_state<R>(&self, f: impl FnOnce(&ChainState) -> R) -> R {
        f(&self.inner.lock().await.state)
    }

    // ========== PEERS ==========

    /// Signed handshake for `nonce`, using the node identity.
    pub fn handshake(&self, nonce: &str) -> Result<HandshakeRequest, NodeError> {
        let id = self.identity.as_deref().ok_or(NodeError::NoIdentity)?;
        Ok(create_handshake(
            &self.config.node_id,
            &self.config.consensus.chain_id,
            nonce,
            &id.public_key,
            &id.secret_key,
        )?)
    }

    /// Nonce this node expects from `peer_id` in a token handshake.
    pub fn server_nonce(&self, peer_id: &str) -> String {
        derive_server_nonce(&self.config.node_id, peer_id)
    }

    /// Authenticates a peer by signed handshake or, on token deployments,
    /// by HMAC proof. Returns a session token when a shared token is set.
    pub fn authenticate_peer(
        &self,
        request: Option<&HandshakeRequest>,
        token_proof: Option<(&str, &str)>,
    ) -> Result<Option<String>, NodeError> {
        let chain_id = &self.config.consensus.chain_id;
        if let Some(request) = request {
            verify_handshake(chain_id, request)?;
            let session = self.config.p2p_token.as_deref().map(|token| {
                create_session_token(token, &request.node_id, chain_id, &request.nonce)
            });
            return Ok(session);
        }

        let (Some(token), Some((peer_id, proof))) = (self.config.p2p_token.as_deref(), token_proof)
        else {
            return Err(NodeError::PeerAuthRequired);
        };
        let nonce = self.server_nonce(peer_id);
        verify_peer_proof(token, peer_id, chain_id, &nonce, proof)?;
        Ok(Some(create_session_token(token, peer_id, chain_id, &nonce)))
    }
}
