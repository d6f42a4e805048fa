// RocksDB-backed chain store
//
// Column Families:
// - "state"   : serialized chain state (accounts, canonical blocks, finality,
//               equivocation and slash records)
// - "blocks"  : block hash → block JSON, canonical and fork candidates
// - "heights" : height (BE u64) → canonical block hash
// - "meta"    : tip record, state checksum
//
// Every save is a single synced WriteBatch, so a crash leaves either the
// previous state or the new one.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch, WriteOptions};
use tracing::{debug, warn};

use super::db_common::{TipRecord, height_key, state_checksum};
use crate::consensus::state::ChainState;
use crate::primitives::block::Block;

const CF_STATE: &str = "state";
const CF_BLOCKS: &str = "blocks";
const CF_HEIGHTS: &str = "heights";
const CF_META: &str = "meta";

pub const KEY_STATE: &[u8] = b"chain_state";
pub const KEY_STATE_CHECKSUM: &[u8] = b"state_checksum";
pub const KEY_TIP: &[u8] = b"tip";

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Data corruption: {0}")]
    Corruption(&'static str),
    #[error("Column family not found: {0}")]
    MissingColumnFamily(&'static str),
}

#[derive(Clone)]
pub struct ChainStore {
    db: Arc<DB>,
}

impl std::fmt::Debug for ChainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl ChainStore {
    /// Opens or creates the store at `path`.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(32 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_wal_bytes_per_sync(1024 * 1024);
        opts.set_max_total_wal_size(128 * 1024 * 1024);
        opts.set_level_compaction_dynamic_level_bytes(true);

        let cfs = [CF_STATE, CF_BLOCKS, CF_HEIGHTS, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, opts.clone()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        debug!(path = %path.display(), "chain store opened");
        Ok(ChainStore { db: Arc::new(db) })
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, DbError> {
        self.db
            .cf_handle(name)
            .ok_or(DbError::MissingColumnFamily(name))
    }

    // ========== STATE ==========

    /// Persists `state` atomically.
    ///
    /// Blocks and height entries at or below the previously stored finalized
    /// height cannot have changed and are not rewritten.
    pub fn save_state(&self, state: &ChainState) -> Result<(), DbError> {
        let cf_state = self.cf(CF_STATE)?;
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let cf_heights = self.cf(CF_HEIGHTS)?;
        let cf_meta = self.cf(CF_META)?;

        let bytes = serde_json::to_vec(state)?;
        let checksum = state_checksum(&bytes);
        let stable_below = self.get_tip()?.map(|t| t.finalized_height).unwrap_or(0);

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_state, KEY_STATE, &bytes);
        batch.put_cf(cf_meta, KEY_STATE_CHECKSUM, checksum.as_bytes());

        for block in state.ledger.blocks.iter().filter(|b| b.index >= stable_below) {
            batch.put_cf(cf_blocks, block.hash.as_bytes(), serde_json::to_vec(block.as_ref())?);
            batch.put_cf(cf_heights, height_key(block.index), block.hash.as_bytes());
        }
        for block in state.block_index.values() {
            if !state.is_canonical(block) {
                batch.put_cf(cf_blocks, block.hash.as_bytes(), serde_json::to_vec(block.as_ref())?);
            }
        }

        match TipRecord::from_state(state) {
            Some(tip) => {
                // a heavier but shorter chain leaves stale heights above the tip
                if let Some(next) = tip.height.checked_add(1) {
                    batch.delete_range_cf(cf_heights, height_key(next), height_key(u64::MAX));
                }
                batch.put_cf(cf_meta, KEY_TIP, tip.to_bytes());
            }
            None => batch.delete_cf(cf_meta, KEY_TIP),
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Loads the stored state with its block index rebuilt, or `None` when
    /// nothing has been saved yet.
    pub fn load_state(&self) -> Result<Option<ChainState>, DbError> {
        let cf_state = self.cf(CF_STATE)?;
        let cf_meta = self.cf(CF_META)?;
        let cf_blocks = self.cf(CF_BLOCKS)?;

        let Some(bytes) = self.db.get_cf(cf_state, KEY_STATE)? else {
            return Ok(None);
        };
        match self.db.get_cf(cf_meta, KEY_STATE_CHECKSUM)? {
            Some(stored) if stored == state_checksum(&bytes).as_bytes() => {}
            Some(_) => warn!("state checksum mismatch, loading anyway"),
            None => warn!("state checksum missing"),
        }

        let mut state: ChainState = serde_json::from_slice(&bytes)?;
        for block in &state.ledger.blocks {
            state.block_index.insert(block.hash.clone(), Arc::clone(block));
        }

        let finalized = state.finalized_height();
        let mut forks = 0usize;
        for item in self.db.iterator_cf(cf_blocks, IteratorMode::Start) {
            let (_, value) = item?;
            let block: Block = serde_json::from_slice(&value)?;
            if block.index > finalized && !state.block_index.contains_key(&block.hash) {
                state.block_index.insert(block.hash.clone(), Arc::new(block));
                forks += 1;
            }
        }
        debug!(
            height = state.ledger.height(),
            forks,
            "chain state loaded"
        );
        Ok(Some(state))
    }

    // ========== BLOCKS ==========

    pub fn get_block(&self, hash: &str) -> Result<Option<Block>, DbError> {
        let cf = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(cf, hash.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn get_block_hash_by_height(&self, height: u64) -> Result<Option<String>, DbError> {
        let cf = self.cf(CF_HEIGHTS)?;
        match self.db.get_cf(cf, height_key(height))? {
            Some(data) => String::from_utf8(data)
                .map(Some)
                .map_err(|_| DbError::Corruption("invalid hash encoding")),
            None => Ok(None),
        }
    }

    // ========== METADATA ==========

    pub fn get_tip(&self) -> Result<Option<TipRecord>, DbError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, KEY_TIP)? {
            Some(data) => TipRecord::from_bytes(&data)
                .map(Some)
                .map_err(DbError::Corruption),
            None => Ok(None),
        }
    }

    pub fn get_chain_height(&self) -> Result<u64, DbError> {
        Ok(self.get_tip()?.map(|t| t.height).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusConfig;
    use crate::consensus::chain::create_block_on;
    use crate::consensus::genesis::initialize_state;
    use crate::primitives::account::Account;

    fn staked_state() -> (ConsensusConfig, ChainState) {
        let mut config = ConsensusConfig::with_chain_id("bulencoin-test");
        config.genesis_allocations.insert(
            "val1".into(),
            Account {
                balance: 500,
                stake: 100,
                ..Account::default()
            },
        );
        let state = initialize_state(&config);
        (config, state)
    }

    #[test]
    fn test_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        assert!(store.load_state().unwrap().is_none());
        assert!(store.get_tip().unwrap().is_none());
        assert_eq!(store.get_chain_height().unwrap(), 0);
        assert!(store.get_block("missing").unwrap().is_none());
    }

    #[test]
    fn test_state_roundtrip_restores_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        let (config, mut state) = staked_state();

        let genesis = Arc::clone(&state.ledger.blocks[0]);
        let fork = Arc::new(create_block_on(&config, Some(&*genesis), "val2", vec![], None, 7));
        state.block_index.insert(fork.hash.clone(), Arc::clone(&fork));
        state.slash_records.insert("val9:3".into());

        store.save_state(&state).unwrap();
        let loaded = store.load_state().unwrap().unwrap();

        assert_eq!(loaded.ledger, state.ledger);
        assert_eq!(loaded.finalized_snapshot, state.finalized_snapshot);
        assert_eq!(loaded.slash_records, state.slash_records);
        assert!(loaded.block_index.contains_key(&genesis.hash));
        assert!(loaded.block_index.contains_key(&fork.hash));
        assert_eq!(store.get_block(&fork.hash).unwrap().unwrap(), *fork);
        assert_eq!(
            store.get_block_hash_by_height(0).unwrap().as_deref(),
            Some(genesis.hash.as_str())
        );

        let tip = store.get_tip().unwrap().unwrap();
        assert_eq!(tip.hash, genesis.hash);
        assert_eq!(tip.finalized_height, 0);
    }

    #[test]
    fn test_reopen_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state) = staked_state();
        {
            let store = ChainStore::open(dir.path()).unwrap();
            store.save_state(&state).unwrap();
        }
        let store = ChainStore::open(dir.path()).unwrap();
        let loaded = store.load_state().unwrap().unwrap();
        assert_eq!(loaded.ledger.account("val1").stake, 100);
    }

    #[test]
    fn test_checksum_mismatch_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        let (_, state) = staked_state();
        store.save_state(&state).unwrap();

        let cf = store.cf(CF_META).unwrap();
        store.db.put_cf(cf, KEY_STATE_CHECKSUM, b"bogus").unwrap();
        assert!(store.load_state().unwrap().is_some());
    }

    #[test]
    fn test_shorter_tip_clears_stale_heights() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        let (config, mut state) = staked_state();

        let genesis = Arc::clone(&state.ledger.blocks[0]);
        let b1 = Arc::new(create_block_on(&config, Some(&*genesis), "val1", vec![], None, 1));
        let b2 = Arc::new(create_block_on(&config, Some(&*b1), "val1", vec![], None, 2));
        state.ledger.blocks.extend([Arc::clone(&b1), Arc::clone(&b2)]);
        store.save_state(&state).unwrap();
        assert!(store.get_block_hash_by_height(2).unwrap().is_some());

        state.ledger.blocks.truncate(2);
        store.save_state(&state).unwrap();
        assert!(store.get_block_hash_by_height(2).unwrap().is_none());
        assert_eq!(store.get_chain_height().unwrap(), 1);
    }
}
