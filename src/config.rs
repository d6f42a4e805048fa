use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::primitives::account::{Account, UNITS_PER_BLN};

/// Default chain identifier
pub const DEFAULT_CHAIN_ID: &str = "bulencoin-devnet";

/// Genesis timestamp: Jan 1 2023 00:00:00 UTC, in milliseconds
pub const DEFAULT_GENESIS_TIMESTAMP_MS: u64 = 1_672_531_200_000;

/// Data directory name under $HOME
pub const DATA_DIR: &str = ".bulencoin/devnet";

pub const DEFAULT_BLOCK_INTERVAL_MS: u64 = 4_000;
pub const DEFAULT_MAX_BLOCK_TRANSACTIONS: usize = 500;
pub const DEFAULT_MEMPOOL_MAX_SIZE: usize = 5_000;

/// Every knob the consensus and chain engines read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsensusConfig {
    pub chain_id: String,
    /// Floor weight a block contributes even from a zero-stake validator.
    pub minimum_validator_weight: u64,
    /// Fraction of stake removed on equivocation.
    pub slash_penalty: f64,
    /// Blocks a height must sit behind the tip before it can finalize.
    pub finality_min_depth: u64,
    /// Fraction of total stake that must have produced blocks above the
    /// finalized height for finality to advance.
    pub finality_stake_threshold: f64,
    pub enable_protocol_rewards: bool,
    /// Minted per block, in base units.
    pub block_reward: u64,
    pub fee_burn_fraction: f64,
    pub fee_ecosystem_fraction: f64,
    pub block_producer_reward_fraction: f64,
    pub require_signatures: bool,
    pub allow_unsigned_blocks: bool,
    /// Empty means any validator may produce.
    pub validator_allowlist: Vec<String>,
    pub genesis_timestamp: u64,
    pub genesis_allocations: BTreeMap<String, Account>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            chain_id: DEFAULT_CHAIN_ID.to_string(),
            minimum_validator_weight: 1,
            slash_penalty: 0.25,
            finality_min_depth: 2,
            finality_stake_threshold: 0.67,
            enable_protocol_rewards: false,
            block_reward: 0,
            fee_burn_fraction: 0.0,
            fee_ecosystem_fraction: 0.0,
            block_producer_reward_fraction: 0.4,
            require_signatures: false,
            allow_unsigned_blocks: true,
            validator_allowlist: Vec::new(),
            genesis_timestamp: DEFAULT_GENESIS_TIMESTAMP_MS,
            genesis_allocations: BTreeMap::new(),
        }
    }
}

impl ConsensusConfig {
    pub fn with_chain_id(chain_id: &str) -> Self {
        ConsensusConfig {
            chain_id: chain_id.to_string(),
            ..ConsensusConfig::default()
        }
    }

    pub fn is_validator_allowed(&self, validator: &str) -> bool {
        self.validator_allowlist.is_empty() || self.validator_allowlist.iter().any(|v| v == validator)
    }
}

/// Clamps a configured fraction to [0, 1]; negative or NaN values fall back.
pub fn normalize_fraction(value: f64, fallback: f64) -> f64 {
    if value.is_nan() || value < 0.0 {
        fallback
    } else {
        value.min(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Validator,
    Observer,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid node role: {0}")]
    InvalidRole(String),
}

impl std::str::FromStr for NodeRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "validator" => Ok(NodeRole::Validator),
            "observer" => Ok(NodeRole::Observer),
            other => Err(ConfigError::InvalidRole(other.to_string())),
        }
    }
}

/// Daemon settings around the consensus core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub node_id: String,
    pub role: NodeRole,
    pub block_interval_ms: u64,
    pub max_block_transactions: usize,
    pub mempool_max_size: usize,
    /// Minimum fee, in base units, for mempool admission.
    pub mempool_min_fee: u64,
    pub p2p_token: Option<String>,
    pub consensus: ConsensusConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        NodeConfig {
            data_dir: PathBuf::from(home).join(DATA_DIR),
            node_id: "bulen-node".to_string(),
            role: NodeRole::Validator,
            block_interval_ms: DEFAULT_BLOCK_INTERVAL_MS,
            max_block_transactions: DEFAULT_MAX_BLOCK_TRANSACTIONS,
            mempool_max_size: DEFAULT_MEMPOOL_MAX_SIZE,
            mempool_min_fee: 0,
            p2p_token: None,
            consensus: ConsensusConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Defaults overridden by `BULEN_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source. Values that do
    /// not parse keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = NodeConfig::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("BULEN_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("BULEN_NODE_ID") {
            cfg.node_id = v;
        }
        if let Some(role) = get("BULEN_NODE_ROLE").and_then(|v| v.parse().ok()) {
            cfg.role = role;
        }
        parse_into(&get, "BULEN_BLOCK_INTERVAL_MS", &mut cfg.block_interval_ms);
        parse_into(&get, "BULEN_MAX_BLOCK_TRANSACTIONS", &mut cfg.max_block_transactions);
        parse_into(&get, "BULEN_MEMPOOL_MAX_SIZE", &mut cfg.mempool_max_size);
        parse_into(&get, "BULEN_MEMPOOL_MIN_FEE", &mut cfg.mempool_min_fee);
        if let Some(v) = get("BULEN_P2P_TOKEN") {
            cfg.p2p_token = Some(v);
        }

        let c = &mut cfg.consensus;
        if let Some(v) = get("BULEN_CHAIN_ID") {
            c.chain_id = v;
        }
        parse_into(&get, "BULEN_MINIMUM_VALIDATOR_WEIGHT", &mut c.minimum_validator_weight);
        parse_into(&get, "BULEN_SLASH_PENALTY", &mut c.slash_penalty);
        parse_into(&get, "BULEN_FINALITY_MIN_DEPTH", &mut c.finality_min_depth);
        parse_into(&get, "BULEN_FINALITY_STAKE_THRESHOLD", &mut c.finality_stake_threshold);
        parse_bool_into(&get, "BULEN_ENABLE_PROTOCOL_REWARDS", &mut c.enable_protocol_rewards);
        parse_into(&get, "BULEN_BLOCK_REWARD", &mut c.block_reward);
        parse_into(&get, "BULEN_FEE_BURN_FRACTION", &mut c.fee_burn_fraction);
        parse_into(&get, "BULEN_FEE_ECOSYSTEM_FRACTION", &mut c.fee_ecosystem_fraction);
        parse_into(
            &get,
            "BULEN_BLOCK_PRODUCER_REWARD_FRACTION",
            &mut c.block_producer_reward_fraction,
        );
        parse_bool_into(&get, "BULEN_REQUIRE_SIGNATURES", &mut c.require_signatures);
        parse_bool_into(&get, "BULEN_ALLOW_UNSIGNED_BLOCKS", &mut c.allow_unsigned_blocks);
        if let Some(v) = get("BULEN_VALIDATOR_ALLOWLIST") {
            c.validator_allowlist = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        parse_into(&get, "BULEN_GENESIS_TIMESTAMP", &mut c.genesis_timestamp);
        cfg
    }

    /// Mempool fee floor expressed in whole coins, for display.
    pub fn mempool_min_fee_bln(&self) -> f64 {
        self.mempool_min_fee as f64 / UNITS_PER_BLN as f64
    }
}

fn parse_into<G, T>(get: &G, key: &str, slot: &mut T)
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(parsed) = get(key).and_then(|v| v.parse().ok()) {
        *slot = parsed;
    }
}

fn parse_bool_into<G>(get: &G, key: &str, slot: &mut bool)
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "on") => *slot = true,
        Some("0" | "false" | "no" | "off") => *slot = false,
        _ => {}
    }
}
