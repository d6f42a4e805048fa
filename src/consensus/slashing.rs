// Equivocation detection and slashing
use tracing::warn;

use crate::config::{ConsensusConfig, normalize_fraction};
use crate::consensus::chain::now_ms;
use crate::consensus::state::{ChainState, SlashEvent, ensure_account, slash_key};
use crate::primitives::block::Block;

const DEFAULT_SLASH_PENALTY: f64 = 0.25;

/// Stake removed from `stake` by a slash: ceil(stake * fraction).
pub fn slash_amount(stake: u64, fraction: f64) -> u64 {
    ((stake as f64 * fraction).ceil() as u64).min(stake)
}

/// Reputation lost per slash: max(1, ceil(fraction * 10)).
pub fn reputation_penalty(fraction: f64) -> i64 {
    ((fraction * 10.0).ceil() as i64).max(1)
}

/// Cuts the validator's stake and reputation in the live ledger and in
/// the finalized snapshot, then records the event.
pub fn slash_validator(
    state: &mut ChainState,
    validator: &str,
    config: &ConsensusConfig,
    reason: String,
    height: u64,
) -> SlashEvent {
    let fraction = normalize_fraction(config.slash_penalty, DEFAULT_SLASH_PENALTY);
    let rep_drop = reputation_penalty(fraction);

    let account = ensure_account(&mut state.ledger, validator);
    let penalty = slash_amount(account.stake, fraction);
    account.stake -= penalty;
    account.reputation -= rep_drop;

    if let Some(snapshot) = state.finalized_snapshot.as_mut() {
        let snap_account = ensure_account(&mut snapshot.ledger, validator);
        snap_account.stake = snap_account.stake.saturating_sub(penalty);
        snap_account.reputation -= rep_drop;
        snapshot.rehash();
    }

    warn!(validator, penalty, height, reason = %reason, "validator slashed");
    let event = SlashEvent {
        validator: validator.to_string(),
        penalty,
        reason,
        height,
        at: now_ms(),
    };
    state.slash_events.push(event.clone());
    event
}

/// Records the first hash seen per (validator, height) and slashes once
/// when a different hash shows up at the same height.
///
/// Returns whether the block equivocates.
pub fn record_equivocation_and_slash(
    state: &mut ChainState,
    block: &Block,
    config: &ConsensusConfig,
) -> bool {
    let seen = state
        .equivocations
        .get(&block.validator)
        .and_then(|heights| heights.get(&block.index))
        .cloned();

    match seen {
        None => {
            state
                .equivocations
                .entry(block.validator.clone())
                .or_default()
                .insert(block.index, block.hash.clone());
            false
        }
        Some(hash) if hash == block.hash => false,
        Some(_) => {
            if state.slash_records.insert(slash_key(&block.validator, block.index)) {
                slash_validator(
                    state,
                    &block.validator,
                    config,
                    format!("Equivocation at height {}", block.index),
                    block.index,
                );
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::chain::create_block_on;
    use crate::consensus::genesis::initialize_state;
    use crate::primitives::account::Account;

    fn staked_state(stake: u64) -> (ConsensusConfig, ChainState) {
        let mut config = ConsensusConfig::with_chain_id("bulencoin-test");
        config.genesis_allocations.insert(
            "val1".into(),
            Account {
                stake,
                ..Account::default()
            },
        );
        let state = initialize_state(&config);
        (config, state)
    }

    #[test]
    fn test_penalty_math() {
        assert_eq!(slash_amount(50, 0.25), 13);
        assert_eq!(slash_amount(0, 0.25), 0);
        assert_eq!(slash_amount(3, 1.0), 3);
        assert_eq!(reputation_penalty(0.25), 3);
        assert_eq!(reputation_penalty(0.0), 1);
    }

    #[test]
    fn test_slash_hits_live_and_snapshot() {
        let (config, mut state) = staked_state(50);
        let before = state.finalized_snapshot.as_ref().unwrap().hash.clone();
        let event = slash_validator(&mut state, "val1", &config, "test".into(), 1);

        assert_eq!(event.penalty, 13);
        assert_eq!(state.ledger.account("val1").stake, 37);
        assert_eq!(state.ledger.account("val1").reputation, -3);
        let snap = state.finalized_snapshot.as_ref().unwrap();
        assert_eq!(snap.ledger.account("val1").stake, 37);
        assert_ne!(snap.hash, before);
        assert_eq!(state.slash_events.len(), 1);
    }

    #[test]
    fn test_equivocation_slashed_exactly_once() {
        let (config, mut state) = staked_state(100);
        let genesis = std::sync::Arc::clone(&state.ledger.blocks[0]);
        let first = create_block_on(&config, Some(&*genesis), "val1", vec![], None, 10);
        assert!(!record_equivocation_and_slash(&mut state, &first, &config));
        assert!(!record_equivocation_and_slash(&mut state, &first, &config));

        for ts in 11..16 {
            let conflicting = create_block_on(&config, Some(&*genesis), "val1", vec![], None, ts);
            assert!(record_equivocation_and_slash(&mut state, &conflicting, &config));
        }
        assert_eq!(state.slash_events.len(), 1);
        assert_eq!(state.ledger.account("val1").stake, 75);
        assert_eq!(state.equivocations["val1"][&1], first.hash);
    }
}
