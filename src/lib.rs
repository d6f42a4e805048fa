// Bulencoin node core
//
// Stake-weighted fork choice, finality and slashing over an account
// ledger, with a RocksDB-backed store and a block producer loop.

pub mod config;

pub mod consensus {
    pub mod chain;
    pub mod engine;
    pub mod finality;
    pub mod fork_choice;
    pub mod genesis;
    pub mod slashing;
    pub mod state;
}

pub mod crypto {
    pub mod dilithium;
    pub mod hash;
    pub mod keys;
    pub mod security;
}

pub mod net {
    pub mod mempool;
}

pub mod node;

pub mod primitives {
    pub mod account;
    pub mod block;
    pub mod transaction;
}

pub mod producer {
    pub mod producer;
}
