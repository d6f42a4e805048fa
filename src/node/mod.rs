// Node modules
pub mod db_common; // On-disk record types (TipRecord, checksums)
pub mod db_rocksdb; // RocksDB chain store
pub mod service; // Single-writer node handle

pub use db_rocksdb::{ChainStore, DbError};
pub use service::{Checkpoint, NodeError, NodeHandle};
