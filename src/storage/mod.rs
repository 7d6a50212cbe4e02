//! Single-node LSM storage engine: write-ahead log, memtable, sorted
//! tables with Bloom filters, and size-tiered compaction.

mod bloom;
mod compaction;
mod lsm;
mod memtable;
mod sstable;
mod wal;

pub use bloom::BloomFilter;
pub use compaction::CompactionStats;
pub use lsm::{LsmConfig, LsmStore, StoreStats};
pub use memtable::MemTable;
pub use sstable::{SsTable, SsTableWriter, TableLookup};
pub use wal::{SyncPolicy, Wal, WalEntry, WalOp};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is absent, tombstoned, or excluded by every table.
    #[error("key not found")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A sorted-table file failed validation on open or read.
    #[error("corrupt sorted table: {0}")]
    Corruption(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for tonic::Status {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => tonic::Status::not_found("key not found"),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
