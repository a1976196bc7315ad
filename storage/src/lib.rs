//! Storage engine for the heapdb database
//!
//! This crate provides the low-level storage primitives: slotted pages,
//! heap files, and the transactional page cache that sits between query
//! operators and disk. The cache enforces strict two-phase page locking
//! per transaction and a no-steal eviction policy, so committed writes are
//! flushed on commit and aborted writes are rolled back by re-reading the
//! on-disk page.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod database;
pub mod file;
pub mod ids;
pub mod lock;
pub mod page;
pub mod record;
pub mod transaction;

pub use cache::{PageCache, PageHandle};
pub use catalog::Catalog;
pub use config::EngineConfig;
pub use database::Database;
pub use file::{HeapFile, StorageAdapter};
pub use ids::{ContainerId, PageId, RecordId, TransactionId};
pub use lock::{Lock, LockMode, LockTable};
pub use page::{Page, SlotEntry, PAGE_SIZE};
pub use record::Record;
pub use transaction::{TransactionCoordinator, TransactionState, TransactionTable};

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Page {0} is not resident in the page cache")]
    NotResident(PageId),

    #[error("Page {0} is full")]
    PageFull(PageId),

    #[error("Invalid slot index {index} for page {page_id}")]
    InvalidSlot { page_id: PageId, index: usize },

    #[error("Record of {len} bytes exceeds the maximum of {max} bytes")]
    RecordTooLarge { len: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch for page {0}")]
    ChecksumMismatch(PageId),

    #[error("Corrupt storage file: {0}")]
    Corrupt(String),

    #[error("Unknown container {0}")]
    UnknownContainer(ContainerId),

    #[error("Container {0} is already registered")]
    DuplicateContainer(ContainerId),

    #[error("Transaction {tid} timed out after {waited:?} waiting for a lock on page {pid}")]
    LockTimeout {
        tid: TransactionId,
        pid: PageId,
        waited: Duration,
    },

    #[error("Transaction {0} was aborted")]
    TransactionAborted(TransactionId),

    #[error("Cannot evict a page: all {capacity} cached pages are dirty or pinned")]
    EvictionExhausted { capacity: usize },

    #[error("Transaction {tid} holds no lock on page {pid}")]
    NotLocked { tid: TransactionId, pid: PageId },

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl StorageError {
    /// Errors after which the transaction should be aborted and may be
    /// retried from the start.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::LockTimeout { .. } | StorageError::TransactionAborted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
