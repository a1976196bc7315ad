//! The process-scoped engine handle.
//!
//! A [`Database`] owns one page cache, one lock table and one container
//! catalog for its whole lifetime. Query operators share it by reference
//! and reach every page through it.

use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::cache::{PageCache, PageHandle};
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::file::{HeapFile, StorageAdapter};
use crate::ids::{ContainerId, PageId, TransactionId};
use crate::lock::{LockMode, LockTable};
use crate::record::Record;
use crate::transaction::{TransactionCoordinator, TransactionState, TransactionTable};
use crate::{Result, StorageError};

pub struct Database {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    locks: Arc<LockTable>,
    cache: Arc<PageCache>,
    coordinator: TransactionCoordinator,
}

impl Database {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let catalog = Arc::new(Catalog::new());
        let locks = Arc::new(LockTable::new());
        let transactions = Arc::new(TransactionTable::new(config.ended_history));
        let cache = Arc::new(PageCache::new(
            config.cache_pages,
            config.lock_timeout(),
            Arc::clone(&catalog),
            Arc::clone(&locks),
            Arc::clone(&transactions),
        ));
        let coordinator =
            TransactionCoordinator::new(Arc::clone(&cache), Arc::clone(&locks), transactions);

        info!(
            "database ready: {} cache pages, {:?} lock timeout",
            config.cache_pages,
            config.lock_timeout()
        );

        Ok(Self {
            config,
            catalog,
            locks,
            cache,
            coordinator,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a heap file at `path` under a fresh container id.
    pub fn create_heap_file(&self, path: &Path) -> Result<ContainerId> {
        let checksums = self.config.verify_checksums;
        self.catalog.add_new(|id| {
            let adapter: Arc<dyn StorageAdapter> =
                Arc::new(HeapFile::create_new(path, id, checksums)?);
            Ok(adapter)
        })
    }

    /// Opens an existing heap file under the container id stored in it.
    pub fn open_heap_file(&self, path: &Path) -> Result<ContainerId> {
        self.register(Arc::new(HeapFile::open(path)?))
    }

    pub fn register(&self, adapter: Arc<dyn StorageAdapter>) -> Result<ContainerId> {
        let id = adapter.container_id();
        self.catalog.add(adapter)?;
        Ok(id)
    }

    pub fn begin(&self) -> TransactionId {
        self.coordinator.begin()
    }

    pub fn get_page(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> Result<PageHandle> {
        self.cache.get_page(tid, pid, mode)
    }

    /// Releases one page lock before the transaction ends.
    ///
    /// This breaks two-phase locking: another transaction may then change
    /// the page and the caller's later reads are no longer serializable.
    /// Only use it for pages the transaction never read meaningfully.
    pub fn release_page(&self, tid: TransactionId, pid: PageId) -> Result<()> {
        self.locks.release(pid, tid)
    }

    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.locks.holds(pid, tid)
    }

    /// Inserts `record` into `container` and assigns its record id.
    pub fn insert_tuple(
        &self,
        tid: TransactionId,
        container: ContainerId,
        record: &mut Record,
    ) -> Result<Vec<PageId>> {
        let adapter = self.catalog.get(container)?;
        let touched = adapter.insert_tuple(&self.cache, tid, record)?;
        self.mark_touched(tid, &touched)?;
        Ok(touched)
    }

    pub fn delete_tuple(&self, tid: TransactionId, record: &Record) -> Result<Vec<PageId>> {
        let rid = record
            .rid()
            .ok_or_else(|| StorageError::Usage("record has no record id".to_string()))?;
        let adapter = self.catalog.get(rid.page().container())?;
        let touched = adapter.delete_tuple(&self.cache, tid, record)?;
        self.mark_touched(tid, &touched)?;
        Ok(touched)
    }

    /// Reads every live record of `container` under shared page locks.
    pub fn scan(&self, tid: TransactionId, container: ContainerId) -> Result<Vec<Record>> {
        let adapter = self.catalog.get(container)?;
        let records: Result<Vec<Record>> = adapter.scan(&self.cache, tid)?.collect();
        records
    }

    fn mark_touched(&self, tid: TransactionId, pages: &[PageId]) -> Result<()> {
        for &pid in pages {
            self.cache.mark_dirty(pid, tid)?;
        }
        Ok(())
    }

    pub fn commit_transaction(&self, tid: TransactionId) -> Result<()> {
        self.coordinator.commit(tid)
    }

    pub fn abort_transaction(&self, tid: TransactionId) -> Result<()> {
        self.coordinator.abort(tid)
    }

    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> Result<()> {
        self.coordinator.end(tid, commit)
    }

    /// Interrupts `tid` from another thread. See
    /// [`TransactionCoordinator::request_abort`].
    pub fn request_abort(&self, tid: TransactionId) -> Result<()> {
        self.coordinator.request_abort(tid)
    }

    pub fn transaction_state(&self, tid: TransactionId) -> Option<TransactionState> {
        self.coordinator.state(tid)
    }

    pub fn discard_page(&self, pid: PageId) -> bool {
        self.cache.discard(pid)
    }

    pub fn flush_pages(&self, tid: TransactionId) -> Result<usize> {
        self.cache.flush_pages(tid)
    }

    /// Flushes every dirty page. Unsafe while transactions are writing; see
    /// [`PageCache::flush_all`].
    pub fn flush_all_pages(&self) -> Result<usize> {
        self.cache.flush_all()
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.locks
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}
