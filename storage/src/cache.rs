//! The transactional page cache (buffer pool).
//!
//! Every page access goes through [`PageCache::get_page`], which first takes
//! the matching page lock for the calling transaction and then serves the
//! page from memory or loads it through the owning [`StorageAdapter`].
//!
//! Eviction is NO-STEAL: a page whose dirty owner is set is never evicted,
//! so uncommitted writes never reach disk ahead of their commit and an
//! abort can restore a page simply by re-reading it. Among clean pages the
//! least recently loaded one is evicted first. Pages whose [`PageHandle`] is
//! still held by a caller are pinned and skipped as well.
//!
//! [`StorageAdapter`]: crate::file::StorageAdapter

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::catalog::Catalog;
use crate::ids::{PageId, TransactionId};
use crate::lock::{LockMode, LockTable};
use crate::page::Page;
use crate::transaction::TransactionTable;
use crate::{Result, StorageError};

/// Shared reference to a cached page.
///
/// Holding a handle pins the page in the cache. Readers holding only a
/// shared lock must restrict themselves to [`PageHandle::read`].
#[derive(Clone)]
pub struct PageHandle {
    pid: PageId,
    page: Arc<RwLock<Page>>,
}

impl PageHandle {
    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write()
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle").field("pid", &self.pid).finish()
    }
}

struct CacheEntry {
    page: Arc<RwLock<Page>>,
    loaded_at: u64,
}

impl CacheEntry {
    fn is_pinned(&self) -> bool {
        Arc::strong_count(&self.page) > 1
    }

    // An unpinned page has no outstanding guards, so try_read only fails
    // for pages somebody is about to pin anyway.
    fn is_evictable(&self) -> bool {
        !self.is_pinned() && self.page.try_read().is_some_and(|page| !page.is_dirty())
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<PageId, CacheEntry>,
    next_stamp: u64,
}

pub struct PageCache {
    capacity: usize,
    lock_timeout: Duration,
    catalog: Arc<Catalog>,
    locks: Arc<LockTable>,
    transactions: Arc<TransactionTable>,
    state: Mutex<CacheState>,
}

impl PageCache {
    pub fn new(
        capacity: usize,
        lock_timeout: Duration,
        catalog: Arc<Catalog>,
        locks: Arc<LockTable>,
        transactions: Arc<TransactionTable>,
    ) -> Self {
        Self {
            capacity,
            lock_timeout,
            catalog,
            locks,
            transactions,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_resident(&self, pid: PageId) -> bool {
        self.state.lock().entries.contains_key(&pid)
    }

    pub fn resident_pages(&self) -> Vec<PageId> {
        let mut pages: Vec<_> = self.state.lock().entries.keys().copied().collect();
        pages.sort();
        pages
    }

    /// Every resident dirty page with the transaction that dirtied it.
    pub fn dirty_pages(&self) -> Vec<(PageId, TransactionId)> {
        self.pages_where(|page| page.is_dirty())
            .into_iter()
            .filter_map(|(pid, page)| page.read().dirty_owner().map(|tid| (pid, tid)))
            .collect()
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Fetches `pid` for `tid` under a `mode` lock.
    ///
    /// Blocks until the lock is granted, the configured lock timeout
    /// expires, or `tid` is cancelled. On a miss the page is loaded through
    /// its container's adapter, evicting one clean page first when the cache
    /// is full; if no page can be evicted this fails with
    /// [`StorageError::EvictionExhausted`].
    pub fn get_page(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> Result<PageHandle> {
        self.transactions.enter(tid)?;
        self.locks.acquire_blocking(pid, tid, mode, self.lock_timeout)?;

        // Ended by another thread between entering and the grant
        if !self.transactions.is_active(tid) {
            if self.locks.release(pid, tid).is_ok() {
                debug!("dropped lock on {} granted to ended {}", pid, tid);
            }
            return Err(StorageError::TransactionAborted(tid));
        }

        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(&pid) {
            trace!("cache hit on {} for {}", pid, tid);
            return Ok(PageHandle {
                pid,
                page: Arc::clone(&entry.page),
            });
        }

        let adapter = self.catalog.get(pid.container())?;
        if state.entries.len() >= self.capacity {
            self.evict_one(&mut state)?;
        }
        let page = Arc::new(RwLock::new(adapter.read_page(pid)?));

        let loaded_at = state.next_stamp;
        state.next_stamp += 1;
        state.entries.insert(
            pid,
            CacheEntry {
                page: Arc::clone(&page),
                loaded_at,
            },
        );
        debug!(
            "loaded {} for {} ({}/{} resident)",
            pid,
            tid,
            state.entries.len(),
            self.capacity
        );

        Ok(PageHandle { pid, page })
    }

    fn evict_one(&self, state: &mut CacheState) -> Result<PageId> {
        let victim = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_evictable())
            .min_by_key(|(_, entry)| entry.loaded_at)
            .map(|(pid, _)| *pid);

        match victim {
            Some(pid) => {
                state.entries.remove(&pid);
                debug!("evicted {}", pid);
                Ok(pid)
            }
            None => {
                warn!(
                    "no evictable page: all {} resident pages are dirty or pinned",
                    self.capacity
                );
                Err(StorageError::EvictionExhausted {
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Sets the dirty owner of a resident page. Takes no lock: the caller
    /// must already hold the exclusive lock its mutation required.
    pub fn mark_dirty(&self, pid: PageId, tid: TransactionId) -> Result<()> {
        let page = self.resident(pid).ok_or(StorageError::NotResident(pid))?;
        page.write().mark_dirty(tid);
        Ok(())
    }

    /// Drops a resident page without flushing it. Returns whether it was
    /// resident.
    pub fn discard(&self, pid: PageId) -> bool {
        let removed = self.state.lock().entries.remove(&pid).is_some();
        if removed {
            debug!("discarded {}", pid);
        }
        removed
    }

    /// Writes a resident dirty page through its adapter and clears its
    /// dirty owner. No-op for clean or non-resident pages.
    pub fn flush_page(&self, pid: PageId) -> Result<()> {
        if let Some(page) = self.resident(pid) {
            self.flush_if(pid, &page, |page| page.is_dirty())?;
        }
        Ok(())
    }

    /// Flushes the pages dirtied by `tid`. Returns how many were written.
    pub fn flush_pages(&self, tid: TransactionId) -> Result<usize> {
        let owned_by = move |page: &Page| page.dirty_owner() == Some(tid);
        let mut flushed = 0;
        for (pid, page) in self.pages_where(owned_by) {
            if self.flush_if(pid, &page, owned_by)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Flushes every dirty page regardless of owner.
    ///
    /// This bypasses per-transaction flush ordering and writes uncommitted
    /// data, so it is only safe while no transaction is mutating pages.
    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        for (pid, page) in self.pages_where(|page| page.is_dirty()) {
            if self.flush_if(pid, &page, |page| page.is_dirty())? {
                flushed += 1;
            }
        }
        debug!("flushed {} dirty pages", flushed);
        Ok(flushed)
    }

    /// Replaces every page dirtied by `tid` with its on-disk version, in
    /// place, so existing handles observe the restored bytes.
    pub fn restore_pages(&self, tid: TransactionId) -> Result<usize> {
        let owned_by = move |page: &Page| page.dirty_owner() == Some(tid);
        let mut restored = 0;
        for (pid, page) in self.pages_where(owned_by) {
            let mut page = page.write();
            if !owned_by(&*page) {
                continue;
            }
            *page = self.catalog.get(pid.container())?.read_page(pid)?;
            trace!("restored {} after abort of {}", pid, tid);
            restored += 1;
        }
        Ok(restored)
    }

    fn resident(&self, pid: PageId) -> Option<Arc<RwLock<Page>>> {
        self.state
            .lock()
            .entries
            .get(&pid)
            .map(|entry| Arc::clone(&entry.page))
    }

    /// Resident pages that may satisfy `wanted`, sorted by id.
    ///
    /// Pages currently write-locked by someone are included unchecked; the
    /// caller re-checks them after the cache mutex is released.
    fn pages_where(&self, wanted: impl Fn(&Page) -> bool) -> Vec<(PageId, Arc<RwLock<Page>>)> {
        let state = self.state.lock();
        let mut pages: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.page.try_read().map_or(true, |page| wanted(&*page)))
            .map(|(pid, entry)| (*pid, Arc::clone(&entry.page)))
            .collect();
        pages.sort_by_key(|(pid, _)| *pid);
        pages
    }

    fn flush_if(
        &self,
        pid: PageId,
        page: &RwLock<Page>,
        wanted: impl Fn(&Page) -> bool,
    ) -> Result<bool> {
        let mut page = page.write();
        if !wanted(&*page) {
            return Ok(false);
        }

        let adapter = self.catalog.get(pid.container())?;
        adapter.write_page(&page)?;
        page.mark_clean();
        trace!("flushed {}", pid);
        Ok(true)
    }
}
