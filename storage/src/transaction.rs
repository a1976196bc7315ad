//! Transaction lifecycle: commit flushes, abort restores, both release locks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::cache::PageCache;
use crate::ids::TransactionId;
use crate::lock::LockTable;
use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Aborting,
    Ended,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Active => "active",
            TransactionState::Committing => "committing",
            TransactionState::Aborting => "aborting",
            TransactionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct TableState {
    live: HashMap<TransactionId, TransactionState>,
    ended: VecDeque<TransactionId>,
    ended_set: HashSet<TransactionId>,
}

/// Tracks the state of every live transaction plus a bounded history of
/// recently ended ones, so that ending a transaction twice is reported.
#[derive(Debug)]
pub struct TransactionTable {
    history: usize,
    state: Mutex<TableState>,
}

impl TransactionTable {
    pub fn new(history: usize) -> Self {
        Self {
            history,
            state: Mutex::new(TableState::default()),
        }
    }

    /// Registers a page access by `tid`, making it active on first use.
    pub fn enter(&self, tid: TransactionId) -> Result<()> {
        let mut state = self.state.lock();
        if state.ended_set.contains(&tid) {
            return Err(StorageError::Usage(format!("transaction {} has already ended", tid)));
        }

        match *state.live.entry(tid).or_insert(TransactionState::Active) {
            TransactionState::Active => Ok(()),
            other => Err(StorageError::Usage(format!(
                "transaction {} cannot access pages while {}",
                tid, other
            ))),
        }
    }

    /// Records a freshly minted id as active before its first page access.
    pub fn register(&self, tid: TransactionId) {
        self.state.lock().live.insert(tid, TransactionState::Active);
    }

    /// Moves `tid` into `Committing` or `Aborting`.
    ///
    /// A failed commit may fall back to `Aborting`, and a failed abort may
    /// be retried. A transaction that never touched a page can be ended
    /// directly.
    pub fn begin_end(&self, tid: TransactionId, next: TransactionState) -> Result<()> {
        use TransactionState::*;

        let mut state = self.state.lock();
        if state.ended_set.contains(&tid) {
            return Err(StorageError::Usage(format!("transaction {} has already ended", tid)));
        }

        let current = state.live.get(&tid).copied();
        match (current, next) {
            (None | Some(Active), Committing | Aborting)
            | (Some(Committing), Aborting)
            | (Some(Aborting), Aborting) => {
                state.live.insert(tid, next);
                Ok(())
            }
            (current, next) => Err(StorageError::Usage(format!(
                "transaction {} cannot move from {} to {}",
                tid,
                current.unwrap_or(Active),
                next
            ))),
        }
    }

    pub fn finish(&self, tid: TransactionId) {
        let mut state = self.state.lock();
        state.live.remove(&tid);
        if self.history == 0 || !state.ended_set.insert(tid) {
            return;
        }

        state.ended.push_back(tid);
        while state.ended.len() > self.history {
            if let Some(oldest) = state.ended.pop_front() {
                state.ended_set.remove(&oldest);
            }
        }
    }

    /// `None` for ids never seen, or ended so long ago they were forgotten.
    pub fn state(&self, tid: TransactionId) -> Option<TransactionState> {
        let state = self.state.lock();
        state.live.get(&tid).copied().or_else(|| {
            state
                .ended_set
                .contains(&tid)
                .then_some(TransactionState::Ended)
        })
    }

    pub fn is_active(&self, tid: TransactionId) -> bool {
        self.state.lock().live.get(&tid) == Some(&TransactionState::Active)
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }
}

/// Ends transactions against the shared page cache and lock table.
pub struct TransactionCoordinator {
    cache: Arc<PageCache>,
    locks: Arc<LockTable>,
    transactions: Arc<TransactionTable>,
}

impl TransactionCoordinator {
    pub fn new(
        cache: Arc<PageCache>,
        locks: Arc<LockTable>,
        transactions: Arc<TransactionTable>,
    ) -> Self {
        Self {
            cache,
            locks,
            transactions,
        }
    }

    /// Mints a transaction id and registers it as active.
    pub fn begin(&self) -> TransactionId {
        let tid = TransactionId::new();
        self.transactions.register(tid);
        debug!("began {}", tid);
        tid
    }

    /// Ends every lock wait of `tid` still in progress on another thread,
    /// then drops all its locks.
    fn release_locks(&self, tid: TransactionId) -> usize {
        self.locks.cancel(tid);
        self.locks.release_all(tid)
    }

    /// Flushes every page `tid` dirtied, then releases all its locks.
    ///
    /// If a flush fails the error is returned, the transaction keeps its
    /// locks and stays in `Committing`; the only valid next step is
    /// [`TransactionCoordinator::abort`].
    pub fn commit(&self, tid: TransactionId) -> Result<()> {
        self.transactions.begin_end(tid, TransactionState::Committing)?;

        let flushed = match self.cache.flush_pages(tid) {
            Ok(flushed) => flushed,
            Err(err) => {
                warn!("commit of {} failed while flushing: {}", tid, err);
                return Err(err);
            }
        };

        let released = self.release_locks(tid);
        self.transactions.finish(tid);
        debug!(
            "committed {}: flushed {} pages, released {} locks",
            tid, flushed, released
        );
        Ok(())
    }

    /// Restores every page `tid` dirtied from disk, then releases all its
    /// locks.
    ///
    /// Fails only if re-reading a page fails; the transaction then stays in
    /// `Aborting` with its locks held and the abort may be retried.
    pub fn abort(&self, tid: TransactionId) -> Result<()> {
        self.transactions.begin_end(tid, TransactionState::Aborting)?;

        let restored = match self.cache.restore_pages(tid) {
            Ok(restored) => restored,
            Err(err) => {
                warn!("abort of {} failed while restoring pages: {}", tid, err);
                return Err(err);
            }
        };

        let released = self.release_locks(tid);
        self.transactions.finish(tid);
        debug!(
            "aborted {}: restored {} pages, released {} locks",
            tid, restored, released
        );
        Ok(())
    }

    pub fn end(&self, tid: TransactionId, commit: bool) -> Result<()> {
        if commit {
            self.commit(tid)
        } else {
            self.abort(tid)
        }
    }

    /// Asks `tid` to stop: a blocked lock wait returns
    /// [`StorageError::TransactionAborted`] at once, as does every later
    /// one, until the owning thread calls [`TransactionCoordinator::abort`].
    pub fn request_abort(&self, tid: TransactionId) -> Result<()> {
        match self.transactions.state(tid) {
            None => {
                return Err(StorageError::Usage(format!("unknown transaction {}", tid)));
            }
            Some(TransactionState::Ended) => {
                return Err(StorageError::Usage(format!("transaction {} has already ended", tid)));
            }
            Some(_) => {}
        }
        debug!("abort requested for {}", tid);
        self.locks.cancel(tid);
        Ok(())
    }

    pub fn state(&self, tid: TransactionId) -> Option<TransactionState> {
        self.transactions.state(tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::file::{HeapFile, StorageAdapter};
    use crate::ids::{ContainerId, PageId};
    use crate::lock::LockMode;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_state_machine_transitions() {
        use TransactionState::*;
        let table = TransactionTable::new(8);
        let tid = TransactionId::new();

        assert_eq!(table.state(tid), None);
        table.enter(tid).unwrap();
        assert_eq!(table.state(tid), Some(Active));

        table.begin_end(tid, Committing).unwrap();
        assert!(table.enter(tid).is_err());
        assert!(table.begin_end(tid, Committing).is_err());

        // A failed commit falls back to an abort, which may be retried
        table.begin_end(tid, Aborting).unwrap();
        table.begin_end(tid, Aborting).unwrap();
        assert!(table.begin_end(tid, Committing).is_err());

        table.finish(tid);
        assert_eq!(table.state(tid), Some(Ended));
        assert_eq!(table.live_count(), 0);
        assert!(matches!(table.enter(tid), Err(StorageError::Usage(_))));
        assert!(matches!(
            table.begin_end(tid, Aborting),
            Err(StorageError::Usage(_))
        ));
    }

    #[test]
    fn test_ended_history_is_bounded() {
        let table = TransactionTable::new(2);
        let tids: Vec<_> = (0..3).map(|_| TransactionId::new()).collect();
        for &tid in &tids {
            table.begin_end(tid, TransactionState::Committing).unwrap();
            table.finish(tid);
        }

        assert_eq!(table.state(tids[0]), None);
        assert_eq!(table.state(tids[1]), Some(TransactionState::Ended));
        assert_eq!(table.state(tids[2]), Some(TransactionState::Ended));
    }

    struct Fixture {
        _dir: TempDir,
        file: Arc<HeapFile>,
        cache: Arc<PageCache>,
        coordinator: TransactionCoordinator,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(
            HeapFile::create_new(&dir.path().join("t.heap"), ContainerId(1), true).unwrap(),
        );
        file.allocate_page().unwrap();

        let catalog = Arc::new(Catalog::new());
        catalog.add(file.clone()).unwrap();
        let locks = Arc::new(LockTable::new());
        let transactions = Arc::new(TransactionTable::new(16));
        let cache = Arc::new(PageCache::new(
            4,
            Duration::from_millis(100),
            catalog,
            locks.clone(),
            transactions.clone(),
        ));
        let coordinator = TransactionCoordinator::new(cache.clone(), locks, transactions);

        Fixture {
            _dir: dir,
            file,
            cache,
            coordinator,
        }
    }

    fn write_record(fx: &Fixture, tid: TransactionId, data: &[u8]) -> PageId {
        let pid = PageId::new(ContainerId(1), 0);
        let handle = fx.cache.get_page(tid, pid, LockMode::Exclusive).unwrap();
        handle.write().add_record(data).unwrap();
        fx.cache.mark_dirty(pid, tid).unwrap();
        pid
    }

    #[test]
    fn test_commit_flushes_and_releases() {
        let fx = fixture();
        let tid = TransactionId::new();
        let pid = write_record(&fx, tid, b"committed");

        fx.coordinator.commit(tid).unwrap();

        assert_eq!(fx.file.read_page(pid).unwrap().get_record(0).unwrap(), b"committed");
        assert!(fx.cache.dirty_pages().is_empty());
        assert!(fx.cache.lock_table().pages_locked_by(tid).is_empty());
        assert_eq!(fx.coordinator.state(tid), Some(TransactionState::Ended));
    }

    #[test]
    fn test_abort_restores_and_releases() {
        let fx = fixture();
        let tid = TransactionId::new();
        let pid = write_record(&fx, tid, b"rolled back");

        fx.coordinator.end(tid, false).unwrap();

        let reader = TransactionId::new();
        let handle = fx.cache.get_page(reader, pid, LockMode::Shared).unwrap();
        assert_eq!(handle.read().records().count(), 0);
        assert!(!fx.cache.lock_table().holds(pid, tid));
    }

    #[test]
    fn test_double_end_is_a_usage_error() {
        let fx = fixture();
        let tid = TransactionId::new();
        write_record(&fx, tid, b"once");

        fx.coordinator.commit(tid).unwrap();
        assert!(matches!(fx.coordinator.commit(tid), Err(StorageError::Usage(_))));
        assert!(matches!(fx.coordinator.abort(tid), Err(StorageError::Usage(_))));
    }

    #[test]
    fn test_ending_an_idle_transaction() {
        let fx = fixture();
        let tid = TransactionId::new();

        fx.coordinator.commit(tid).unwrap();
        assert_eq!(fx.coordinator.state(tid), Some(TransactionState::Ended));
    }

    #[test]
    fn test_request_abort_rejects_unknown_transaction() {
        let fx = fixture();
        let tid = TransactionId::new();

        assert!(matches!(
            fx.coordinator.request_abort(tid),
            Err(StorageError::Usage(_))
        ));
        assert!(!fx.cache.lock_table().is_cancelled(tid));

        let begun = fx.coordinator.begin();
        assert_eq!(fx.coordinator.state(begun), Some(TransactionState::Active));
        fx.coordinator.request_abort(begun).unwrap();
        assert!(fx.cache.lock_table().is_cancelled(begun));
        fx.coordinator.abort(begun).unwrap();
        assert!(!fx.cache.lock_table().is_cancelled(begun));
    }

    #[test]
    fn test_request_abort_fails_later_waits_until_abort() {
        let fx = fixture();
        let tid = TransactionId::new();
        let pid = PageId::new(ContainerId(1), 0);
        fx.cache.get_page(tid, pid, LockMode::Shared).unwrap();

        fx.coordinator.request_abort(tid).unwrap();
        assert!(matches!(
            fx.cache.get_page(tid, pid, LockMode::Exclusive),
            Err(StorageError::TransactionAborted(t)) if t == tid
        ));

        fx.coordinator.abort(tid).unwrap();
        assert!(!fx.cache.lock_table().is_cancelled(tid));
        assert!(matches!(
            fx.coordinator.request_abort(tid),
            Err(StorageError::Usage(_))
        ));
    }
}
