//! Page-level shared/exclusive locks held by transactions.
//!
//! The table itself never blocks inside [`LockTable::acquire`]; it is a
//! test-and-set over one page's lock set. Waiting is done by
//! [`LockTable::acquire_blocking`], which parks the caller on a condition
//! variable keyed by the page and retries whenever a lock on that page is
//! released. A wait ends when the lock is granted, when the timeout expires,
//! or when the waiting transaction is cancelled through [`LockTable::cancel`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::ids::{PageId, TransactionId};
use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A lock granted to a transaction on some page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    pub tid: TransactionId,
    pub mode: LockMode,
}

/// Locks granted on one page plus the threads parked waiting for it.
#[derive(Debug, Default)]
struct PageLocks {
    granted: Vec<Lock>,
    waiters: usize,
    wakeup: Arc<Condvar>,
}

impl PageLocks {
    fn try_grant(&mut self, tid: TransactionId, mode: LockMode) -> bool {
        let sole_holder = self.granted.len() == 1;

        if let Some(own) = self.granted.iter_mut().find(|lock| lock.tid == tid) {
            return match (own.mode, mode) {
                (LockMode::Exclusive, _) | (LockMode::Shared, LockMode::Shared) => true,
                (LockMode::Shared, LockMode::Exclusive) if sole_holder => {
                    own.mode = LockMode::Exclusive;
                    true
                }
                (LockMode::Shared, LockMode::Exclusive) => false,
            };
        }

        let grantable = match mode {
            LockMode::Shared => self.granted.iter().all(|lock| lock.mode == LockMode::Shared),
            LockMode::Exclusive => self.granted.is_empty(),
        };
        if grantable {
            self.granted.push(Lock { tid, mode });
        }
        grantable
    }

    fn remove(&mut self, tid: TransactionId) -> bool {
        let before = self.granted.len();
        self.granted.retain(|lock| lock.tid != tid);
        self.granted.len() != before
    }

    fn is_idle(&self) -> bool {
        self.granted.is_empty() && self.waiters == 0
    }

    /// Empty, all shared with distinct holders, or exactly one exclusive.
    fn is_consistent(&self) -> bool {
        let exclusive = self
            .granted
            .iter()
            .filter(|lock| lock.mode == LockMode::Exclusive)
            .count();
        let holders: HashSet<_> = self.granted.iter().map(|lock| lock.tid).collect();
        holders.len() == self.granted.len() && (exclusive == 0 || self.granted.len() == 1)
    }
}

#[derive(Debug, Default)]
struct LockState {
    pages: HashMap<PageId, PageLocks>,
    held: HashMap<TransactionId, HashSet<PageId>>,
    waiting: HashMap<TransactionId, PageId>,
    cancelled: HashSet<TransactionId>,
    // Released while parked; the waiter drops the cancel mark on its way out
    detached: HashSet<TransactionId>,
}

impl LockState {
    fn grant(&mut self, pid: PageId, tid: TransactionId, mode: LockMode) -> bool {
        let entry = self.pages.entry(pid).or_default();
        let granted = entry.try_grant(tid, mode);
        debug_assert!(entry.is_consistent(), "lock set on {pid} violates mutual exclusion");
        if granted {
            self.held.entry(tid).or_default().insert(pid);
        }
        granted
    }

    fn wake(&self, pid: PageId) {
        if let Some(entry) = self.pages.get(&pid) {
            if entry.waiters > 0 {
                entry.wakeup.notify_all();
            }
        }
    }

    fn prune(&mut self, pid: PageId) {
        if self.pages.get(&pid).is_some_and(PageLocks::is_idle) {
            self.pages.remove(&pid);
        }
    }
}

/// Maps each page to the locks currently granted on it.
///
/// All operations run under one table mutex, so a single page's lock set
/// changes linearizably.
#[derive(Debug, Default)]
pub struct LockTable {
    state: Mutex<LockState>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking attempt to grant `mode` on `pid` to `tid`.
    ///
    /// A holder of an exclusive lock always succeeds. A holder of a shared
    /// lock asking for exclusive is upgraded in place only when it is the
    /// sole holder.
    pub fn acquire(&self, pid: PageId, tid: TransactionId, mode: LockMode) -> bool {
        let granted = self.state.lock().grant(pid, tid, mode);
        trace!("lock {:?} on {} for {}: granted={}", mode, pid, tid, granted);
        granted
    }

    /// Waits until `mode` on `pid` is granted to `tid`.
    ///
    /// Fails with [`StorageError::LockTimeout`] once `timeout` has elapsed and
    /// with [`StorageError::TransactionAborted`] if `tid` is cancelled before
    /// or during the wait. A failed wait never leaves a lock behind.
    pub fn acquire_blocking(
        &self,
        pid: PageId,
        tid: TransactionId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        // None waits without a deadline
        let deadline = started.checked_add(timeout);
        let mut state = self.state.lock();

        loop {
            if state.cancelled.contains(&tid) {
                if state.detached.remove(&tid) {
                    state.cancelled.remove(&tid);
                }
                debug!("{} cancelled while waiting for {:?} on {}", tid, mode, pid);
                return Err(StorageError::TransactionAborted(tid));
            }
            if state.grant(pid, tid, mode) {
                trace!("lock {:?} on {} granted to {}", mode, pid, tid);
                return Ok(());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                let waited = started.elapsed();
                warn!("{} timed out after {:?} waiting for {:?} on {}", tid, waited, mode, pid);
                return Err(StorageError::LockTimeout { tid, pid, waited });
            }

            let wakeup = {
                let entry = state.pages.entry(pid).or_default();
                entry.waiters += 1;
                Arc::clone(&entry.wakeup)
            };
            state.waiting.insert(tid, pid);
            trace!("{} waiting for {:?} on {}", tid, mode, pid);

            match deadline {
                Some(deadline) => {
                    wakeup.wait_until(&mut state, deadline);
                }
                None => wakeup.wait(&mut state),
            }

            state.waiting.remove(&tid);
            if let Some(entry) = state.pages.get_mut(&pid) {
                entry.waiters -= 1;
            }
            state.prune(pid);
        }
    }

    /// Drops `tid`'s lock on `pid`.
    pub fn release(&self, pid: PageId, tid: TransactionId) -> Result<()> {
        let mut state = self.state.lock();

        let removed = state
            .pages
            .get_mut(&pid)
            .is_some_and(|entry| entry.remove(tid));
        if !removed {
            return Err(StorageError::NotLocked { tid, pid });
        }

        let now_empty = state
            .held
            .get_mut(&tid)
            .map(|pages| {
                pages.remove(&pid);
                pages.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            state.held.remove(&tid);
        }

        state.wake(pid);
        state.prune(pid);
        trace!("released lock on {} held by {}", pid, tid);
        Ok(())
    }

    /// Drops every lock `tid` holds and clears any pending cancellation.
    /// Returns how many page locks were released.
    ///
    /// If `tid` is still parked in [`LockTable::acquire_blocking`] on another
    /// thread, that wait is cancelled instead, and the cancellation is
    /// cleared once the waiter has returned.
    pub fn release_all(&self, tid: TransactionId) -> usize {
        let mut state = self.state.lock();
        if let Some(&waiting_on) = state.waiting.get(&tid) {
            state.cancelled.insert(tid);
            state.detached.insert(tid);
            state.wake(waiting_on);
        } else {
            state.cancelled.remove(&tid);
        }

        let pages = state.held.remove(&tid).unwrap_or_default();
        for &pid in &pages {
            if let Some(entry) = state.pages.get_mut(&pid) {
                entry.remove(tid);
            }
            state.wake(pid);
            state.prune(pid);
        }

        debug!("released {} page locks held by {}", pages.len(), tid);
        pages.len()
    }

    pub fn holds(&self, pid: PageId, tid: TransactionId) -> bool {
        self.lock_mode(pid, tid).is_some()
    }

    pub fn lock_mode(&self, pid: PageId, tid: TransactionId) -> Option<LockMode> {
        let state = self.state.lock();
        state
            .pages
            .get(&pid)?
            .granted
            .iter()
            .find(|lock| lock.tid == tid)
            .map(|lock| lock.mode)
    }

    /// Snapshot of the locks granted on `pid`.
    pub fn locks_on(&self, pid: PageId) -> Vec<Lock> {
        let state = self.state.lock();
        state
            .pages
            .get(&pid)
            .map(|entry| entry.granted.clone())
            .unwrap_or_default()
    }

    pub fn pages_locked_by(&self, tid: TransactionId) -> Vec<PageId> {
        let state = self.state.lock();
        let mut pages: Vec<_> = state
            .held
            .get(&tid)
            .map(|pages| pages.iter().copied().collect())
            .unwrap_or_default();
        pages.sort();
        pages
    }

    /// Interrupts `tid`: a current wait returns [`StorageError::TransactionAborted`],
    /// and so does every later wait until [`LockTable::release_all`] is called
    /// for `tid`.
    pub fn cancel(&self, tid: TransactionId) {
        let mut state = self.state.lock();
        state.cancelled.insert(tid);
        if let Some(&pid) = state.waiting.get(&tid) {
            debug!("waking {} blocked on {} for cancellation", tid, pid);
            state.wake(pid);
        }
    }

    pub fn is_cancelled(&self, tid: TransactionId) -> bool {
        self.state.lock().cancelled.contains(&tid)
    }
}
