//! Value identifiers shared by every layer of the storage engine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a storage container (one heap file / table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub u32);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A page within a named container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    container: ContainerId,
    page_no: u32,
}

impl PageId {
    pub fn new(container: ContainerId, page_no: u32) -> Self {
        Self { container, page_no }
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn page_no(&self) -> u32 {
        self.page_no
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.page_no)
    }
}

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque transaction token.
///
/// Every call to [`TransactionId::new`] mints a value that has never been
/// handed out before in this process, so two ids compare equal only if they
/// came from the same mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Location of a record: a page plus a slot in that page's directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    page: PageId,
    slot: u16,
}

impl RecordId {
    pub fn new(page: PageId, slot: u16) -> Self {
        Self { page, slot }
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.page, self.slot)
    }
}
