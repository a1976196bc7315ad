#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use anyhow::Context;
use storage::{
    ContainerId, Database, EngineConfig, HeapFile, Page, PageCache, PageId, Record,
    StorageAdapter, StorageError, TransactionId,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub const CONTAINER: ContainerId = ContainerId(1);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

pub fn pid(page_no: u32) -> PageId {
    PageId::new(CONTAINER, page_no)
}

/// A database with one heap file whose pages each hold a marker record.
pub struct TestDb {
    pub dir: TempDir,
    pub db: Arc<Database>,
}

impl TestDb {
    pub fn adapter(&self) -> Arc<dyn StorageAdapter> {
        self.db.catalog().get(CONTAINER).expect("test container is registered")
    }

    /// Page contents as stored on disk, bypassing the cache.
    pub fn on_disk(&self, page_no: u32) -> anyhow::Result<Page> {
        Ok(self.adapter().read_page(pid(page_no))?)
    }
}

pub fn seeded_heap_file(path: &Path, pages: u32) -> anyhow::Result<HeapFile> {
    let file = HeapFile::create_new(path, CONTAINER, true)?;
    for page_no in 0..pages {
        let pid = file.allocate_page()?;
        let mut page = file.read_page(pid)?;
        page.add_record(format!("page-{page_no}").as_bytes())
            .context("fresh page has room for a marker")?;
        file.write_page(&page)?;
    }
    Ok(file)
}

pub fn seeded_db(config: EngineConfig, pages: u32) -> anyhow::Result<TestDb> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let file = seeded_heap_file(&dir.path().join("seeded.heap"), pages)?;

    let db = Database::new(config)?;
    db.register(Arc::new(file))?;
    Ok(TestDb {
        dir,
        db: Arc::new(db),
    })
}

/// Wraps a heap file and fails page writes on demand.
pub struct FailingStorage {
    inner: HeapFile,
    fail_writes: AtomicBool,
}

impl FailingStorage {
    pub fn new(inner: HeapFile) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn read_page_bytes(&self, page_no: u32) -> storage::Result<Vec<u8>> {
        Ok(self.inner.read_page(pid(page_no))?.as_bytes().to_vec())
    }
}

impl StorageAdapter for FailingStorage {
    fn container_id(&self) -> ContainerId {
        self.inner.container_id()
    }

    fn read_page(&self, pid: PageId) -> storage::Result<Page> {
        self.inner.read_page(pid)
    }

    fn write_page(&self, page: &Page) -> storage::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        self.inner.write_page(page)
    }

    fn num_pages(&self) -> storage::Result<u32> {
        self.inner.num_pages()
    }

    fn insert_tuple(
        &self,
        cache: &PageCache,
        tid: TransactionId,
        record: &mut Record,
    ) -> storage::Result<Vec<PageId>> {
        self.inner.insert_tuple(cache, tid, record)
    }

    fn delete_tuple(
        &self,
        cache: &PageCache,
        tid: TransactionId,
        record: &Record,
    ) -> storage::Result<Vec<PageId>> {
        self.inner.delete_tuple(cache, tid, record)
    }

    fn scan<'a>(
        &'a self,
        cache: &'a PageCache,
        tid: TransactionId,
    ) -> storage::Result<Box<dyn Iterator<Item = storage::Result<Record>> + 'a>> {
        self.inner.scan(cache, tid)
    }
}
