// storage/src/file/mod.rs

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::cache::{PageCache, PageHandle};
use crate::ids::{ContainerId, PageId, RecordId, TransactionId};
use crate::lock::LockMode;
use crate::page::{self, Page, PAGE_SIZE};
use crate::record::Record;
use crate::{Result, StorageError};

/// Page-granular persistence for one container, as seen by the page cache.
///
/// `insert_tuple` and `delete_tuple` fetch the pages they touch through the
/// cache (taking exclusive locks for `tid`), mutate them in place, set their
/// dirty owner and return the ids of every page touched.
pub trait StorageAdapter: Send + Sync {
    fn container_id(&self) -> ContainerId;

    fn read_page(&self, pid: PageId) -> Result<Page>;

    fn write_page(&self, page: &Page) -> Result<()>;

    fn num_pages(&self) -> Result<u32>;

    fn insert_tuple(
        &self,
        cache: &PageCache,
        tid: TransactionId,
        record: &mut Record,
    ) -> Result<Vec<PageId>>;

    fn delete_tuple(
        &self,
        cache: &PageCache,
        tid: TransactionId,
        record: &Record,
    ) -> Result<Vec<PageId>>;

    /// Every live record, read page by page under shared locks.
    fn scan<'a>(
        &'a self,
        cache: &'a PageCache,
        tid: TransactionId,
    ) -> Result<Box<dyn Iterator<Item = Result<Record>> + 'a>>;
}

/// Magic number to identify heap files
const FILE_MAGIC: [u8; 4] = *b"HPDB";

const FILE_VERSION: u32 = 1;

const HEADER_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
struct FileHeader {
    // Core identification (16 bytes)
    magic: [u8; 4],   // "HPDB"
    version: u32,     // File format version
    header_size: u32, // Size of this header (512)
    page_size: u32,   // Page size (8192)

    // Page management (8 bytes)
    page_count: u32,   // Data pages in file, header page excluded
    container_id: u32, // Container this file stores

    // Timestamps (16 bytes)
    created_at: u64,
    last_modified: u64,

    // Integrity (8 bytes)
    header_checksum: u32,    // CRC32 of header
    data_checksum_flag: u32, // 0 = off, 1 = on for data pages
}

impl FileHeader {
    fn new(container: ContainerId, checksums: bool) -> Self {
        let now = unix_now();

        Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            header_size: HEADER_SIZE as u32,
            page_size: PAGE_SIZE as u32,

            page_count: 0,
            container_id: container.0,

            created_at: now,
            last_modified: now,

            header_checksum: 0,
            data_checksum_flag: u32::from(checksums),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.magic != FILE_MAGIC {
            return Err(StorageError::Corrupt(
                "invalid heap file: wrong magic number".to_string(),
            ));
        }

        if self.version > FILE_VERSION {
            return Err(StorageError::Corrupt(format!(
                "unsupported file version: {}",
                self.version
            )));
        }

        if self.page_size != PAGE_SIZE as u32 {
            return Err(StorageError::Corrupt(format!(
                "invalid page size: expected {}, got {}",
                PAGE_SIZE, self.page_size
            )));
        }

        Ok(())
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.header_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.page_size.to_le_bytes());

        bytes[16..20].copy_from_slice(&self.page_count.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.container_id.to_le_bytes());

        bytes[24..32].copy_from_slice(&self.created_at.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.last_modified.to_le_bytes());

        bytes[40..44].copy_from_slice(&self.header_checksum.to_le_bytes());
        bytes[44..48].copy_from_slice(&self.data_checksum_flag.to_le_bytes());

        // 48..512 reserved
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StorageError::Corrupt("invalid file header size".to_string()));
        }

        let header = Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            version: le_u32(bytes, 4),
            header_size: le_u32(bytes, 8),
            page_size: le_u32(bytes, 12),

            page_count: le_u32(bytes, 16),
            container_id: le_u32(bytes, 20),

            created_at: le_u64(bytes, 24),
            last_modified: le_u64(bytes, 32),

            header_checksum: le_u32(bytes, 40),
            data_checksum_flag: le_u32(bytes, 44),
        };

        header.validate()?;
        Ok(header)
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[0..40]); // Hash everything before checksum field
        hasher.update(&bytes[44..]); // Hash everything after checksum field
        hasher.finalize()
    }

    fn update_checksum(&mut self) {
        self.header_checksum = self.compute_checksum();
    }

    fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.header_checksum
    }
}

struct FileState {
    file: File,
    header: FileHeader,
}

impl FileState {
    fn write_header(&mut self) -> Result<()> {
        self.header.update_checksum();

        // The header occupies a full page so data pages stay page aligned
        let mut header_page = [0u8; PAGE_SIZE];
        header_page[0..HEADER_SIZE].copy_from_slice(&self.header.to_bytes());

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_page)?;
        Ok(())
    }

    fn write_image(&mut self, page_no: u32, image: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(page_offset(page_no)))?;
        self.file.write_all(image)?;

        if page_no >= self.header.page_count {
            self.header.page_count = page_no + 1;
        }
        self.header.last_modified = unix_now();
        self.write_header()
    }

    fn encode(&self, page: &Page) -> Vec<u8> {
        let mut image = page.as_bytes().to_vec();
        if self.header.data_checksum_flag != 0 {
            page::stamp_checksum(&mut image);
        }
        image
    }
}

/// A heap file: an unordered collection of slotted pages behind a header
/// page. Data page `n` lives at byte offset `(n + 1) * PAGE_SIZE`.
pub struct HeapFile {
    container: ContainerId,
    path: PathBuf,
    state: Mutex<FileState>,
}

impl HeapFile {
    pub fn create_new(path: &Path, container: ContainerId, checksums: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut state = FileState {
            file,
            header: FileHeader::new(container, checksums),
        };
        state.write_header()?;
        debug!("created heap file {} for container {}", path.display(), container);

        Ok(Self {
            container,
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = Self::read_header(&mut file)?;
        let container = ContainerId(header.container_id);
        debug!(
            "opened heap file {} for container {} with {} pages",
            path.display(),
            container,
            header.page_count
        );

        Ok(Self {
            container,
            path: path.to_path_buf(),
            state: Mutex::new(FileState { file, header }),
        })
    }

    fn read_header(file: &mut File) -> Result<FileHeader> {
        file.seek(SeekFrom::Start(0))?;

        let mut buffer = [0u8; PAGE_SIZE];
        file.read_exact(&mut buffer)?;

        let header = FileHeader::from_bytes(&buffer[0..HEADER_SIZE])?;
        if !header.verify_checksum() {
            return Err(StorageError::Corrupt(
                "file header checksum mismatch".to_string(),
            ));
        }

        Ok(header)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checksums_enabled(&self) -> bool {
        self.state.lock().header.data_checksum_flag != 0
    }

    /// Appends an empty, formatted page and returns its id.
    ///
    /// The page is written straight to disk; callers then reach it through
    /// the page cache like any other page.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut state = self.state.lock();
        let pid = PageId::new(self.container, state.header.page_count);

        let image = state.encode(&Page::new(pid));
        state.write_image(pid.page_no(), &image)?;
        debug!("allocated page {}", pid);

        Ok(pid)
    }

    fn check_container(&self, pid: PageId) -> Result<()> {
        if pid.container() != self.container {
            return Err(StorageError::Usage(format!(
                "page {} does not belong to container {}",
                pid, self.container
            )));
        }
        Ok(())
    }
}

impl StorageAdapter for HeapFile {
    fn container_id(&self) -> ContainerId {
        self.container
    }

    fn read_page(&self, pid: PageId) -> Result<Page> {
        self.check_container(pid)?;
        let mut state = self.state.lock();

        if pid.page_no() >= state.header.page_count {
            return Err(StorageError::PageNotFound(pid));
        }

        state.file.seek(SeekFrom::Start(page_offset(pid.page_no())))?;
        let mut buffer = vec![0u8; PAGE_SIZE];
        state.file.read_exact(&mut buffer)?;

        if state.header.data_checksum_flag != 0 && !page::verify_checksum(&buffer) {
            return Err(StorageError::ChecksumMismatch(pid));
        }

        trace!("read page {} from {}", pid, self.path.display());
        Page::from_bytes(pid, &buffer)
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        self.check_container(page.id())?;
        let mut state = self.state.lock();

        let image = state.encode(page);
        state.write_image(page.id().page_no(), &image)?;
        trace!("wrote page {} to {}", page.id(), self.path.display());
        Ok(())
    }

    fn num_pages(&self) -> Result<u32> {
        Ok(self.state.lock().header.page_count)
    }

    fn insert_tuple(
        &self,
        cache: &PageCache,
        tid: TransactionId,
        record: &mut Record,
    ) -> Result<Vec<PageId>> {
        let len = record.len();
        if len == 0 {
            return Err(StorageError::Usage("cannot insert an empty record".to_string()));
        }
        if len > Page::max_record_len() {
            return Err(StorageError::RecordTooLarge {
                len,
                max: Page::max_record_len(),
            });
        }

        // Exclusive locks while searching keep two inserters from racing to
        // upgrade on the same page.
        for page_no in 0..self.num_pages()? {
            let pid = PageId::new(self.container, page_no);
            let handle = cache.get_page(tid, pid, LockMode::Exclusive)?;
            if place_record(&handle, tid, record) {
                return Ok(vec![pid]);
            }
        }

        let pid = self.allocate_page()?;
        let handle = cache.get_page(tid, pid, LockMode::Exclusive)?;
        if place_record(&handle, tid, record) {
            Ok(vec![pid])
        } else {
            Err(StorageError::PageFull(pid))
        }
    }

    fn delete_tuple(
        &self,
        cache: &PageCache,
        tid: TransactionId,
        record: &Record,
    ) -> Result<Vec<PageId>> {
        let rid = record
            .rid()
            .ok_or_else(|| StorageError::Usage("record has no record id".to_string()))?;
        let pid = rid.page();
        self.check_container(pid)?;

        let handle = cache.get_page(tid, pid, LockMode::Exclusive)?;
        let mut page = handle.write();
        if !page.delete_record(rid.slot() as usize) {
            return Err(StorageError::InvalidSlot {
                page_id: pid,
                index: rid.slot() as usize,
            });
        }
        page.mark_dirty(tid);

        Ok(vec![pid])
    }

    fn scan<'a>(
        &'a self,
        cache: &'a PageCache,
        tid: TransactionId,
    ) -> Result<Box<dyn Iterator<Item = Result<Record>> + 'a>> {
        Ok(Box::new(HeapScan {
            container: self.container,
            cache,
            tid,
            page_count: self.num_pages()?,
            next_page: 0,
            buffered: VecDeque::new(),
        }))
    }
}

fn place_record(handle: &PageHandle, tid: TransactionId, record: &mut Record) -> bool {
    let mut page = handle.write();
    if !page.has_space_for(record.len()) {
        return false;
    }
    match page.add_record(record.data()) {
        Some(slot) => {
            page.mark_dirty(tid);
            record.set_rid(Some(RecordId::new(page.id(), slot as u16)));
            true
        }
        None => false,
    }
}

/// Sequential scan over a heap file through the page cache.
///
/// Pages are fetched one at a time under shared locks; the records of the
/// current page are copied out so no page guard outlives a `next` call.
struct HeapScan<'a> {
    container: ContainerId,
    cache: &'a PageCache,
    tid: TransactionId,
    page_count: u32,
    next_page: u32,
    buffered: VecDeque<Record>,
}

impl Iterator for HeapScan<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                return Some(Ok(record));
            }
            if self.next_page >= self.page_count {
                return None;
            }

            let pid = PageId::new(self.container, self.next_page);
            self.next_page += 1;

            let handle = match self.cache.get_page(self.tid, pid, LockMode::Shared) {
                Ok(handle) => handle,
                Err(err) => {
                    self.next_page = self.page_count;
                    return Some(Err(err));
                }
            };
            let page = handle.read();
            self.buffered.extend(
                page.records()
                    .map(|(slot, data)| Record::stored(RecordId::new(pid, slot as u16), data)),
            );
        }
    }
}

fn page_offset(page_no: u32) -> u64 {
    (page_no as u64 + 1) * PAGE_SIZE as u64
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}
