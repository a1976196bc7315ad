use crate::ids::{PageId, TransactionId};
use crate::{Result, StorageError};

pub const PAGE_SIZE: usize = 8192;

// Header layout (little endian):
//   0..4   page number
//   4..6   slot count
//   6..8   free space end
//   8..12  checksum (CRC32 over the rest of the page)
//   12..16 reserved
const HEADER_SIZE: usize = 16;
const SLOT_SIZE: usize = 4;
const CHECKSUM_RANGE: std::ops::Range<usize> = 8..12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_no: u32,
    pub slot_count: u16,
    pub free_space_end: u16,
    pub checksum: u32,
}

// For slotted pages, we need slot entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEntry {
    pub offset: u16, // offset from start of page
    pub length: u16, // 0 marks a deleted record
}

/// A fixed-size slotted page plus the transaction that last dirtied it.
///
/// The byte payload is what lives on disk. The dirty owner is purely
/// in-memory state owned by the page cache: it is `Some(tid)` from the
/// moment `tid` mutates the page until the page is flushed or rolled back.
#[derive(Clone)]
pub struct Page {
    id: PageId,
    data: Box<[u8]>,
    dirty_owner: Option<TransactionId>,
}

impl Page {
    pub const HEADER_SIZE: usize = HEADER_SIZE;
    pub const SLOT_SIZE: usize = SLOT_SIZE;

    /// Largest record a single empty page can hold.
    pub const fn max_record_len() -> usize {
        PAGE_SIZE - HEADER_SIZE - SLOT_SIZE
    }

    pub fn new(id: PageId) -> Self {
        let mut page = Self {
            id,
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            dirty_owner: None,
        };

        page.set_header(PageHeader {
            page_no: id.page_no(),
            slot_count: 0,
            free_space_end: PAGE_SIZE as u16,
            checksum: 0,
        });
        page
    }

    /// Rebuilds a page from its on-disk image, validating the header.
    pub fn from_bytes(id: PageId, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(StorageError::Corrupt(format!(
                "page {} has {} bytes, expected {}",
                id,
                bytes.len(),
                PAGE_SIZE
            )));
        }

        let page = Self {
            id,
            data: bytes.to_vec().into_boxed_slice(),
            dirty_owner: None,
        };

        let header = page.header();
        if header.page_no != id.page_no() {
            return Err(StorageError::Corrupt(format!(
                "page {} carries page number {}",
                id, header.page_no
            )));
        }
        let slots_end = HEADER_SIZE + header.slot_count as usize * SLOT_SIZE;
        let free_end = header.free_space_end as usize;
        if slots_end > free_end || free_end > PAGE_SIZE {
            return Err(StorageError::Corrupt(format!(
                "page {} has an inconsistent slot directory",
                id
            )));
        }

        Ok(page)
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn dirty_owner(&self) -> Option<TransactionId> {
        self.dirty_owner
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_owner.is_some()
    }

    /// Records `tid` as the transaction that last mutated this page.
    pub fn mark_dirty(&mut self, tid: TransactionId) {
        self.dirty_owner = Some(tid);
    }

    pub fn mark_clean(&mut self) {
        self.dirty_owner = None;
    }

    pub fn header(&self) -> PageHeader {
        PageHeader {
            page_no: read_u32(&self.data, 0),
            slot_count: read_u16(&self.data, 4),
            free_space_end: read_u16(&self.data, 6),
            checksum: read_u32(&self.data, 8),
        }
    }

    fn set_header(&mut self, header: PageHeader) {
        self.data[0..4].copy_from_slice(&header.page_no.to_le_bytes());
        self.data[4..6].copy_from_slice(&header.slot_count.to_le_bytes());
        self.data[6..8].copy_from_slice(&header.free_space_end.to_le_bytes());
        self.data[8..12].copy_from_slice(&header.checksum.to_le_bytes());
    }

    pub fn slot_count(&self) -> usize {
        read_u16(&self.data, 4) as usize
    }

    fn set_slot_count(&mut self, count: usize) {
        self.data[4..6].copy_from_slice(&(count as u16).to_le_bytes());
    }

    fn free_space_end(&self) -> usize {
        read_u16(&self.data, 6) as usize
    }

    fn set_free_space_end(&mut self, end: usize) {
        self.data[6..8].copy_from_slice(&(end as u16).to_le_bytes());
    }

    pub fn get_slot(&self, index: usize) -> Option<SlotEntry> {
        if index >= self.slot_count() {
            return None;
        }

        let slot_offset = HEADER_SIZE + index * SLOT_SIZE;
        Some(SlotEntry {
            offset: read_u16(&self.data, slot_offset),
            length: read_u16(&self.data, slot_offset + 2),
        })
    }

    fn set_slot(&mut self, index: usize, slot: SlotEntry) {
        let slot_offset = HEADER_SIZE + index * SLOT_SIZE;
        self.data[slot_offset..slot_offset + 2].copy_from_slice(&slot.offset.to_le_bytes());
        self.data[slot_offset + 2..slot_offset + 4].copy_from_slice(&slot.length.to_le_bytes());
    }

    fn slot_array_end(&self) -> usize {
        HEADER_SIZE + self.slot_count() * SLOT_SIZE
    }

    /// Contiguous free bytes between the slot directory and the records.
    pub fn free_space(&self) -> usize {
        self.free_space_end() - self.slot_array_end()
    }

    fn live_bytes(&self) -> usize {
        (0..self.slot_count())
            .filter_map(|i| self.get_slot(i))
            .map(|slot| slot.length as usize)
            .sum()
    }

    /// Free bytes after a compaction.
    fn reclaimable_space(&self) -> usize {
        PAGE_SIZE - self.slot_array_end() - self.live_bytes()
    }

    fn first_free_slot(&self) -> Option<usize> {
        (0..self.slot_count()).find(|&i| matches!(self.get_slot(i), Some(s) if s.length == 0))
    }

    pub fn has_space_for(&self, record_size: usize) -> bool {
        if record_size == 0 {
            return false;
        }
        let slot_cost = if self.first_free_slot().is_some() { 0 } else { SLOT_SIZE };
        self.reclaimable_space() >= record_size + slot_cost
    }

    pub fn get_record(&self, slot_index: usize) -> Option<&[u8]> {
        let slot = self.get_slot(slot_index)?;

        if slot.length == 0 {
            return None; // Deleted record
        }

        let start = slot.offset as usize;
        let end = start + slot.length as usize;

        if end <= PAGE_SIZE {
            Some(&self.data[start..end])
        } else {
            None
        }
    }

    /// Live records with their slot index, in slot order.
    pub fn records(&self) -> impl Iterator<Item = (usize, &[u8])> + '_ {
        (0..self.slot_count()).filter_map(move |i| self.get_record(i).map(|r| (i, r)))
    }

    /// Add a record to the page, returning the slot index if successful.
    ///
    /// Deleted slots are reused, and the page is compacted first when the
    /// record only fits once fragmented space is reclaimed.
    pub fn add_record(&mut self, record: &[u8]) -> Option<usize> {
        if !self.has_space_for(record.len()) {
            return None;
        }

        let reused = self.first_free_slot();
        let slot_cost = if reused.is_some() { 0 } else { SLOT_SIZE };
        if self.free_space() < record.len() + slot_cost {
            self.compact();
        }

        let slot_index = match reused {
            Some(index) => index,
            None => {
                let index = self.slot_count();
                self.set_slot_count(index + 1);
                index
            }
        };

        let new_record_end = self.free_space_end();
        let new_record_start = new_record_end - record.len();
        self.data[new_record_start..new_record_end].copy_from_slice(record);

        self.set_slot(
            slot_index,
            SlotEntry {
                offset: new_record_start as u16,
                length: record.len() as u16,
            },
        );
        self.set_free_space_end(new_record_start);

        Some(slot_index)
    }

    /// Marks a live record deleted. Space is reclaimed by the next compaction.
    pub fn delete_record(&mut self, slot_index: usize) -> bool {
        match self.get_slot(slot_index) {
            Some(mut slot) if slot.length > 0 => {
                slot.length = 0;
                self.set_slot(slot_index, slot);
                true
            }
            _ => false,
        }
    }

    pub fn compact(&mut self) {
        let mut new_data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let slots_end = self.slot_array_end();
        new_data[..slots_end].copy_from_slice(&self.data[..slots_end]);

        let mut current_end = PAGE_SIZE;
        let mut moved = Vec::with_capacity(self.slot_count());

        for (i, record) in self.records() {
            let new_start = current_end - record.len();
            new_data[new_start..current_end].copy_from_slice(record);
            moved.push((
                i,
                SlotEntry {
                    offset: new_start as u16,
                    length: record.len() as u16,
                },
            ));
            current_end = new_start;
        }

        self.data = new_data;
        for (i, slot) in moved {
            self.set_slot(i, slot);
        }
        self.set_free_space_end(current_end);
    }
}

impl PartialEq for Page {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.data == other.data
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("slots", &self.slot_count())
            .field("free_space", &self.free_space())
            .field("dirty_owner", &self.dirty_owner)
            .finish()
    }
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn checksum_of(image: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&image[..CHECKSUM_RANGE.start]);
    hasher.update(&image[CHECKSUM_RANGE.end..]);
    hasher.finalize()
}

/// Writes the CRC32 of a page image into its checksum field.
pub fn stamp_checksum(image: &mut [u8]) {
    let checksum = checksum_of(image);
    image[CHECKSUM_RANGE].copy_from_slice(&checksum.to_le_bytes());
}

pub fn verify_checksum(image: &[u8]) -> bool {
    image.len() == PAGE_SIZE && read_u32(image, CHECKSUM_RANGE.start) == checksum_of(image)
}
