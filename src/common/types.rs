use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;

/// Page size in bytes (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Sentinel for "no page"
pub const INVALID_PAGE_ID: PageId = u32::MAX;

/// Page 0 holds the (index name -> root page id) directory
pub const HEADER_PAGE_ID: PageId = 0;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Transaction ID type
pub type TxnId = u32;

/// Slot number within a heap page
pub type SlotId = u32;

/// LSN (Log Sequence Number) type
pub type Lsn = u32;

/// LSNs start at 1; 0 marks "no record"
pub const INVALID_LSN: Lsn = 0;

/// Record identifier: the (page, slot) address of a tuple in the heap.
/// Opaque to the index layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: SlotId,
}

impl Rid {
    /// On-disk footprint: page id then slot, little endian
    pub const ENCODED_SIZE: usize = 8;

    pub fn new(page_id: PageId, slot: SlotId) -> Self {
        Self { page_id, slot }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.page_id);
        LittleEndian::write_u32(&mut buf[4..8], self.slot);
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            page_id: LittleEndian::read_u32(&buf[0..4]),
            slot: LittleEndian::read_u32(&buf[4..8]),
        }
    }
}

/// Page structure. Every page kind stores its LSN in the first four bytes
/// of the data block, so the value survives the disk round trip.
#[derive(Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    pub fn lsn(&self) -> Lsn {
        LittleEndian::read_u32(&self.data[0..4])
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        LittleEndian::write_u32(&mut self.data[0..4], lsn);
    }

    pub fn reset(&mut self) {
        self.data = [0; PAGE_SIZE];
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_id", &self.page_id)
            .field("lsn", &self.lsn())
            .finish()
    }
}

/// Smart pointer to a page; the inner lock is the page latch
pub type PagePtr = Arc<RwLock<Page>>;

/// Buffer pool frame structure
#[derive(Debug)]
pub struct Frame {
    pub page: PagePtr,
    pub frame_id: FrameId,
    pub is_dirty: bool,
    pub pin_count: u32,
}

impl Frame {
    pub fn new(frame_id: FrameId, page: PagePtr) -> Self {
        Self {
            page,
            frame_id,
            is_dirty: false,
            pin_count: 0,
        }
    }
}

/// Smart pointer to a frame
pub type FramePtr = Arc<RwLock<Frame>>;
