use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::page::layout::HEADER_SIZE;

/// Heap page header. Serialized right after the 4-byte page LSN.
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub free_space_offset: u32,
    pub free_space_size: u32,
    pub slot_count: u32,
    pub next_page_id: Option<PageId>,
    pub prev_page_id: Option<PageId>,
}

impl Default for PageHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl PageHeader {
    pub fn new() -> Self {
        Self {
            free_space_offset: HEADER_SIZE as u32,
            free_space_size: (PAGE_SIZE - HEADER_SIZE) as u32,
            slot_count: 0,
            next_page_id: None,
            prev_page_id: None,
        }
    }

    /// Serialize into the header area of a page (bytes 4..24)
    pub fn write_to(&self, data: &mut [u8]) {
        LittleEndian::write_u32(&mut data[4..8], self.free_space_offset);
        LittleEndian::write_u32(&mut data[8..12], self.free_space_size);
        LittleEndian::write_u32(&mut data[12..16], self.slot_count);
        let next = self.next_page_id.unwrap_or(INVALID_PAGE_ID);
        LittleEndian::write_u32(&mut data[16..20], next);
        let prev = self.prev_page_id.unwrap_or(INVALID_PAGE_ID);
        LittleEndian::write_u32(&mut data[20..24], prev);
    }

    pub fn read_from(data: &[u8]) -> Self {
        let next = LittleEndian::read_u32(&data[16..20]);
        let prev = LittleEndian::read_u32(&data[20..24]);
        Self {
            free_space_offset: LittleEndian::read_u32(&data[4..8]),
            free_space_size: LittleEndian::read_u32(&data[8..12]),
            slot_count: LittleEndian::read_u32(&data[12..16]),
            next_page_id: (next != INVALID_PAGE_ID).then_some(next),
            prev_page_id: (prev != INVALID_PAGE_ID).then_some(prev),
        }
    }
}
