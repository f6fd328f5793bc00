use std::ops::{Deref, DerefMut};

use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};

const RECORD_COUNT_OFFSET: usize = 4;
const RECORDS_OFFSET: usize = 8;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;

/// View over page 0: a flat directory of (index name, root page id)
/// records. Names are at most 32 bytes, zero padded.
pub struct HeaderPage<P> {
    page: P,
}

impl<P: Deref<Target = Page>> HeaderPage<P> {
    pub fn new(page: P) -> Self {
        Self { page }
    }

    pub fn record_count(&self) -> u32 {
        LittleEndian::read_u32(&self.page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4])
    }

    fn capacity() -> u32 {
        ((PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE) as u32
    }

    fn name_at(&self, index: u32) -> &[u8] {
        let off = RECORDS_OFFSET + index as usize * RECORD_SIZE;
        let name = &self.page.data[off..off + NAME_SIZE];
        let len = name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        &name[..len]
    }

    fn find(&self, name: &str) -> Option<u32> {
        (0..self.record_count()).find(|&i| self.name_at(i) == name.as_bytes())
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        let index = self.find(name)?;
        let off = RECORDS_OFFSET + index as usize * RECORD_SIZE + NAME_SIZE;
        Some(LittleEndian::read_u32(&self.page.data[off..off + 4]))
    }
}

impl<P: DerefMut<Target = Page>> HeaderPage<P> {
    fn write_root_id(&mut self, index: u32, root_page_id: PageId) {
        let off = RECORDS_OFFSET + index as usize * RECORD_SIZE + NAME_SIZE;
        LittleEndian::write_u32(&mut self.page.data[off..off + 4], root_page_id);
    }

    /// Register a new index. False when the name is taken, too long, or
    /// the directory is full.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        if name.len() > NAME_SIZE || name.is_empty() {
            return false;
        }
        if self.find(name).is_some() {
            return false;
        }
        let count = self.record_count();
        if count >= Self::capacity() {
            return false;
        }
        let off = RECORDS_OFFSET + count as usize * RECORD_SIZE;
        self.page.data[off..off + NAME_SIZE].fill(0);
        self.page.data[off..off + name.len()].copy_from_slice(name.as_bytes());
        self.write_root_id(count, root_page_id);
        LittleEndian::write_u32(
            &mut self.page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4],
            count + 1,
        );
        true
    }

    /// Point an existing index at a new root. False when absent.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match self.find(name) {
            Some(index) => {
                self.write_root_id(index, root_page_id);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    #[test]
    fn test_insert_get_update() {
        let mut page = Page::new(0);
        let mut header = HeaderPage::new(&mut page);
        assert!(header.insert_record("orders_pk", 7));
        assert!(!header.insert_record("orders_pk", 9), "duplicate name");
        assert!(header.insert_record("users_pk", INVALID_PAGE_ID));

        assert_eq!(header.get_root_id("orders_pk"), Some(7));
        assert_eq!(header.get_root_id("users_pk"), Some(INVALID_PAGE_ID));
        assert_eq!(header.get_root_id("missing"), None);

        assert!(header.update_record("orders_pk", 12));
        assert!(!header.update_record("missing", 1));
        assert_eq!(header.get_root_id("orders_pk"), Some(12));
    }

    #[test]
    fn test_name_length_limit() {
        let mut page = Page::new(0);
        let mut header = HeaderPage::new(&mut page);
        let long = "x".repeat(NAME_SIZE + 1);
        assert!(!header.insert_record(&long, 1));
        let exact = "y".repeat(NAME_SIZE);
        assert!(header.insert_record(&exact, 2));
        assert_eq!(header.get_root_id(&exact), Some(2));
    }
}
