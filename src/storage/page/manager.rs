use crate::common::types::{Page, SlotId, PAGE_SIZE};
use crate::storage::page::error::PageError;
use crate::storage::page::header::PageHeader;
use crate::storage::page::layout::{Slot, DELETE_MASK, HEADER_SIZE, SLOT_SIZE};

pub type Result<T> = std::result::Result<T, PageError>;

/// Slotted-page operations. Record bytes grow forward from the header,
/// the slot array grows backward from the end of the page; the free space
/// between them shrinks from both sides.
///
/// Deletion is two-step: `mark_delete` flags the slot (the bytes stay so
/// the delete can roll back), `apply_delete` tombstones it for good.
pub struct PageManager;

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageManager {
    pub fn new() -> Self {
        Self
    }

    pub fn init_page(&self, page: &mut Page) {
        PageHeader::new().write_to(&mut page.data);
    }

    pub fn get_header(&self, page: &Page) -> PageHeader {
        PageHeader::read_from(&page.data)
    }

    pub fn set_header(&self, page: &mut Page, header: &PageHeader) {
        header.write_to(&mut page.data);
    }

    /// Append a record into the next free slot.
    pub fn insert_record(&self, page: &mut Page, data: &[u8]) -> Result<SlotId> {
        let mut header = self.get_header(page);
        let needed = data.len() as u32 + SLOT_SIZE as u32;
        if header.free_space_size < needed {
            return Err(PageError::InsufficientSpace);
        }

        let slot_id = header.slot_count;
        let slot = Slot {
            offset: header.free_space_offset,
            length: data.len() as u32,
        };
        let start = header.free_space_offset as usize;
        page.data[start..start + data.len()].copy_from_slice(data);
        self.write_slot(page, slot_id, slot);

        header.free_space_offset += data.len() as u32;
        header.free_space_size -= needed;
        header.slot_count += 1;
        self.set_header(page, &header);
        Ok(slot_id)
    }

    /// Place a record into a specific slot. Used by redo and undo, which
    /// must restore a tuple to the exact address the log names; the slot
    /// array grows as needed, leaving intermediate slots empty.
    pub fn insert_record_at(&self, page: &mut Page, slot_id: SlotId, data: &[u8]) -> Result<()> {
        let mut header = self.get_header(page);

        let new_slots = (slot_id + 1).saturating_sub(header.slot_count);
        let needed = data.len() as u32 + new_slots * SLOT_SIZE as u32;
        if header.free_space_size < needed {
            return Err(PageError::InsufficientSpace);
        }

        if slot_id < header.slot_count {
            let slot = self.read_slot(page, slot_id);
            if !slot.is_empty() {
                return Err(PageError::DuplicateRecord);
            }
        } else {
            for s in header.slot_count..=slot_id {
                self.write_slot(page, s, Slot::EMPTY);
            }
            header.slot_count = slot_id + 1;
        }

        let slot = Slot {
            offset: header.free_space_offset,
            length: data.len() as u32,
        };
        let start = header.free_space_offset as usize;
        page.data[start..start + data.len()].copy_from_slice(data);
        self.write_slot(page, slot_id, slot);

        header.free_space_offset += data.len() as u32;
        header.free_space_size -= needed;
        self.set_header(page, &header);
        Ok(())
    }

    /// Flag a record as delete-pending without discarding its bytes.
    pub fn mark_delete(&self, page: &mut Page, slot_id: SlotId) -> Result<()> {
        let mut slot = self.occupied_slot(page, slot_id)?;
        if slot.is_deleted() {
            return Err(PageError::RecordNotFound);
        }
        slot.length |= DELETE_MASK;
        self.write_slot(page, slot_id, slot);
        Ok(())
    }

    /// Clear a pending delete mark.
    pub fn rollback_delete(&self, page: &mut Page, slot_id: SlotId) -> Result<()> {
        let mut slot = self.occupied_slot(page, slot_id)?;
        slot.length &= !DELETE_MASK;
        self.write_slot(page, slot_id, slot);
        Ok(())
    }

    /// Tombstone a slot for good. The record bytes are abandoned; space is
    /// only reclaimed by compaction.
    pub fn apply_delete(&self, page: &mut Page, slot_id: SlotId) -> Result<()> {
        self.occupied_slot(page, slot_id)?;
        self.write_slot(page, slot_id, Slot::EMPTY);
        Ok(())
    }

    /// Overwrite a record in place, relocating within the page when the
    /// replacement is larger.
    pub fn update_record(&self, page: &mut Page, slot_id: SlotId, data: &[u8]) -> Result<()> {
        let slot = self.occupied_slot(page, slot_id)?;
        if slot.is_deleted() {
            return Err(PageError::RecordNotFound);
        }

        let new_len = data.len() as u32;
        if new_len > slot.record_len() {
            // the record is rewritten into the free region; the old bytes
            // are abandoned until compaction, so the full new length comes
            // out of the free space
            let mut header = self.get_header(page);
            if header.free_space_size < new_len {
                return Err(PageError::InsufficientSpace);
            }
            let new_slot = Slot {
                offset: header.free_space_offset,
                length: new_len,
            };
            let start = header.free_space_offset as usize;
            page.data[start..start + data.len()].copy_from_slice(data);
            self.write_slot(page, slot_id, new_slot);
            header.free_space_offset += new_len;
            header.free_space_size -= new_len;
            self.set_header(page, &header);
            return Ok(());
        }

        let start = slot.offset as usize;
        page.data[start..start + data.len()].copy_from_slice(data);
        if new_len < slot.record_len() {
            self.write_slot(
                page,
                slot_id,
                Slot {
                    offset: slot.offset,
                    length: new_len,
                },
            );
        }
        Ok(())
    }

    /// Read a live record. Mark-deleted and tombstoned slots report
    /// `RecordNotFound`.
    pub fn get_record(&self, page: &Page, slot_id: SlotId) -> Result<Vec<u8>> {
        let slot = self.occupied_slot(page, slot_id)?;
        if slot.is_deleted() {
            return Err(PageError::RecordNotFound);
        }
        Ok(self.record_bytes(page, slot))
    }

    /// Read a record even if it is mark-deleted. Commit needs the bytes of
    /// a pending delete for its before-image.
    pub fn get_record_any(&self, page: &Page, slot_id: SlotId) -> Result<Vec<u8>> {
        let slot = self.occupied_slot(page, slot_id)?;
        Ok(self.record_bytes(page, slot))
    }

    pub fn slot_count(&self, page: &Page) -> u32 {
        self.get_header(page).slot_count
    }

    pub fn free_space(&self, page: &Page) -> u32 {
        self.get_header(page).free_space_size
    }

    /// Largest record an empty page can take.
    pub fn max_record_size() -> usize {
        PAGE_SIZE - HEADER_SIZE - SLOT_SIZE
    }

    fn occupied_slot(&self, page: &Page, slot_id: SlotId) -> Result<Slot> {
        let header = self.get_header(page);
        if slot_id >= header.slot_count {
            return Err(PageError::InvalidSlot(slot_id));
        }
        let slot = self.read_slot(page, slot_id);
        if slot.is_empty() {
            return Err(PageError::RecordNotFound);
        }
        Ok(slot)
    }

    fn record_bytes(&self, page: &Page, slot: Slot) -> Vec<u8> {
        let start = slot.offset as usize;
        let end = start + slot.record_len() as usize;
        page.data[start..end].to_vec()
    }

    fn slot_pos(slot_id: SlotId) -> usize {
        PAGE_SIZE - SLOT_SIZE * (slot_id as usize + 1)
    }

    fn read_slot(&self, page: &Page, slot_id: SlotId) -> Slot {
        let pos = Self::slot_pos(slot_id);
        Slot::from_bytes(&page.data[pos..pos + SLOT_SIZE])
    }

    fn write_slot(&self, page: &mut Page, slot_id: SlotId, slot: Slot) {
        let pos = Self::slot_pos(slot_id);
        page.data[pos..pos + SLOT_SIZE].copy_from_slice(&slot.to_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Page;

    fn fresh_page() -> (PageManager, Page) {
        let pm = PageManager::new();
        let mut page = Page::new(1);
        pm.init_page(&mut page);
        (pm, page)
    }

    #[test]
    fn test_insert_and_get() {
        let (pm, mut page) = fresh_page();
        let a = pm.insert_record(&mut page, b"alpha").unwrap();
        let b = pm.insert_record(&mut page, b"beta").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(pm.get_record(&page, a).unwrap(), b"alpha");
        assert_eq!(pm.get_record(&page, b).unwrap(), b"beta");
    }

    #[test]
    fn test_mark_rollback_apply_delete() {
        let (pm, mut page) = fresh_page();
        let slot = pm.insert_record(&mut page, b"tuple").unwrap();

        pm.mark_delete(&mut page, slot).unwrap();
        assert!(matches!(
            pm.get_record(&page, slot),
            Err(PageError::RecordNotFound)
        ));
        // bytes survive the mark so the delete can roll back
        assert_eq!(pm.get_record_any(&page, slot).unwrap(), b"tuple");

        pm.rollback_delete(&mut page, slot).unwrap();
        assert_eq!(pm.get_record(&page, slot).unwrap(), b"tuple");

        pm.mark_delete(&mut page, slot).unwrap();
        pm.apply_delete(&mut page, slot).unwrap();
        assert!(pm.get_record_any(&page, slot).is_err());
    }

    #[test]
    fn test_update_in_place_and_relocated() {
        let (pm, mut page) = fresh_page();
        let slot = pm.insert_record(&mut page, b"four").unwrap();

        pm.update_record(&mut page, slot, b"two").unwrap();
        assert_eq!(pm.get_record(&page, slot).unwrap(), b"two");

        pm.update_record(&mut page, slot, b"a longer record").unwrap();
        assert_eq!(pm.get_record(&page, slot).unwrap(), b"a longer record");
    }

    #[test]
    fn test_repeated_growing_updates_track_free_space() {
        let (pm, mut page) = fresh_page();
        let slot = pm.insert_record(&mut page, b"seed").unwrap();

        // free space must always equal the physical gap between the data
        // region and the slot array; every relocation consumes the full
        // new length, not just the growth
        let gap = |page: &Page| {
            let header = PageHeader::read_from(&page.data);
            PAGE_SIZE as u32
                - header.free_space_offset
                - SLOT_SIZE as u32 * header.slot_count
        };

        let mut len = 8;
        loop {
            let data = vec![0x5Au8; len];
            match pm.update_record(&mut page, slot, &data) {
                Ok(()) => {
                    assert_eq!(pm.free_space(&page), gap(&page));
                    assert_eq!(pm.get_record(&page, slot).unwrap(), data);
                }
                Err(PageError::InsufficientSpace) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            len += 256;
        }
        assert!(len > 8, "at least one growing update must succeed");
        // the refused update left the record and the slot array intact
        assert_eq!(pm.get_record(&page, slot).unwrap().len(), len - 256);
    }

    #[test]
    fn test_insert_record_at_grows_slot_array() {
        let (pm, mut page) = fresh_page();
        pm.insert_record_at(&mut page, 3, b"late").unwrap();
        assert_eq!(pm.slot_count(&page), 4);
        assert_eq!(pm.get_record(&page, 3).unwrap(), b"late");
        for s in 0..3 {
            assert!(matches!(
                pm.get_record(&page, s),
                Err(PageError::RecordNotFound)
            ));
        }
        // re-inserting into an occupied slot is refused
        assert!(matches!(
            pm.insert_record_at(&mut page, 3, b"again"),
            Err(PageError::DuplicateRecord)
        ));
        // a tombstoned slot can be refilled
        pm.apply_delete(&mut page, 3).unwrap();
        pm.insert_record_at(&mut page, 3, b"refill").unwrap();
        assert_eq!(pm.get_record(&page, 3).unwrap(), b"refill");
    }

    #[test]
    fn test_page_fills_up() {
        let (pm, mut page) = fresh_page();
        let record = [7u8; 512];
        let mut inserted = 0;
        loop {
            match pm.insert_record(&mut page, &record) {
                Ok(_) => inserted += 1,
                Err(PageError::InsufficientSpace) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(inserted >= 7);
        assert!(pm.free_space(&page) < 512 + SLOT_SIZE as u32);
    }
}
