use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

pub type Result<T> = std::result::Result<T, DiskManagerError>;

/// DiskManager handles the actual disk I/O: fixed-size page reads and
/// writes against the database file, and append-only writes against the
/// log file.
pub struct DiskManager {
    db_file: Mutex<File>,
    log_file: Mutex<File>,
    next_page_id: AtomicU32,
}

impl DiskManager {
    /// Open (or create) a database file; the log lives next to it with a
    /// `.log` suffix appended.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let mut log_path = PathBuf::from(db_path);
        log_path.set_extension(match db_path.extension() {
            Some(ext) => format!("{}.log", ext.to_string_lossy()),
            None => "log".to_string(),
        });
        Self::with_log_path(db_path, log_path)
    }

    pub fn with_log_path(
        db_path: impl AsRef<Path>,
        log_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(log_path)?;

        // Resume allocation past whatever the file already holds.
        // Page 0 is reserved for the header page.
        let pages_on_disk = Self::page_count_of(&db_file)?;
        let next_page_id = pages_on_disk.max(1);

        Ok(Self {
            db_file: Mutex::new(db_file),
            log_file: Mutex::new(log_file),
            next_page_id: AtomicU32::new(next_page_id),
        })
    }

    /// Read a page from disk. A read past the end of the file yields a
    /// zeroed page: the file grows lazily, so an allocated-but-unwritten
    /// page is indistinguishable from a fresh one.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut file = self.db_file.lock();
        let file_size = file.metadata()?.len();

        if offset + PAGE_SIZE as u64 > file_size {
            page.reset();
            page.page_id = page_id;
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut page.data)?;
        page.page_id = page_id;
        Ok(())
    }

    /// Write a page to its slot in the database file.
    pub fn write_page(&self, page: &Page) -> Result<()> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = Self::page_offset(page.page_id);
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data)?;
        file.flush()?;
        Ok(())
    }

    /// Hand out the next page id. Ids are strictly increasing and never 0.
    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Deallocation is advisory: the id is retired but the page's space in
    /// the file is not reclaimed.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Number of pages the database file currently covers.
    pub fn page_count(&self) -> Result<u32> {
        Self::page_count_of(&self.db_file.lock())
    }

    /// Append a blob of serialized log records and force it to stable
    /// storage.
    pub fn write_log(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut file = self.log_file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes of the log starting at `offset`.
    /// Returns the number of bytes actually read; fewer than requested
    /// means the end of the log was reached.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut file = self.log_file.lock();
        let file_size = file.metadata()?.len();
        if offset >= file_size {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Size of the log file in bytes.
    pub fn log_size(&self) -> Result<u64> {
        Ok(self.log_file.lock().metadata()?.len())
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id as u64 * PAGE_SIZE as u64
    }

    fn page_count_of(file: &File) -> Result<u32> {
        let len = file.metadata()?.len();
        Ok(len.div_ceil(PAGE_SIZE as u64) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_disk_manager() -> (DiskManager, NamedTempFile, NamedTempFile) {
        let db = NamedTempFile::new().unwrap();
        let log = NamedTempFile::new().unwrap();
        let dm = DiskManager::with_log_path(db.path(), log.path()).unwrap();
        (dm, db, log)
    }

    #[test]
    fn test_page_round_trip() {
        let (dm, _db, _log) = create_disk_manager();

        let mut page = Page::new(3);
        page.data[100] = 0xAB;
        page.set_lsn(17);
        dm.write_page(&page).unwrap();

        let mut read_back = Page::new(0);
        dm.read_page(3, &mut read_back).unwrap();
        assert_eq!(read_back.page_id, 3);
        assert_eq!(read_back.data[100], 0xAB);
        assert_eq!(read_back.lsn(), 17);
    }

    #[test]
    fn test_read_past_eof_yields_zeroed_page() {
        let (dm, _db, _log) = create_disk_manager();
        let mut page = Page::new(0);
        page.data[0] = 0xFF;
        dm.read_page(9, &mut page).unwrap();
        assert_eq!(page.page_id, 9);
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocate_is_strictly_increasing_and_skips_zero() {
        let (dm, _db, _log) = create_disk_manager();
        let a = dm.allocate_page();
        let b = dm.allocate_page();
        let c = dm.allocate_page();
        assert!(a >= 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_log_append_and_read() {
        let (dm, _db, _log) = create_disk_manager();
        dm.write_log(b"hello ").unwrap();
        dm.write_log(b"world").unwrap();

        let mut buf = [0u8; 32];
        let n = dm.read_log(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello world");

        // short read past the end
        let n = dm.read_log(&mut buf, 6).unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(dm.read_log(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn test_invalid_page_id_rejected() {
        let (dm, _db, _log) = create_disk_manager();
        let mut page = Page::new(INVALID_PAGE_ID);
        assert!(dm.read_page(INVALID_PAGE_ID, &mut page).is_err());
        assert!(dm.write_page(&page).is_err());
    }
}
