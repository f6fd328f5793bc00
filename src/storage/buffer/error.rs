use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::disk::DiskManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("All {0} frames are pinned")]
    PoolExhausted(usize),
    #[error("Page {0} is not resident")]
    PageNotFound(PageId),
    #[error("Page {0} is pinned")]
    PagePinned(PageId),
    #[error("Disk error: {0}")]
    Disk(#[from] DiskManagerError),
    #[error("Log flush failed: {0}")]
    LogFlush(String),
}
