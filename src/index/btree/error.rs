use thiserror::Error;

use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    /// The buffer pool could not provide a frame. Propagates to the
    /// caller; there is no automatic retry.
    #[error("Out of buffer pool frames")]
    OutOfMemory,
    #[error("Buffer pool error: {0}")]
    BufferPool(BufferPoolError),
    #[error("Tree structure is corrupted: {0}")]
    Corrupted(&'static str),
}

impl From<BufferPoolError> for BTreeError {
    fn from(e: BufferPoolError) -> Self {
        match e {
            BufferPoolError::PoolExhausted(_) => BTreeError::OutOfMemory,
            other => BTreeError::BufferPool(other),
        }
    }
}
