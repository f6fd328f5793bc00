// Export public modules
pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use index::btree::{BPlusTree, BTreeError, BTreeIterator, IndexKey};
pub use storage::buffer::{BufferPoolError, BufferPoolManager, ParallelBufferPoolManager};
pub use storage::disk::DiskManager;
pub use storage::heap::{HeapError, TableHeap};
pub use storage::page::PageManager;
pub use transaction::wal::{LogManager, LogManagerConfig, LogRecovery};
pub use transaction::{
    IsolationLevel, LockManager, LockManagerConfig, Transaction, TransactionError,
    TransactionManager, TransactionState,
};
