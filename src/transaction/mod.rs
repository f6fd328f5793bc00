pub mod lock_manager;
pub mod transaction;
pub mod transaction_manager;
pub mod wal;

pub use lock_manager::{LockManager, LockManagerConfig, LockMode};
pub use transaction::{
    IsolationLevel, RollbackIndex, Transaction, TransactionError, TransactionState, WriteOp,
};
pub use transaction_manager::TransactionManager;
