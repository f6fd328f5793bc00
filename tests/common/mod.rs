use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use karstdb::storage::buffer::BufferPoolManager;
use karstdb::storage::disk::DiskManager;
use karstdb::transaction::lock_manager::{LockManager, LockManagerConfig};
use karstdb::transaction::wal::log_manager::{LogManager, LogManagerConfig};
use karstdb::TransactionManager;

#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Paths for a database that must survive a simulated crash.
#[allow(dead_code)]
pub struct DbPaths {
    pub dir: TempDir,
    pub db: PathBuf,
    pub log: PathBuf,
}

#[allow(dead_code)]
pub fn create_db_paths() -> Result<DbPaths> {
    let dir = TempDir::new()?;
    let db = dir.path().join("karst.db");
    let log = dir.path().join("karst.log");
    Ok(DbPaths { dir, db, log })
}

#[allow(dead_code)]
pub fn open_disk(paths: &DbPaths) -> Result<Arc<DiskManager>> {
    Ok(Arc::new(DiskManager::with_log_path(&paths.db, &paths.log)?))
}

/// A buffer pool over a scratch database with no WAL attached.
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, DbPaths)> {
    let paths = create_db_paths()?;
    let disk = open_disk(&paths)?;
    let pool = Arc::new(BufferPoolManager::new(pool_size, disk, None)?);
    Ok((pool, paths))
}

/// Everything a transactional scenario needs, over the given paths so a
/// test can "crash" (drop this) and reopen.
#[allow(dead_code)]
pub struct Engine {
    pub disk: Arc<DiskManager>,
    pub log_manager: Arc<LogManager>,
    pub buffer_pool: Arc<BufferPoolManager>,
    pub lock_manager: Arc<LockManager>,
    pub txn_manager: TransactionManager,
}

#[allow(dead_code)]
pub fn open_engine(paths: &DbPaths, pool_size: usize) -> Result<Engine> {
    let disk = open_disk(paths)?;
    let log_manager = Arc::new(LogManager::new(LogManagerConfig::default(), disk.clone())?);
    let buffer_pool = Arc::new(BufferPoolManager::new(
        pool_size,
        disk.clone(),
        Some(log_manager.clone()),
    )?);
    let lock_manager = Arc::new(LockManager::new(LockManagerConfig::default()));
    let txn_manager = TransactionManager::new(lock_manager.clone(), log_manager.clone());
    Ok(Engine {
        disk,
        log_manager,
        buffer_pool,
        lock_manager,
        txn_manager,
    })
}

/// A tuple payload the way the executor layer would produce one.
#[allow(dead_code)]
pub fn make_tuple(id: i64, name: &str) -> Vec<u8> {
    bincode::serialize(&(id, name.to_string(), id % 2 == 0)).unwrap()
}
