use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::common::types::Lsn;
use crate::storage::disk::{DiskManager, DiskManagerError};
use crate::transaction::wal::log_record::LogRecord;

#[derive(Error, Debug)]
pub enum LogManagerError {
    #[error("IO error: {0}")]
    Io(#[from] DiskManagerError),
    #[error("Log record of {0} bytes exceeds the log buffer")]
    RecordTooLarge(usize),
    #[error("Log flush failed: {0}")]
    FlushFailed(String),
}

pub type Result<T> = std::result::Result<T, LogManagerError>;

#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    /// Size of each of the two log buffers in bytes
    pub buffer_size: usize,
    /// How long the flush thread sleeps before flushing on its own
    pub flush_timeout: Duration,
}

impl Default for LogManagerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            flush_timeout: Duration::from_secs(1),
        }
    }
}

struct LogCore {
    /// Buffer new records are serialized into
    active: Vec<u8>,
    /// Bytes used in the active buffer
    offset: usize,
    /// Next LSN to hand out
    next_lsn: Lsn,
    /// A committer or a full buffer asked for an immediate flush
    flush_requested: bool,
    /// The background flush thread is alive
    thread_running: bool,
    /// First write failure; fatal for every later commit
    io_error: Option<String>,
}

/// Write-ahead log manager: a double-buffered ring that appenders fill
/// while a background thread drains the other half to disk.
///
/// The flush thread wakes on a timeout, on a force trigger, or when an
/// appender runs out of space; committers block until `persistent_lsn`
/// covers their commit record (group commit).
pub struct LogManager {
    config: LogManagerConfig,
    disk_manager: Arc<DiskManager>,
    core: Mutex<LogCore>,
    /// Largest LSN known durable on disk
    persistent_lsn: AtomicU32,
    /// Wakes the flush thread
    flush_cv: Condvar,
    /// Wakes appenders waiting for buffer space
    append_cv: Condvar,
    /// Wakes committers waiting for durability
    commit_cv: Condvar,
    enabled: AtomicBool,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    /// Open the log manager over an existing (possibly empty) log file.
    /// Scans the tail so LSN assignment continues after the last durable
    /// record.
    pub fn new(config: LogManagerConfig, disk_manager: Arc<DiskManager>) -> Result<Self> {
        let max_lsn = Self::scan_max_lsn(&config, &disk_manager)?;
        Ok(Self {
            core: Mutex::new(LogCore {
                active: vec![0; config.buffer_size],
                offset: 0,
                next_lsn: max_lsn + 1,
                flush_requested: false,
                thread_running: false,
                io_error: None,
            }),
            persistent_lsn: AtomicU32::new(max_lsn),
            flush_cv: Condvar::new(),
            append_cv: Condvar::new(),
            commit_cv: Condvar::new(),
            enabled: AtomicBool::new(false),
            flush_thread: Mutex::new(None),
            config,
            disk_manager,
        })
    }

    fn scan_max_lsn(config: &LogManagerConfig, disk: &DiskManager) -> Result<Lsn> {
        let mut buf = vec![0u8; config.buffer_size];
        let mut max_lsn = 0;
        let mut offset = 0u64;
        loop {
            let n = disk.read_log(&mut buf, offset)?;
            if n == 0 {
                break;
            }
            let mut pos = 0;
            while let Some(record) = LogRecord::deserialize(&buf[pos..n]) {
                max_lsn = max_lsn.max(record.lsn);
                pos += record.size();
            }
            if pos == 0 {
                break;
            }
            offset += pos as u64;
        }
        Ok(max_lsn)
    }

    /// Largest LSN durable on disk.
    pub fn persistent_lsn(&self) -> Lsn {
        self.persistent_lsn.load(Ordering::Acquire)
    }

    /// Next LSN that will be handed out.
    pub fn next_lsn(&self) -> Lsn {
        self.core.lock().next_lsn
    }

    /// Assign the record its LSN and serialize it into the active buffer,
    /// waiting for the flush thread to make room if the buffer is full.
    pub fn append_log_record(&self, record: &mut LogRecord) -> Result<Lsn> {
        let size = record.size();
        if size > self.config.buffer_size {
            return Err(LogManagerError::RecordTooLarge(size));
        }

        let mut core = self.core.lock();
        while core.offset + size > self.config.buffer_size {
            if core.thread_running {
                core.flush_requested = true;
                self.flush_cv.notify_one();
                self.append_cv.wait(&mut core);
            } else {
                self.flush_locked(&mut core)?;
            }
        }

        record.lsn = core.next_lsn;
        core.next_lsn += 1;
        let offset = core.offset;
        core.active[offset..offset + size].copy_from_slice(&record.to_bytes());
        core.offset += size;
        Ok(record.lsn)
    }

    /// Force the log out and block until `persistent_lsn >= lsn`. The
    /// commit path calls this with the commit record's LSN.
    pub fn flush_till_lsn(&self, lsn: Lsn) -> Result<()> {
        if self.persistent_lsn() >= lsn {
            return Ok(());
        }
        let mut core = self.core.lock();
        loop {
            if let Some(e) = &core.io_error {
                return Err(LogManagerError::FlushFailed(e.clone()));
            }
            if self.persistent_lsn() >= lsn {
                return Ok(());
            }
            if core.thread_running {
                core.flush_requested = true;
                self.flush_cv.notify_one();
                self.commit_cv.wait_for(&mut core, self.config.flush_timeout);
            } else {
                self.flush_locked(&mut core)?;
                if self.persistent_lsn() < lsn {
                    // the target was never appended; waiting cannot help
                    return Err(LogManagerError::FlushFailed(format!(
                        "lsn {lsn} is beyond the end of the log"
                    )));
                }
            }
        }
    }

    /// Flush whatever is buffered. Returns the new persistent LSN.
    pub fn flush(&self) -> Result<Lsn> {
        let mut core = self.core.lock();
        let target = core.next_lsn.saturating_sub(1);
        drop(core);
        self.flush_till_lsn(target)?;
        Ok(self.persistent_lsn())
    }

    /// Synchronous flush used when no background thread is running.
    fn flush_locked(&self, core: &mut LogCore) -> Result<()> {
        if core.offset == 0 {
            return Ok(());
        }
        let len = core.offset;
        let last_lsn = core.next_lsn - 1;
        self.disk_manager.write_log(&core.active[..len])?;
        core.offset = 0;
        self.persistent_lsn.store(last_lsn, Ordering::Release);
        self.append_cv.notify_all();
        self.commit_cv.notify_all();
        Ok(())
    }

    /// Start the background flush thread.
    pub fn start_flush_thread(self: &Arc<Self>) {
        let mut handle = self.flush_thread.lock();
        if handle.is_some() {
            return;
        }
        self.enabled.store(true, Ordering::SeqCst);
        self.core.lock().thread_running = true;
        let manager = Arc::clone(self);
        *handle = Some(std::thread::spawn(move || manager.run_flush_loop()));
    }

    /// Stop and join the flush thread, draining the buffer first.
    pub fn stop_flush_thread(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.flush_cv.notify_all();
        let handle = self.flush_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.append_cv.notify_all();
        self.commit_cv.notify_all();
    }

    fn run_flush_loop(self: Arc<Self>) {
        log::debug!("log flush thread started");
        let mut swap_buffer = vec![0u8; self.config.buffer_size];
        loop {
            let mut core = self.core.lock();
            if !core.flush_requested && self.enabled.load(Ordering::SeqCst) {
                self.flush_cv
                    .wait_for(&mut core, self.config.flush_timeout);
            }
            let stopping = !self.enabled.load(Ordering::SeqCst);
            if core.offset == 0 {
                core.flush_requested = false;
                if stopping {
                    core.thread_running = false;
                    drop(core);
                    break;
                }
                drop(core);
                self.commit_cv.notify_all();
                continue;
            }

            // swap buffers under the latch, write outside it
            mem::swap(&mut core.active, &mut swap_buffer);
            let len = core.offset;
            let last_lsn = core.next_lsn - 1;
            core.offset = 0;
            core.flush_requested = false;
            self.append_cv.notify_all();
            drop(core);

            match self.disk_manager.write_log(&swap_buffer[..len]) {
                Ok(()) => {
                    self.persistent_lsn.store(last_lsn, Ordering::Release);
                }
                Err(e) => {
                    log::error!("log flush failed: {e}");
                    self.core.lock().io_error = Some(e.to_string());
                }
            }
            self.commit_cv.notify_all();
        }
        self.commit_cv.notify_all();
        self.append_cv.notify_all();
        log::debug!("log flush thread stopped");
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.stop_flush_thread();
    }
}
