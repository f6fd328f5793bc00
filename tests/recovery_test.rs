mod common;

use std::sync::Arc;

use common::{create_db_paths, make_tuple, open_engine, DbPaths};
use karstdb::common::types::{PageId, Rid};
use karstdb::storage::buffer::BufferPoolManager;
use karstdb::storage::heap::TableHeap;
use karstdb::transaction::wal::log_manager::{LogManager, LogManagerConfig};
use karstdb::transaction::wal::recovery::LogRecovery;
use karstdb::IsolationLevel;

/// Rebuild the stack after a simulated crash and run redo + undo.
/// Returns the recovered buffer pool and a reopened heap.
fn restart_and_recover(
    paths: &DbPaths,
    first_page_id: PageId,
) -> (Arc<BufferPoolManager>, Arc<TableHeap>) {
    let disk = common::open_disk(paths).unwrap();
    let log_manager =
        Arc::new(LogManager::new(LogManagerConfig::default(), disk.clone()).unwrap());
    let buffer_pool = Arc::new(BufferPoolManager::new(32, disk.clone(), None).unwrap());

    let mut recovery = LogRecovery::new(disk, buffer_pool.clone(), 64 * 1024);
    recovery.recover().unwrap();

    let heap = Arc::new(TableHeap::open(
        buffer_pool.clone(),
        log_manager,
        first_page_id,
    ));
    (buffer_pool, heap)
}

/// Scenario: an insert is logged and the log flushed, but the
/// transaction never commits before the crash. Redo replays the insert,
/// undo removes it again.
#[test]
fn test_uncommitted_insert_rolled_back_on_restart() {
    common::init_logging();
    let paths = create_db_paths().unwrap();
    let tuple = make_tuple(1, "phantom");

    let (rid, first_page_id) = {
        let engine = open_engine(&paths, 16).unwrap();
        // a running system flushes from a short-timeout thread; the test
        // forces the same flush explicitly below
        engine.log_manager.start_flush_thread();

        let txn = engine.txn_manager.begin(IsolationLevel::RepeatableRead).unwrap();
        let heap = Arc::new(
            TableHeap::new(
                engine.buffer_pool.clone(),
                engine.log_manager.clone(),
                &txn,
            )
            .unwrap(),
        );
        let rid = heap.insert_tuple(&txn, &tuple).unwrap();

        // the log reaches disk, the data pages do not; then we "crash"
        engine.log_manager.flush().unwrap();
        (rid, heap.first_page_id())
    };

    let (_pool, heap) = restart_and_recover(&paths, first_page_id);
    assert_eq!(heap.get_tuple(rid).unwrap(), None);
}

/// Scenario: the transaction commits (forcing the log), then the system
/// crashes before any heap page is written back. Redo alone must
/// reproduce the tuple.
#[test]
fn test_committed_insert_survives_restart() {
    common::init_logging();
    let paths = create_db_paths().unwrap();
    let tuple = make_tuple(7, "durable");

    let (rid, first_page_id) = {
        let engine = open_engine(&paths, 16).unwrap();
        let txn = engine.txn_manager.begin(IsolationLevel::RepeatableRead).unwrap();
        let heap = Arc::new(
            TableHeap::new(
                engine.buffer_pool.clone(),
                engine.log_manager.clone(),
                &txn,
            )
            .unwrap(),
        );
        let rid = heap.insert_tuple(&txn, &tuple).unwrap();
        engine.txn_manager.commit(&txn).unwrap();
        // no flush_all_pages: every heap page dies with the crash
        (rid, heap.first_page_id())
    };

    let (_pool, heap) = restart_and_recover(&paths, first_page_id);
    assert_eq!(heap.get_tuple(rid).unwrap(), Some(tuple));
}

/// A committed update and a committed mark+apply delete replay; an
/// uncommitted update rolls back to the committed image.
#[test]
fn test_mixed_operations_recover_to_committed_state() {
    common::init_logging();
    let paths = create_db_paths().unwrap();

    let (keep_rid, gone_rid, flip_rid, first_page_id) = {
        let engine = open_engine(&paths, 16).unwrap();
        let t1 = engine.txn_manager.begin(IsolationLevel::RepeatableRead).unwrap();
        let heap = Arc::new(
            TableHeap::new(
                engine.buffer_pool.clone(),
                engine.log_manager.clone(),
                &t1,
            )
            .unwrap(),
        );
        let keep_rid = heap.insert_tuple(&t1, &make_tuple(1, "keep")).unwrap();
        let gone_rid = heap.insert_tuple(&t1, &make_tuple(2, "gone")).unwrap();
        let flip_rid = heap.insert_tuple(&t1, &make_tuple(3, "v1")).unwrap();
        engine.txn_manager.commit(&t1).unwrap();

        let t2 = engine.txn_manager.begin(IsolationLevel::RepeatableRead).unwrap();
        heap.update_tuple(&t2, keep_rid, &make_tuple(1, "kept")).unwrap();
        heap.mark_delete(&t2, gone_rid).unwrap();
        engine.txn_manager.commit(&t2).unwrap();

        // loser: updates flip_rid but never commits
        let t3 = engine.txn_manager.begin(IsolationLevel::RepeatableRead).unwrap();
        heap.update_tuple(&t3, flip_rid, &make_tuple(3, "v2")).unwrap();
        engine.log_manager.flush().unwrap();

        (keep_rid, gone_rid, flip_rid, heap.first_page_id())
    };

    let (_pool, heap) = restart_and_recover(&paths, first_page_id);
    assert_eq!(heap.get_tuple(keep_rid).unwrap(), Some(make_tuple(1, "kept")));
    assert_eq!(heap.get_tuple(gone_rid).unwrap(), None);
    assert_eq!(heap.get_tuple(flip_rid).unwrap(), Some(make_tuple(3, "v1")));
}

/// Redo is idempotent against pages that already reached disk: pages
/// flushed before the crash are not modified twice.
#[test]
fn test_redo_skips_pages_already_current() {
    common::init_logging();
    let paths = create_db_paths().unwrap();

    let (rid_a, rid_b, first_page_id) = {
        let engine = open_engine(&paths, 16).unwrap();
        let txn = engine.txn_manager.begin(IsolationLevel::RepeatableRead).unwrap();
        let heap = Arc::new(
            TableHeap::new(
                engine.buffer_pool.clone(),
                engine.log_manager.clone(),
                &txn,
            )
            .unwrap(),
        );
        let rid_a = heap.insert_tuple(&txn, &make_tuple(10, "flushed")).unwrap();
        let rid_b = heap.insert_tuple(&txn, &make_tuple(11, "memory-only")).unwrap();
        engine.txn_manager.commit(&txn).unwrap();

        // half a checkpoint: data pages reach disk, then more work happens
        engine.buffer_pool.flush_all_pages().unwrap();

        let t2 = engine.txn_manager.begin(IsolationLevel::RepeatableRead).unwrap();
        heap.update_tuple(&t2, rid_b, &make_tuple(11, "updated")).unwrap();
        engine.txn_manager.commit(&t2).unwrap();

        (rid_a, rid_b, heap.first_page_id())
    };

    let (_pool, heap) = restart_and_recover(&paths, first_page_id);
    assert_eq!(heap.get_tuple(rid_a).unwrap(), Some(make_tuple(10, "flushed")));
    assert_eq!(heap.get_tuple(rid_b).unwrap(), Some(make_tuple(11, "updated")));
}

/// An abort before the crash leaves nothing to undo: the logged
/// compensations replay along with the original operations.
#[test]
fn test_aborted_transaction_stays_rolled_back() {
    common::init_logging();
    let paths = create_db_paths().unwrap();

    let (rid, first_page_id) = {
        let engine = open_engine(&paths, 16).unwrap();
        let t1 = engine.txn_manager.begin(IsolationLevel::RepeatableRead).unwrap();
        let heap = Arc::new(
            TableHeap::new(
                engine.buffer_pool.clone(),
                engine.log_manager.clone(),
                &t1,
            )
            .unwrap(),
        );
        let rid = heap.insert_tuple(&t1, &make_tuple(5, "undone")).unwrap();
        engine.txn_manager.abort(&t1).unwrap();
        engine.log_manager.flush().unwrap();
        (rid, heap.first_page_id())
    };

    let (_pool, heap) = restart_and_recover(&paths, first_page_id);
    assert_eq!(heap.get_tuple(rid).unwrap(), None);
}

/// Heap chains spanning several pages recover, including the NEWPAGE
/// links.
#[test]
fn test_multi_page_heap_recovers() {
    common::init_logging();
    let paths = create_db_paths().unwrap();

    let (rids, first_page_id) = {
        let engine = open_engine(&paths, 32).unwrap();
        let txn = engine.txn_manager.begin(IsolationLevel::RepeatableRead).unwrap();
        let heap = Arc::new(
            TableHeap::new(
                engine.buffer_pool.clone(),
                engine.log_manager.clone(),
                &txn,
            )
            .unwrap(),
        );
        // wide tuples force the chain past one page
        let wide = vec![0xABu8; 900];
        let mut rids = Vec::new();
        for _ in 0..10 {
            rids.push(heap.insert_tuple(&txn, &wide).unwrap());
        }
        engine.txn_manager.commit(&txn).unwrap();
        (rids, heap.first_page_id())
    };

    assert!(
        rids.iter().any(|rid| rid.page_id != rids[0].page_id),
        "test expects the heap to span pages"
    );

    let (_pool, heap) = restart_and_recover(&paths, first_page_id);
    for rid in rids {
        assert_eq!(heap.get_tuple(rid).unwrap(), Some(vec![0xABu8; 900]));
    }
}

/// A torn tail (half a record) silently ends the redo scan instead of
/// failing recovery.
#[test]
fn test_truncated_log_tail_terminates_scan() {
    common::init_logging();
    let paths = create_db_paths().unwrap();

    let (rid, first_page_id) = {
        let engine = open_engine(&paths, 16).unwrap();
        let txn = engine.txn_manager.begin(IsolationLevel::RepeatableRead).unwrap();
        let heap = Arc::new(
            TableHeap::new(
                engine.buffer_pool.clone(),
                engine.log_manager.clone(),
                &txn,
            )
            .unwrap(),
        );
        let rid = heap.insert_tuple(&txn, &make_tuple(1, "first")).unwrap();
        engine.txn_manager.commit(&txn).unwrap();
        (rid, heap.first_page_id())
    };

    // simulate a torn write: append garbage that parses as no record
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&paths.log)
            .unwrap();
        file.write_all(&[0x55; 7]).unwrap();
    }

    let (_pool, heap) = restart_and_recover(&paths, first_page_id);
    assert_eq!(heap.get_tuple(rid).unwrap(), Some(make_tuple(1, "first")));
}

/// Log records round-trip bit for bit through the on-disk stream.
#[test]
fn test_log_stream_round_trip() {
    use karstdb::transaction::wal::log_record::{LogPayload, LogRecord};

    let paths = create_db_paths().unwrap();
    let disk = common::open_disk(&paths).unwrap();
    let log_manager =
        Arc::new(LogManager::new(LogManagerConfig::default(), disk.clone()).unwrap());

    let mut appended = Vec::new();
    let payloads = vec![
        LogPayload::Begin,
        LogPayload::Insert {
            rid: Rid::new(1, 0),
            tuple: make_tuple(1, "a"),
        },
        LogPayload::Update {
            rid: Rid::new(1, 0),
            old_tuple: make_tuple(1, "a"),
            new_tuple: make_tuple(1, "b"),
        },
        LogPayload::MarkDelete {
            rid: Rid::new(1, 0),
            tuple: make_tuple(1, "b"),
        },
        LogPayload::NewPage {
            prev_page_id: 1,
            page_id: 2,
        },
        LogPayload::Commit,
    ];
    for payload in payloads {
        let mut record = LogRecord::new(1, appended.last().map(|r: &LogRecord| r.lsn).unwrap_or(0), payload);
        log_manager.append_log_record(&mut record).unwrap();
        appended.push(record);
    }
    log_manager.flush().unwrap();

    // read the raw stream back and compare record by record
    let mut buf = vec![0u8; 64 * 1024];
    let n = disk.read_log(&mut buf, 0).unwrap();
    let mut pos = 0;
    let mut parsed = Vec::new();
    while let Some(record) = LogRecord::deserialize(&buf[pos..n]) {
        pos += record.size();
        parsed.push(record);
    }
    assert_eq!(parsed.len(), appended.len());
    for (parsed, appended) in parsed.iter().zip(&appended) {
        assert_eq!(parsed, appended);
        assert_eq!(parsed.to_bytes(), appended.to_bytes());
    }
}
