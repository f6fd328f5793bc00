mod common;

use std::sync::Arc;
use std::thread;

use common::create_test_buffer_pool;
use karstdb::common::types::Rid;
use karstdb::BPlusTree;

fn rid_for(key: i64) -> Rid {
    Rid::new((key / 64) as u32 + 1, (key % 64) as u32)
}

/// Scenario: two threads insert disjoint key ranges; after both join a
/// full scan yields every key exactly once, in order.
#[test]
fn test_concurrent_disjoint_inserts() {
    let (pool, _paths) = create_test_buffer_pool(128).unwrap();
    let tree = Arc::new(BPlusTree::<i64>::new("conc_pk", pool, 4, 5).unwrap());

    let low = Arc::clone(&tree);
    let high = Arc::clone(&tree);
    let t1 = thread::spawn(move || {
        for key in 1..=500i64 {
            assert!(low.insert(&key, rid_for(key)).unwrap(), "lost insert {key}");
        }
    });
    let t2 = thread::spawn(move || {
        for key in 501..=1000i64 {
            assert!(high.insert(&key, rid_for(key)).unwrap(), "lost insert {key}");
        }
    });
    t1.join().unwrap();
    t2.join().unwrap();

    let keys: Vec<i64> = tree.iter().unwrap().map(|(k, _)| k).collect();
    assert_eq!(keys, (1..=1000).collect::<Vec<_>>());
    for key in [1i64, 250, 500, 501, 750, 1000] {
        assert_eq!(tree.get_value(&key).unwrap(), Some(rid_for(key)));
    }
}

/// Interleaved inserts from several threads over shuffled, disjoint
/// stripes; every key must land.
#[test]
fn test_concurrent_striped_inserts() {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    let (pool, _paths) = create_test_buffer_pool(128).unwrap();
    let tree = Arc::new(BPlusTree::<i64>::new("stripe_pk", pool, 4, 5).unwrap());

    let threads = 4;
    let per_thread = 250;
    let mut handles = Vec::new();
    for stripe in 0..threads {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            let mut rng = rand::rngs::StdRng::seed_from_u64(stripe as u64);
            let mut keys: Vec<i64> = (0..per_thread)
                .map(|i| (i * threads + stripe) as i64)
                .collect();
            keys.shuffle(&mut rng);
            for key in keys {
                assert!(tree.insert(&key, rid_for(key)).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let total = (threads * per_thread) as i64;
    let keys: Vec<i64> = tree.iter().unwrap().map(|(k, _)| k).collect();
    assert_eq!(keys, (0..total).collect::<Vec<_>>());
}

/// Concurrent removers over disjoint halves leave exactly the untouched
/// keys behind.
#[test]
fn test_concurrent_disjoint_removes() {
    let (pool, _paths) = create_test_buffer_pool(128).unwrap();
    let tree = Arc::new(BPlusTree::<i64>::new("del_pk", pool, 4, 5).unwrap());

    for key in 1..=600i64 {
        tree.insert(&key, rid_for(key)).unwrap();
    }

    let left = Arc::clone(&tree);
    let right = Arc::clone(&tree);
    let t1 = thread::spawn(move || {
        for key in 1..=200i64 {
            assert!(left.remove(&key).unwrap(), "lost remove {key}");
        }
    });
    let t2 = thread::spawn(move || {
        for key in 401..=600i64 {
            assert!(right.remove(&key).unwrap(), "lost remove {key}");
        }
    });
    t1.join().unwrap();
    t2.join().unwrap();

    let keys: Vec<i64> = tree.iter().unwrap().map(|(k, _)| k).collect();
    assert_eq!(keys, (201..=400).collect::<Vec<_>>());
}

/// Readers run against a writer without ever observing a key out of
/// order or a torn entry.
#[test]
fn test_reads_during_inserts() {
    let (pool, _paths) = create_test_buffer_pool(128).unwrap();
    let tree = Arc::new(BPlusTree::<i64>::new("rw_pk", pool, 4, 5).unwrap());

    for key in (0..1000i64).step_by(2) {
        tree.insert(&key, rid_for(key)).unwrap();
    }

    let writer_tree = Arc::clone(&tree);
    let writer = thread::spawn(move || {
        for key in (1..1000i64).step_by(2) {
            writer_tree.insert(&key, rid_for(key)).unwrap();
        }
    });

    let mut readers = Vec::new();
    for _ in 0..3 {
        let tree = Arc::clone(&tree);
        readers.push(thread::spawn(move || {
            for _ in 0..20 {
                // pre-existing even keys are always visible
                for key in (0..1000i64).step_by(100) {
                    assert_eq!(tree.get_value(&key).unwrap(), Some(rid_for(key)));
                }
                // scans stay sorted at every instant
                let keys: Vec<i64> = tree.iter().unwrap().map(|(k, _)| k).collect();
                assert!(keys.windows(2).all(|w| w[0] < w[1]));
            }
        }));
    }

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(tree.iter().unwrap().count(), 1000);
}
