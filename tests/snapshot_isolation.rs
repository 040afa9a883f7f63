//! Concurrent readers and a writer over one environment: readers keep the
//! state they started on no matter what commits or flushes afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pagevault::{StorageEnvironment, StorageOptions, Tree};

fn open_env() -> StorageEnvironment {
    StorageEnvironment::open(
        StorageOptions::in_memory().with_flush_interval(Duration::from_millis(10)),
    )
    .unwrap()
}

#[test]
fn readers_see_their_snapshot_through_later_commits() {
    let env = open_env();

    {
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"kv").unwrap();
        tree.insert(&mut txn, b"counter", b"0").unwrap();
        txn.commit().unwrap();
    }

    let reader = env.read_txn().unwrap();
    let tree_before = Tree::open(&reader, b"kv").unwrap().unwrap();

    for value in [b"1", b"2", b"3"] {
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::open(&txn, b"kv").unwrap().unwrap();
        tree.insert(&mut txn, b"counter", value).unwrap();
        txn.commit().unwrap();
    }
    // Force the data file to catch up while the reader is still open.
    env.flush().unwrap();

    assert_eq!(
        tree_before.get(&reader, b"counter").unwrap(),
        Some(b"0".to_vec())
    );

    let fresh = env.read_txn().unwrap();
    let tree_after = Tree::open(&fresh, b"kv").unwrap().unwrap();
    assert_eq!(
        tree_after.get(&fresh, b"counter").unwrap(),
        Some(b"3".to_vec())
    );
}

#[test]
fn two_readers_pin_the_same_snapshot_across_a_commit() {
    let env = open_env();

    {
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"kv").unwrap();
        tree.insert(&mut txn, b"K", b"old").unwrap();
        txn.commit().unwrap();
    }

    let first = env.read_txn().unwrap();
    let second = env.read_txn().unwrap();

    {
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::open(&txn, b"kv").unwrap().unwrap();
        tree.insert(&mut txn, b"K", b"new").unwrap();
        txn.commit().unwrap();
    }

    for reader in [&first, &second] {
        let tree = Tree::open(reader, b"kv").unwrap().unwrap();
        assert_eq!(tree.get(reader, b"K").unwrap(), Some(b"old".to_vec()));
    }

    let third = env.read_txn().unwrap();
    let tree = Tree::open(&third, b"kv").unwrap().unwrap();
    assert_eq!(tree.get(&third, b"K").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn concurrent_readers_while_writing() {
    let env = Arc::new(open_env());

    {
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"kv").unwrap();
        for i in 0..100u32 {
            let key = format!("key-{:04}", i);
            tree.insert(&mut txn, key.as_bytes(), b"initial").unwrap();
        }
        txn.commit().unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let env = Arc::clone(&env);
        let stop = Arc::clone(&stop);
        readers.push(std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let txn = env.read_txn().unwrap();
                let tree = Tree::open(&txn, b"kv").unwrap().unwrap();
                // Whatever state this snapshot pinned, every key is present
                // and internally consistent.
                let mut seen = 0;
                for entry in tree.iter(&txn).unwrap() {
                    entry.unwrap();
                    seen += 1;
                }
                assert_eq!(seen, 100);
            }
        }));
    }

    for round in 0..50u32 {
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::open(&txn, b"kv").unwrap().unwrap();
        for i in 0..100u32 {
            let key = format!("key-{:04}", i);
            let value = format!("round-{}", round);
            tree.insert(&mut txn, key.as_bytes(), value.as_bytes())
                .unwrap();
        }
        txn.commit().unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn rollback_is_invisible_to_everyone() {
    let env = open_env();

    {
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"kv").unwrap();
        tree.insert(&mut txn, b"kept", b"yes").unwrap();
        txn.commit().unwrap();
    }

    {
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::open(&txn, b"kv").unwrap().unwrap();
        tree.insert(&mut txn, b"kept", b"overwritten").unwrap();
        tree.insert(&mut txn, b"extra", b"nope").unwrap();
        txn.rollback();
    }

    let txn = env.read_txn().unwrap();
    let tree = Tree::open(&txn, b"kv").unwrap().unwrap();
    assert_eq!(tree.get(&txn, b"kept").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(tree.get(&txn, b"extra").unwrap(), None);
}
