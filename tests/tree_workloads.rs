//! Mixed workloads across many transactions: interleaved inserts, deletes,
//! large values, value sets and streams, with report sanity checks at the
//! end.

use std::collections::BTreeMap;
use std::time::Duration;

use pagevault::{StorageEnvironment, StorageOptions, Tree};

fn open_env() -> StorageEnvironment {
    StorageEnvironment::open(
        StorageOptions::in_memory().with_flush_interval(Duration::from_millis(10)),
    )
    .unwrap()
}

#[test]
fn mirror_of_random_like_operations() {
    let env = open_env();
    let mut mirror: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    // A deterministic but scattered key sequence.
    let mut x = 0x2545f4914f6cdd1du64;
    let mut next = || {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        x
    };

    for round in 0..20 {
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::open_or_create(&mut txn, b"mirror").unwrap();
        for _ in 0..200 {
            let r = next();
            let key = format!("key-{:06}", r % 3000).into_bytes();
            if r % 5 == 0 {
                let in_tree = tree.delete(&mut txn, &key).unwrap();
                let in_mirror = mirror.remove(&key).is_some();
                assert_eq!(in_tree, in_mirror, "round {} key {:?}", round, key);
            } else {
                let value = format!("value-{}-{}", round, r).into_bytes();
                tree.insert(&mut txn, &key, &value).unwrap();
                mirror.insert(key, value);
            }
        }
        assert_eq!(tree.record_count(), mirror.len() as u64);
        txn.commit().unwrap();
    }

    let txn = env.read_txn().unwrap();
    let tree = Tree::open(&txn, b"mirror").unwrap().unwrap();
    assert_eq!(tree.record_count(), mirror.len() as u64);

    let mut entries = mirror.iter();
    for entry in tree.iter(&txn).unwrap() {
        let (key, _) = entry.unwrap();
        let (expected_key, expected_value) = entries.next().unwrap();
        assert_eq!(&key, expected_key);
        assert_eq!(
            tree.get(&txn, &key).unwrap().as_ref(),
            Some(expected_value)
        );
    }
    assert!(entries.next().is_none());
}

#[test]
fn many_trees_in_one_environment() {
    let env = open_env();

    {
        let mut txn = env.write_txn().unwrap();
        for t in 0..20u32 {
            let name = format!("tree-{:02}", t);
            let mut tree = Tree::create(&mut txn, name.as_bytes()).unwrap();
            for i in 0..50u32 {
                let key = format!("k{:03}", i);
                let value = format!("{}:{}", t, i);
                tree.insert(&mut txn, key.as_bytes(), value.as_bytes())
                    .unwrap();
            }
        }
        txn.commit().unwrap();
    }

    let txn = env.read_txn().unwrap();
    for t in 0..20u32 {
        let name = format!("tree-{:02}", t);
        let tree = Tree::open(&txn, name.as_bytes()).unwrap().unwrap();
        assert_eq!(tree.record_count(), 50);
        assert_eq!(
            tree.get(&txn, b"k025").unwrap(),
            Some(format!("{}:25", t).into_bytes())
        );
    }
}

#[test]
fn dropping_a_tree_frees_its_space() {
    let env = open_env();

    {
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"doomed").unwrap();
        for i in 0..1000u32 {
            let key = format!("key-{:05}", i);
            tree.insert(&mut txn, key.as_bytes(), &[1u8; 200]).unwrap();
        }
        tree.stream_write(&mut txn, b"attachment", &[9u8; 100_000], None)
            .unwrap();
        txn.commit().unwrap();
    }

    {
        let mut txn = env.write_txn().unwrap();
        let free_before = txn.free_page_count();
        let tree = Tree::open(&txn, b"doomed").unwrap().unwrap();
        tree.drop_tree(&mut txn).unwrap();
        assert!(txn.free_page_count() > free_before);
        txn.commit().unwrap();
    }

    let txn = env.read_txn().unwrap();
    assert!(Tree::open(&txn, b"doomed").unwrap().is_none());
    assert!(txn.free_page_count() > 0);
}

#[test]
fn report_tracks_a_real_workload() {
    let env = open_env();

    {
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"data").unwrap();
        for i in 0..800u32 {
            let key = format!("row-{:05}", i);
            tree.insert(&mut txn, key.as_bytes(), &vec![3u8; 64]).unwrap();
        }
        tree.insert(&mut txn, b"blob", &vec![5u8; 40_000]).unwrap();
        txn.commit().unwrap();
    }

    let report = env.detailed_report(true).unwrap();
    assert!(report.data_file.space_in_use_in_bytes > 0);
    assert!(
        report.data_file.allocated_space_in_bytes >= report.data_file.space_in_use_in_bytes
    );

    let data = report.trees.iter().find(|t| t.name == "data").unwrap();
    assert_eq!(data.record_count, 801);
    assert!(data.leaf_pages > 1);
    assert!(data.overflow_pages > 0);
    assert!(data.density > 0.3, "density {}", data.density);
    assert_eq!(
        data.page_count,
        data.branch_pages + data.leaf_pages + data.overflow_pages
    );
}
