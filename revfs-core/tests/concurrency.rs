//! Concurrent writers and readers on one store

use std::sync::{Arc, Barrier};
use std::thread;

use revfs_core::{CommitPolicy, ErrorKind, Revnum, Store, StoreConfig, TxnOptions};
use tempfile::TempDir;

fn new_store(policy: CommitPolicy) -> (TempDir, Store) {
    let tmp = TempDir::new().unwrap();
    let store = Store::create(
        tmp.path().join("repo"),
        StoreConfig::default()
            .with_hooks(false)
            .with_commit_policy(policy),
    )
    .unwrap();
    (tmp, store)
}

fn read(store: &Store, path: &str, rev: Revnum) -> String {
    let bytes = store.read_content(path, rev).unwrap().to_bytes().unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// r1: `/a/f` and `/b/g`
fn seed(store: &Store) {
    let mut txn = store.begin_txn(TxnOptions::at(0)).unwrap();
    txn.mkdir("/a").unwrap();
    txn.mkfile("/a/f").unwrap();
    txn.set_contents("/a/f", b"f1").unwrap();
    txn.mkdir("/b").unwrap();
    txn.mkfile("/b/g").unwrap();
    txn.set_contents("/b/g", b"g1").unwrap();
    assert_eq!(txn.commit().unwrap(), 1);
}

#[test]
fn test_strict_rejects_disjoint_stale_commit() {
    let (_tmp, store) = new_store(CommitPolicy::Strict);
    seed(&store);

    let mut first = store.begin_txn(TxnOptions::at(1)).unwrap();
    let mut second = store.begin_txn(TxnOptions::at(1)).unwrap();
    first.set_contents("/a/f", b"f2").unwrap();
    second.set_contents("/b/g", b"g2").unwrap();
    first.commit().unwrap();
    assert!(second.commit().unwrap_err().is(ErrorKind::OutOfDate));
}

#[test]
fn test_path_based_merges_disjoint_commits() {
    let (_tmp, store) = new_store(CommitPolicy::PathBased);
    seed(&store);

    let mut first = store.begin_txn(TxnOptions::at(1)).unwrap();
    let mut second = store.begin_txn(TxnOptions::at(1)).unwrap();
    first.set_contents("/a/f", b"f2").unwrap();
    second.set_contents("/b/g", b"g2").unwrap();
    second.mkfile("/b/new").unwrap();

    assert_eq!(first.commit().unwrap(), 2);
    assert_eq!(second.commit().unwrap(), 3);

    assert_eq!(read(&store, "/a/f", 3), "f2");
    assert_eq!(read(&store, "/b/g", 3), "g2");
    assert!(store.is_file("/b/new", 3).unwrap());
    assert_eq!(read(&store, "/b/g", 2), "g1");
    assert_eq!(store.node_created_rev("/a/f", 3).unwrap(), 2);

    let history: Vec<Revnum> = store
        .history("/b/g", 3, Default::default())
        .unwrap()
        .map(|e| e.unwrap().rev)
        .collect();
    assert_eq!(history, vec![3, 1]);
    store.verify().unwrap();
}

#[test]
fn test_path_based_rejects_overlapping_commits() {
    let (_tmp, store) = new_store(CommitPolicy::PathBased);
    seed(&store);

    let mut first = store.begin_txn(TxnOptions::at(1)).unwrap();
    let mut second = store.begin_txn(TxnOptions::at(1)).unwrap();
    let mut third = store.begin_txn(TxnOptions::at(1)).unwrap();
    first.set_contents("/a/f", b"f2").unwrap();
    // Deleting a parent of a changed path conflicts
    second.delete("/a").unwrap();
    // So does touching the same file
    third.set_node_prop("/a/f", "p", Some("v")).unwrap();

    first.commit().unwrap();
    assert!(second.commit().unwrap_err().is(ErrorKind::OutOfDate));
    assert!(third.commit().unwrap_err().is(ErrorKind::OutOfDate));
    assert!(second.is_open() && third.is_open());
    assert_eq!(store.youngest_rev().unwrap(), 2);
}

#[test]
fn test_path_based_conflict_on_cancelled_edit() {
    let (_tmp, store) = new_store(CommitPolicy::PathBased);
    seed(&store);

    let mut stale = store.begin_txn(TxnOptions::at(1)).unwrap();
    stale.mkfile("/a/x").unwrap();
    stale.delete("/a/x").unwrap();
    stale.set_contents("/b/g", b"g2").unwrap();
    assert_eq!(stale.changes().len(), 1);

    let mut other = store.begin_txn(TxnOptions::at(1)).unwrap();
    other.delete("/a").unwrap();
    assert_eq!(other.commit().unwrap(), 2);

    // The cancelled edit still ran under /a, so the stale commit conflicts
    for _ in 0..2 {
        let err = stale.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfDate, "{err}");
        assert!(stale.is_open());
    }
    assert_eq!(store.youngest_rev().unwrap(), 2);
    assert_eq!(read(&store, "/b/g", 2), "g1");
}

#[test]
fn test_rejected_commit_leaves_valid_store() {
    let (_tmp, store) = new_store(CommitPolicy::Strict);
    seed(&store);

    let mut first = store.begin_txn(TxnOptions::at(1)).unwrap();
    let mut second = store.begin_txn(TxnOptions::at(1)).unwrap();
    first.set_contents("/a/f", b"from first").unwrap();
    second.set_contents("/b/g", b"from second").unwrap();
    first.commit().unwrap();
    assert!(second.commit().unwrap_err().is(ErrorKind::OutOfDate));
    second.abort().unwrap();
    store.verify().unwrap();

    // The same content committed later is served from the object store
    let mut retry = store.begin_txn(TxnOptions::at(2)).unwrap();
    retry.set_contents("/b/g", b"from second").unwrap();
    assert_eq!(retry.commit().unwrap(), 3);
    assert_eq!(read(&store, "/b/g", 3), "from second");
    assert_eq!(read(&store, "/a/f", 3), "from first");
    store.verify().unwrap();
}

fn race(policy: CommitPolicy, writers: usize) -> (TempDir, Store, Vec<Result<Revnum, ErrorKind>>) {
    let (tmp, store) = new_store(policy);
    seed(&store);
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut txn = store.begin_txn(TxnOptions::at(1)).unwrap();
                txn.set_contents("/a/f", format!("writer {i}").as_bytes())
                    .unwrap();
                barrier.wait();
                txn.commit().map_err(|e| e.kind())
            })
        })
        .collect();
    let results = handles.into_iter().map(|h| h.join().unwrap()).collect();
    (tmp, store, results)
}

#[test]
fn test_racing_writers_have_one_winner() {
    for policy in [CommitPolicy::Strict, CommitPolicy::PathBased] {
        let (_tmp, store, results) = race(policy, 6);
        let winners: Vec<Revnum> = results.iter().filter_map(|r| r.ok()).collect();
        assert_eq!(winners, vec![2], "{policy:?}");
        assert!(
            results
                .iter()
                .filter_map(|r| r.err())
                .all(|k| k == ErrorKind::OutOfDate)
        );
        assert_eq!(store.youngest_rev().unwrap(), 2);
        assert!(read(&store, "/a/f", 2).starts_with("writer "));
    }
}

#[test]
fn test_disjoint_writers_all_commit_under_path_based() {
    let (_tmp, store) = new_store(CommitPolicy::PathBased);
    seed(&store);
    let writers = 5;
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut txn = store.begin_txn(TxnOptions::at(1)).unwrap();
                let path = format!("/b/file{i}");
                txn.mkfile(&path).unwrap();
                txn.set_contents(&path, i.to_string().as_bytes()).unwrap();
                barrier.wait();
                txn.commit().unwrap()
            })
        })
        .collect();
    let mut revs: Vec<Revnum> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    revs.sort();
    assert_eq!(revs, (2..2 + writers as Revnum).collect::<Vec<_>>());

    let youngest = store.youngest_rev().unwrap();
    for i in 0..writers {
        assert_eq!(read(&store, &format!("/b/file{i}"), youngest), i.to_string());
    }
    store.verify().unwrap();
}

#[test]
fn test_readers_never_see_partial_commits() {
    let (_tmp, store) = new_store(CommitPolicy::Strict);
    let mut txn = store.begin_txn(TxnOptions::at(0)).unwrap();
    txn.mkfile("/counter").unwrap();
    txn.mkfile("/mirror").unwrap();
    txn.set_contents("/counter", b"1").unwrap();
    txn.set_contents("/mirror", b"1").unwrap();
    txn.commit().unwrap();

    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                let mut txn = store.begin_txn(TxnOptions::default()).unwrap();
                let next = (txn.base_rev() + 1).to_string();
                txn.set_contents("/counter", next.as_bytes()).unwrap();
                txn.set_contents("/mirror", next.as_bytes()).unwrap();
                txn.commit().unwrap();
            }
        })
    };
    let reader = {
        let store = store.clone();
        thread::spawn(move || {
            let mut checked = 0;
            while checked < 200 {
                let rev = store.youngest_rev().unwrap();
                let root = store.revision_root(rev).unwrap();
                let counter = root.read_content("/counter").unwrap().to_bytes().unwrap();
                let mirror = root.read_content("/mirror").unwrap().to_bytes().unwrap();
                assert_eq!(counter, mirror);
                assert_eq!(counter, rev.to_string().as_bytes());
                checked += 1;
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(store.youngest_rev().unwrap(), 21);
}
