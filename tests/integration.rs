//! End-to-end exercises against a real temp-file-backed environment: a
//! basic write/reopen round trip, multi-transaction overwrite ordering, COW
//! reader isolation, DUPSORT sub-tree promotion, free-list reuse across a
//! delete/insert cycle, `APPEND` ordering enforcement, and the boundary
//! cases around max key/value sizes and empty/single-entry cursors.

use crab_mdbx::flags::{dbi as dflags, env as eflags, put as putflags};
use crab_mdbx::{btree, Environment, Error, Op};
use tempfile::NamedTempFile;

fn open_fresh(path: &std::path::Path) -> Environment {
    Environment::new()
        .page_size(4096)
        .open(path, eflags::CREATE)
        .expect("open fresh environment")
}

fn open_existing(path: &std::path::Path, flags: u32) -> Environment {
    Environment::new().page_size(4096).open(path, flags).expect("reopen environment")
}

#[test]
fn basic_write_commit_reopen() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();

    {
        let env = open_fresh(&path);
        let mut txn = env.begin_rw().unwrap();
        txn.open_dbi("test", dflags::CREATE).unwrap();
        for i in 0u32..100 {
            let key = i.to_le_bytes();
            let value: Vec<u8> = [i, i + 1, i + 2].iter().flat_map(|n| n.to_le_bytes()).collect();
            txn.put("test", &key, &value, 0).unwrap();
        }
        txn.commit().unwrap();
    }

    let env = open_existing(&path, eflags::READONLY);
    let txn = env.begin_ro().unwrap();
    let tree = txn.open_dbi("test").unwrap();
    for i in 0u32..100 {
        let key = i.to_le_bytes();
        let expect: Vec<u8> = [i, i + 1, i + 2].iter().flat_map(|n| n.to_le_bytes()).collect();
        assert_eq!(txn.get(&tree, &key).unwrap(), expect);
    }
}

#[test]
fn multi_txn_overwrite() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();
    let env = open_fresh(&path);

    {
        let mut txn = env.begin_rw().unwrap();
        txn.open_dbi("test", dflags::CREATE).unwrap();
        for i in 0u32..10 {
            txn.put("test", &i.to_le_bytes(), b"txn1", 0).unwrap();
        }
        txn.commit().unwrap();
    }
    {
        let mut txn = env.begin_rw().unwrap();
        txn.open_dbi("test", 0).unwrap();
        for i in 10u32..20 {
            txn.put("test", &i.to_le_bytes(), b"txn2", 0).unwrap();
        }
        txn.commit().unwrap();
    }
    {
        let mut txn = env.begin_rw().unwrap();
        txn.open_dbi("test", 0).unwrap();
        for i in 5u32..15 {
            txn.put("test", &i.to_le_bytes(), b"txn3", 0).unwrap();
        }
        txn.commit().unwrap();
    }

    drop(env);
    let env = open_existing(&path, eflags::READONLY);
    let txn = env.begin_ro().unwrap();
    let tree = txn.open_dbi("test").unwrap();
    for i in 0u32..5 {
        assert_eq!(txn.get(&tree, &i.to_le_bytes()).unwrap(), b"txn1");
    }
    for i in 5u32..15 {
        assert_eq!(txn.get(&tree, &i.to_le_bytes()).unwrap(), b"txn3");
    }
    for i in 15u32..20 {
        assert_eq!(txn.get(&tree, &i.to_le_bytes()).unwrap(), b"txn2");
    }
}

#[test]
fn cow_reader_isolation() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();
    let env = open_fresh(&path);

    {
        let mut txn = env.begin_rw().unwrap();
        txn.open_dbi("test", dflags::CREATE).unwrap();
        for i in 0u32..1000 {
            txn.put("test", &i.to_le_bytes(), &1000u32.to_le_bytes(), 0).unwrap();
        }
        txn.commit().unwrap();
    }

    let read_txn = env.begin_ro().unwrap();
    let read_tree = read_txn.open_dbi("test").unwrap();

    {
        let mut write_txn = env.begin_rw().unwrap();
        write_txn.open_dbi("test", 0).unwrap();
        for i in 0u32..1000 {
            write_txn.put("test", &i.to_le_bytes(), &2000u32.to_le_bytes(), 0).unwrap();
        }
        for i in 1000u32..1500 {
            write_txn.put("test", &i.to_le_bytes(), &2000u32.to_le_bytes(), 0).unwrap();
        }
        write_txn.commit().unwrap();
    }

    for i in 0u32..1000 {
        assert_eq!(read_txn.get(&read_tree, &i.to_le_bytes()).unwrap(), 1000u32.to_le_bytes());
    }
    assert!(matches!(read_txn.get(&read_tree, &1000u32.to_le_bytes()), Err(Error::NotFound)));
    drop(read_txn);

    let read_txn2 = env.begin_ro().unwrap();
    let tree2 = read_txn2.open_dbi("test").unwrap();
    for i in 0u32..1500 {
        assert_eq!(read_txn2.get(&tree2, &i.to_le_bytes()).unwrap(), 2000u32.to_le_bytes());
    }
}

#[test]
fn dupsort_promotion_and_persistence() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();

    {
        let env = open_fresh(&path);
        let mut txn = env.begin_rw().unwrap();
        txn.open_dbi("subtree", dflags::CREATE | dflags::DUPSORT).unwrap();
        // Big-endian so bytewise (the comparator DUPSORT actually uses)
        // ordering matches numeric ordering.
        for i in 0u64..1000 {
            txn.put("subtree", b"key", &i.to_be_bytes(), 0).unwrap();
        }
        txn.commit().unwrap();
    }

    let env = open_existing(&path, eflags::READONLY);
    let txn = env.begin_ro().unwrap();
    let tree = txn.open_dbi("subtree").unwrap();
    assert!(tree.dupsort);

    let mut cursor = txn.cursor();
    cursor.get(&txn, &tree, Some(b"key"), None, Op::Set).unwrap();
    assert_eq!(cursor.count(&txn, &tree).unwrap(), 1000);

    let (_, first) = cursor.get(&txn, &tree, None, None, Op::FirstDup).unwrap();
    let mut current = first;
    let mut prev: Option<u64> = None;
    let mut seen = 0u64;
    loop {
        let val = u64::from_be_bytes(current.clone().try_into().expect("8-byte dup value"));
        if let Some(p) = prev {
            assert!(p < val, "duplicates must come out in ascending order");
        }
        prev = Some(val);
        seen += 1;
        match cursor.get(&txn, &tree, None, None, Op::NextDup) {
            Ok((_, v)) => current = v,
            Err(Error::NotFound) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(seen, 1000);
}

#[test]
fn compaction_after_mixed_delete_insert() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();
    let env = open_fresh(&path);

    {
        let mut txn = env.begin_rw().unwrap();
        txn.open_dbi("test", dflags::CREATE).unwrap();
        for i in 0u32..50 {
            let key = format!("key{i:03}").into_bytes();
            txn.put("test", &key, &vec![i as u8; 60], 0).unwrap();
        }
        txn.commit().unwrap();
    }
    {
        let mut txn = env.begin_rw().unwrap();
        txn.open_dbi("test", 0).unwrap();
        for i in 10u32..20 {
            let key = format!("key{i:03}").into_bytes();
            txn.del("test", &key, None).unwrap();
        }
        txn.commit().unwrap();
    }
    {
        let mut txn = env.begin_rw().unwrap();
        txn.open_dbi("test", 0).unwrap();
        for i in 0u32..10 {
            let key = format!("new{i:03}").into_bytes();
            txn.put("test", &key, &vec![(100 + i) as u8; 60], 0).unwrap();
        }
        txn.commit().unwrap();
    }

    let txn = env.begin_ro().unwrap();
    let tree = txn.open_dbi("test").unwrap();
    for i in (0u32..10).chain(20..50) {
        let key = format!("key{i:03}").into_bytes();
        assert_eq!(txn.get(&tree, &key).unwrap(), vec![i as u8; 60]);
    }
    for i in 10u32..20 {
        let key = format!("key{i:03}").into_bytes();
        assert!(matches!(txn.get(&tree, &key), Err(Error::NotFound)));
    }
    for i in 0u32..10 {
        let key = format!("new{i:03}").into_bytes();
        assert_eq!(txn.get(&tree, &key).unwrap(), vec![(100 + i) as u8; 60]);
    }

    let mut cursor = txn.cursor();
    let mut count = 0;
    let mut last_key: Option<Vec<u8>> = None;
    let mut res = cursor.get(&txn, &tree, None, None, Op::First);
    while let Ok((k, _)) = res {
        if let Some(lk) = &last_key {
            assert!(lk.as_slice() < k.as_slice(), "cursor traversal must be sorted");
        }
        last_key = Some(k);
        count += 1;
        res = cursor.get(&txn, &tree, None, None, Op::Next);
    }
    assert_eq!(count, 50);
}

#[test]
fn append_out_of_order() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();
    let env = open_fresh(&path);
    let mut txn = env.begin_rw().unwrap();
    txn.open_dbi("test", dflags::CREATE).unwrap();
    txn.put("test", b"aaa", b"v1", 0).unwrap();
    txn.put("test", b"bbb", b"v2", 0).unwrap();

    let err = txn.put("test", b"aab", b"v3", putflags::APPEND).unwrap_err();
    assert!(matches!(err, Error::KeyMismatch));

    txn.put("test", b"ccc", b"v4", putflags::APPEND).unwrap();
    let tree = txn.open_dbi("test", 0).unwrap();
    assert_eq!(txn.get(&tree, b"ccc").unwrap(), b"v4");

    txn.put("test", b"ccc", b"v5", putflags::APPEND).unwrap();
    let tree = txn.open_dbi("test", 0).unwrap();
    assert_eq!(txn.get(&tree, b"ccc").unwrap(), b"v5");

    txn.commit().unwrap();
}

#[test]
fn max_key_size_boundary() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();
    let env = open_fresh(&path);
    let mut txn = env.begin_rw().unwrap();
    txn.open_dbi("test", dflags::CREATE).unwrap();

    let max_key = btree::max_key_size(4096);
    let key = vec![0x42u8; max_key];
    txn.put("test", &key, b"fits", 0).unwrap();
    let tree = txn.open_dbi("test", 0).unwrap();
    assert_eq!(txn.get(&tree, &key).unwrap(), b"fits");

    let oversize_key = vec![0x42u8; max_key + 1];
    let err = txn.put("test", &oversize_key, b"nope", 0).unwrap_err();
    assert!(matches!(err, Error::BadValSize(_)));

    txn.commit().unwrap();
}

#[test]
fn max_inline_value_vs_overflow_boundary() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();
    let env = open_fresh(&path);
    let mut txn = env.begin_rw().unwrap();
    txn.open_dbi("test", dflags::CREATE).unwrap();

    let max_inline = btree::max_inline_value(4096);
    let inline_value = vec![0xAAu8; max_inline];
    let overflow_value = vec![0xBBu8; max_inline + 1];

    assert!(!btree::needs_overflow(inline_value.len(), 4096));
    assert!(btree::needs_overflow(overflow_value.len(), 4096));

    txn.put("test", b"inline", &inline_value, 0).unwrap();
    txn.put("test", b"overflow", &overflow_value, 0).unwrap();
    let tree = txn.open_dbi("test", 0).unwrap();
    assert_eq!(txn.get(&tree, b"inline").unwrap(), inline_value);
    assert_eq!(txn.get(&tree, b"overflow").unwrap(), overflow_value);

    txn.commit().unwrap();

    // Reopen to confirm the overflow chain round-trips through a fresh mmap too.
    drop(env);
    let env = open_existing(&path, eflags::READONLY);
    let ro = env.begin_ro().unwrap();
    let tree = ro.open_dbi("test").unwrap();
    assert_eq!(ro.get(&tree, b"inline").unwrap(), inline_value);
    assert_eq!(ro.get(&tree, b"overflow").unwrap(), overflow_value);
}

#[test]
fn empty_tree_cursor_first_is_not_found() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();
    let env = open_fresh(&path);
    let mut txn = env.begin_rw().unwrap();
    txn.open_dbi("test", dflags::CREATE).unwrap();
    let tree = txn.open_dbi("test", 0).unwrap();

    let mut cursor = txn.cursor();
    let err = cursor.get(&txn, &tree, None, None, Op::First).unwrap_err();
    assert!(matches!(err, Error::NotFound));
}

#[test]
fn single_entry_cursor_next_is_not_found() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();
    let env = open_fresh(&path);
    let mut txn = env.begin_rw().unwrap();
    txn.open_dbi("test", dflags::CREATE).unwrap();
    txn.put("test", b"only", b"value", 0).unwrap();
    let tree = txn.open_dbi("test", 0).unwrap();

    let mut cursor = txn.cursor();
    let (k, v) = cursor.get(&txn, &tree, None, None, Op::First).unwrap();
    assert_eq!(k, b"only");
    assert_eq!(v, b"value");

    let err = cursor.get(&txn, &tree, None, None, Op::Next).unwrap_err();
    assert!(matches!(err, Error::NotFound));
}
