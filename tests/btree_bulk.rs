//! Large mixed workloads over the B-tree
//!
//! Splits, merges, and the free-list working together at a scale where a
//! tree reaches several levels.

use std::collections::BTreeSet;
use std::sync::Arc;

use strata::os::mem::MemVfs;
use strata::random::Prng;
use strata::storage::btree::Btree;
use strata::{encode_record, DbConfig, RowId, Value};

fn open_tree(vfs: &MemVfs) -> Btree {
    let config = DbConfig {
        page_size: 1024,
        cache_size: 64,
        ..Default::default()
    };
    Btree::open(Arc::new(vfs.clone()), "bulk.db", &config).unwrap()
}

fn payload_for(rowid: RowId) -> Vec<u8> {
    encode_record(&[
        Value::Integer(rowid),
        Value::Text(format!("payload for row {}", rowid)),
    ])
}

#[test]
fn ten_thousand_random_keys_survive_split_and_merge() {
    let vfs = MemVfs::new();
    let mut tree = open_tree(&vfs);
    tree.begin_trans(true).unwrap();
    let root = tree.create_table(false).unwrap();

    // Insert 10,000 distinct pseudo-random keys
    let mut prng = Prng::from_seed(b"bulk-1");
    let mut model = BTreeSet::new();
    let cur = tree.cursor_open(root, None, true).unwrap();
    while model.len() < 10_000 {
        let rowid = (prng.below(1 << 40) + 1) as RowId;
        if model.insert(rowid) {
            tree.table_insert(cur, rowid, &payload_for(rowid)).unwrap();
        }
    }
    tree.cursor_close(cur);
    tree.commit().unwrap();

    // Full ordered read-back
    tree.begin_trans(false).unwrap();
    let cur = tree.cursor_open(root, None, false).unwrap();
    let mut seen = Vec::new();
    let mut more = tree.cursor_first(cur).unwrap();
    while more {
        seen.push(tree.cursor_rowid(cur).unwrap());
        more = tree.cursor_next(cur).unwrap();
    }
    tree.cursor_close(cur);
    let want: Vec<RowId> = model.iter().copied().collect();
    assert_eq!(seen, want);
    tree.commit().unwrap();

    // Delete every third key in iteration order
    tree.begin_trans(true).unwrap();
    let cur = tree.cursor_open(root, None, true).unwrap();
    let doomed: Vec<RowId> = model.iter().copied().step_by(3).collect();
    for rowid in &doomed {
        assert_eq!(tree.table_seek(cur, *rowid).unwrap(), 0);
        tree.cursor_delete(cur).unwrap();
        model.remove(rowid);
    }

    // Verify ordering and count after the deletions
    let mut seen = Vec::new();
    let mut more = tree.cursor_first(cur).unwrap();
    while more {
        seen.push(tree.cursor_rowid(cur).unwrap());
        more = tree.cursor_next(cur).unwrap();
    }
    let want: Vec<RowId> = model.iter().copied().collect();
    assert_eq!(seen, want);

    // Insert 10,000 more keys and make sure nothing is lost
    while model.len() < want.len() + 10_000 {
        let rowid = (prng.below(1 << 40) + 1) as RowId;
        if model.insert(rowid) {
            tree.table_insert(cur, rowid, &payload_for(rowid)).unwrap();
        }
    }
    tree.cursor_close(cur);
    tree.commit().unwrap();

    tree.begin_trans(false).unwrap();
    let cur = tree.cursor_open(root, None, false).unwrap();
    let mut count = 0usize;
    let mut prev: Option<RowId> = None;
    let mut more = tree.cursor_first(cur).unwrap();
    while more {
        let rowid = tree.cursor_rowid(cur).unwrap();
        if let Some(p) = prev {
            assert!(rowid > p, "keys out of order: {} after {}", rowid, p);
        }
        assert!(model.contains(&rowid), "phantom key {}", rowid);
        prev = Some(rowid);
        count += 1;
        more = tree.cursor_next(cur).unwrap();
    }
    tree.cursor_close(cur);
    assert_eq!(count, model.len());

    let report = tree.integrity_check(&[root], 100).unwrap();
    assert!(report.is_ok(), "integrity: {:?}", report.errors);
    tree.close().unwrap();
}

#[test]
fn interleaved_insert_delete_against_model() {
    let vfs = MemVfs::new();
    let mut tree = open_tree(&vfs);
    tree.begin_trans(true).unwrap();
    let root = tree.create_table(false).unwrap();

    let mut prng = Prng::from_seed(b"bulk-2");
    let mut model = BTreeSet::new();
    let cur = tree.cursor_open(root, None, true).unwrap();

    for _ in 0..20_000 {
        let rowid = (prng.below(2000) + 1) as RowId;
        if prng.below(3) == 0 {
            let present = model.remove(&rowid);
            let res = tree.table_seek(cur, rowid).unwrap();
            if present {
                assert_eq!(res, 0, "model has {} but tree does not", rowid);
                tree.cursor_delete(cur).unwrap();
            } else {
                assert_ne!(res, 0, "tree has {} but model does not", rowid);
            }
        } else {
            model.insert(rowid);
            tree.table_insert(cur, rowid, &payload_for(rowid)).unwrap();
        }
    }
    tree.cursor_close(cur);
    tree.commit().unwrap();

    tree.begin_trans(false).unwrap();
    let cur = tree.cursor_open(root, None, false).unwrap();
    let mut seen = Vec::new();
    let mut more = tree.cursor_first(cur).unwrap();
    while more {
        seen.push(tree.cursor_rowid(cur).unwrap());
        more = tree.cursor_next(cur).unwrap();
    }
    tree.cursor_close(cur);
    let want: Vec<RowId> = model.iter().copied().collect();
    assert_eq!(seen, want);

    let report = tree.integrity_check(&[root], 100).unwrap();
    assert!(report.is_ok(), "integrity: {:?}", report.errors);
    tree.close().unwrap();
}

#[test]
fn mixed_payload_sizes_with_overflow() {
    let vfs = MemVfs::new();
    let mut tree = open_tree(&vfs);
    tree.begin_trans(true).unwrap();
    let root = tree.create_table(false).unwrap();

    let mut prng = Prng::from_seed(b"bulk-3");
    let cur = tree.cursor_open(root, None, true).unwrap();

    // Payload sizes straddle the overflow threshold of a 1 KiB page
    let mut sizes = Vec::new();
    for rowid in 1..=500 {
        let size = prng.below(4000) as usize;
        let byte = (rowid % 251) as u8;
        tree.table_insert(cur, rowid, &vec![byte; size]).unwrap();
        sizes.push((rowid, size, byte));
    }
    tree.cursor_close(cur);
    tree.commit().unwrap();

    tree.begin_trans(false).unwrap();
    let cur = tree.cursor_open(root, None, false).unwrap();
    for (rowid, size, byte) in sizes {
        assert_eq!(tree.table_seek(cur, rowid).unwrap(), 0);
        let payload = tree.cursor_payload(cur).unwrap();
        assert_eq!(payload.len(), size);
        assert!(payload.iter().all(|&b| b == byte));
    }
    tree.cursor_close(cur);

    let report = tree.integrity_check(&[root], 100).unwrap();
    assert!(report.is_ok(), "integrity: {:?}", report.errors);
    tree.close().unwrap();
}
