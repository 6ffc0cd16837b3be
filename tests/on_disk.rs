//! End-to-end runs against real files through the Unix adapter.

#![cfg(unix)]

use std::sync::Arc;

use strata::os::unix::UnixVfs;
use strata::storage::btree::Btree;
use strata::storage::pager::Pager;
use strata::{decode_record, encode_record, DbConfig, MetaField, Value};

fn config() -> DbConfig {
    DbConfig {
        page_size: 4096,
        cache_size: 100,
        ..Default::default()
    }
}

#[test]
fn pager_roundtrip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.db");
    let path = path.to_str().unwrap();

    let mut pager = Pager::open(Arc::new(UnixVfs::new()), path, &config()).unwrap();
    pager.begin().unwrap();
    for pgno in 1..=10 {
        let page = pager.get(pgno).unwrap();
        pager.write(&page).unwrap();
        pager.page_data_mut(&page).fill(0x40 + pgno as u8);
        pager.unref(page);
    }
    pager.commit().unwrap();
    pager.close().unwrap();

    let mut pager = Pager::open(Arc::new(UnixVfs::new()), path, &config()).unwrap();
    assert_eq!(pager.page_count(), 10);
    for pgno in 1..=10 {
        let page = pager.get(pgno).unwrap();
        assert_eq!(pager.page_data(&page)[100], 0x40 + pgno as u8);
        pager.unref(page);
    }
    pager.close().unwrap();

    // No journal left behind
    assert!(!std::path::Path::new(&format!("{}-journal", path)).exists());
}

#[test]
fn btree_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.db");
    let path = path.to_str().unwrap();

    let root;
    {
        let mut tree = Btree::open(Arc::new(UnixVfs::new()), path, &config()).unwrap();
        tree.begin_trans(true).unwrap();
        root = tree.create_table(false).unwrap();
        let cur = tree.cursor_open(root, None, true).unwrap();
        for rowid in 1..=3000 {
            let payload = encode_record(&[
                Value::Integer(rowid),
                Value::Text(format!("disk row {}", rowid)),
                Value::Blob(vec![rowid as u8; 64]),
            ]);
            tree.table_insert(cur, rowid, &payload).unwrap();
        }
        tree.cursor_close(cur);
        let cookie = tree.get_meta(MetaField::SchemaCookie);
        tree.update_meta(MetaField::SchemaCookie, cookie + 1).unwrap();
        tree.commit().unwrap();
        tree.close().unwrap();
    }

    let mut tree = Btree::open(Arc::new(UnixVfs::new()), path, &config()).unwrap();
    tree.begin_trans(false).unwrap();
    assert_eq!(tree.get_meta(MetaField::SchemaCookie), 1);

    let cur = tree.cursor_open(root, None, false).unwrap();
    assert_eq!(tree.table_seek(cur, 1500).unwrap(), 0);
    let record = tree.cursor_payload(cur).unwrap();
    let values = decode_record(&record).unwrap();
    assert_eq!(values[0], Value::Integer(1500));
    assert_eq!(values[1], Value::Text("disk row 1500".into()));

    let mut count = 0;
    let mut more = tree.cursor_first(cur).unwrap();
    while more {
        count += 1;
        more = tree.cursor_next(cur).unwrap();
    }
    assert_eq!(count, 3000);
    tree.cursor_close(cur);

    let report = tree.integrity_check(&[root], 50).unwrap();
    assert!(report.is_ok(), "integrity: {:?}", report.errors);
    tree.close().unwrap();
}

#[test]
fn page_size_is_fixed_at_creation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixed.db");
    let path = path.to_str().unwrap();

    {
        let mut tree = Btree::open(Arc::new(UnixVfs::new()), path, &config()).unwrap();
        tree.begin_trans(true).unwrap();
        tree.commit().unwrap();
        tree.close().unwrap();
    }

    // Reopening with a different configured size keeps the on-disk size
    let other = DbConfig {
        page_size: 1024,
        ..config()
    };
    let tree = Btree::open(Arc::new(UnixVfs::new()), path, &other).unwrap();
    assert_eq!(tree.pager().page_size(), 4096);
    tree.close().unwrap();
}
