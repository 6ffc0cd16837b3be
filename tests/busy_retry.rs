//! Lock contention between connections
//!
//! Two pagers share one in-memory database. The adapter's lock table
//! implements the four-level compatibility rules exactly, so Reserved and
//! Exclusive conflicts surface as Busy the same way they would across
//! processes on disk.

use std::sync::Arc;

use strata::os::mem::MemVfs;
use strata::storage::pager::Pager;
use strata::{DbConfig, ErrorCode, Pgno};

fn config() -> DbConfig {
    DbConfig {
        page_size: 1024,
        cache_size: 16,
        ..Default::default()
    }
}

fn open_pager(vfs: &MemVfs) -> Pager {
    Pager::open(Arc::new(vfs.clone()), "busy.db", &config()).unwrap()
}

fn fill_page(pager: &mut Pager, pgno: Pgno, byte: u8) {
    let page = pager.get(pgno).unwrap();
    pager.write(&page).unwrap();
    pager.page_data_mut(&page).fill(byte);
    pager.unref(page);
}

#[test]
fn second_writer_gets_busy_without_handler() {
    let vfs = MemVfs::new();
    let mut a = open_pager(&vfs);
    let mut b = open_pager(&vfs);

    a.begin().unwrap();
    assert_eq!(b.begin().unwrap_err().code(), ErrorCode::Busy);

    a.rollback().unwrap();
    b.begin().unwrap();
    b.rollback().unwrap();
    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn busy_handler_retries_until_the_lock_frees() {
    let vfs = MemVfs::new();
    let mut a = open_pager(&vfs);
    let mut b = open_pager(&vfs);

    // A holds Reserved
    a.begin().unwrap();
    fill_page(&mut a, 1, 0x11);

    // B's handler lets A finish on the third attempt, then keeps
    // retrying. Between attempts B holds no locks at all, so A's commit
    // can reach Exclusive.
    let parked = std::sync::Arc::new(std::sync::Mutex::new(Some(a)));
    let parked_in_handler = parked.clone();
    b.set_busy_handler(Some(Box::new(move |count: u32| {
        if count >= 2 {
            if let Some(mut a) = parked_in_handler.lock().unwrap().take() {
                a.commit().unwrap();
                a.close().unwrap();
            }
        }
        count < 10
    })));

    // Retries while A holds the lock, then succeeds once A commits
    b.begin().unwrap();
    fill_page(&mut b, 2, 0x22);
    b.commit().unwrap();
    b.close().unwrap();

    // A's page and B's page both persisted
    let mut check = open_pager(&vfs);
    let page = check.get(1).unwrap();
    assert_eq!(check.page_data(&page)[0], 0x11);
    check.unref(page);
    let page = check.get(2).unwrap();
    assert_eq!(check.page_data(&page)[0], 0x22);
    check.unref(page);
    check.close().unwrap();
}

#[test]
fn handler_that_gives_up_surfaces_busy() {
    let vfs = MemVfs::new();
    let mut a = open_pager(&vfs);
    let mut b = open_pager(&vfs);

    a.begin().unwrap();

    let mut attempts = 0u32;
    b.set_busy_handler(Some(Box::new(move |_count: u32| {
        attempts += 1;
        attempts < 3
    })));

    assert_eq!(b.begin().unwrap_err().code(), ErrorCode::Busy);
    a.rollback().unwrap();
    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn reader_does_not_block_writer_between_statements() {
    let vfs = MemVfs::new();
    let mut reader = open_pager(&vfs);
    let mut writer = open_pager(&vfs);

    // Seed a page
    writer.begin().unwrap();
    fill_page(&mut writer, 1, 0x01);
    writer.commit().unwrap();

    // The reader touches the page and drops its reference, releasing
    // the read lock with it
    let page = reader.get(1).unwrap();
    assert_eq!(reader.page_data(&page)[0], 0x01);
    reader.unref(page);

    // The writer can now reach Exclusive and commit
    writer.begin().unwrap();
    fill_page(&mut writer, 1, 0x02);
    writer.commit().unwrap();

    // The reader sees the new state
    let page = reader.get(1).unwrap();
    assert_eq!(reader.page_data(&page)[0], 0x02);
    reader.unref(page);

    reader.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn pinned_reader_blocks_commit_until_released() {
    let vfs = MemVfs::new();
    let mut reader = open_pager(&vfs);
    let mut writer = open_pager(&vfs);

    writer.begin().unwrap();
    fill_page(&mut writer, 1, 0x01);
    writer.commit().unwrap();

    // Reader holds a pin, so its shared lock persists
    let pin = reader.get(1).unwrap();

    writer.begin().unwrap();
    fill_page(&mut writer, 1, 0x02);
    // Exclusive upgrade cannot proceed past the reader
    assert_eq!(writer.commit().unwrap_err().code(), ErrorCode::Busy);

    // Releasing the pin releases the shared lock; the retry goes through
    reader.unref(pin);
    writer.commit().unwrap();

    reader.close().unwrap();
    writer.close().unwrap();
}
