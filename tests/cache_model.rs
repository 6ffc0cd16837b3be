//! Cache eviction under load
//!
//! A pager capped at ten frames mutates a thousand distinct pages; the
//! final file must match a plain in-memory model byte for byte. This
//! exercises the LRU recycling path and the journal-first spill protocol
//! continuously.

use std::sync::Arc;

use strata::os::mem::MemVfs;
use strata::random::Prng;
use strata::storage::pager::Pager;
use strata::{DbConfig, Pgno};

const PAGE_SIZE: usize = 1024;
const N_PAGES: Pgno = 1000;

fn open_small_cache(vfs: &MemVfs) -> Pager {
    let config = DbConfig {
        page_size: PAGE_SIZE as u32,
        cache_size: 10,
        ..Default::default()
    };
    Pager::open(Arc::new(vfs.clone()), "model.db", &config).unwrap()
}

#[test]
fn thousand_pages_through_ten_frames_match_reference_model() {
    let vfs = MemVfs::new();
    let mut pager = open_small_cache(&vfs);
    let mut model = vec![vec![0u8; PAGE_SIZE]; N_PAGES as usize + 1];

    // Seed every page so later transactions always have pre-images
    pager.begin().unwrap();
    for pgno in 1..=N_PAGES {
        let page = pager.get(pgno).unwrap();
        pager.write(&page).unwrap();
        pager.page_data_mut(&page).fill(pgno as u8);
        model[pgno as usize].fill(pgno as u8);
        pager.unref(page);
    }
    pager.commit().unwrap();

    // Random single-byte mutations across the whole file
    let mut prng = Prng::from_seed(b"cache-model");
    for _ in 0..20 {
        pager.begin().unwrap();
        for _ in 0..200 {
            let pgno = (prng.below(N_PAGES as u64) + 1) as Pgno;
            let offset = prng.below(PAGE_SIZE as u64) as usize;
            let value = prng.below(256) as u8;

            let page = pager.get(pgno).unwrap();
            pager.write(&page).unwrap();
            pager.page_data_mut(&page)[offset] = value;
            pager.unref(page);
            model[pgno as usize][offset] = value;
        }
        pager.commit().unwrap();
    }
    pager.close().unwrap();

    // The change counter on page 1 belongs to the pager, not the model
    let file = vfs.file_contents("model.db").unwrap();
    assert_eq!(file.len(), N_PAGES as usize * PAGE_SIZE);
    for pgno in 1..=N_PAGES as usize {
        let got = &file[(pgno - 1) * PAGE_SIZE..pgno * PAGE_SIZE];
        let want = &model[pgno];
        if pgno == 1 {
            assert_eq!(&got[..24], &want[..24], "page 1 prefix differs");
            assert_eq!(&got[28..], &want[28..], "page 1 suffix differs");
        } else {
            assert_eq!(got, want, "page {} differs from the model", pgno);
        }
    }
}

#[test]
fn rollback_under_eviction_pressure_matches_model() {
    let vfs = MemVfs::new();
    let mut pager = open_small_cache(&vfs);
    let mut model = vec![vec![0u8; PAGE_SIZE]; 101];

    pager.begin().unwrap();
    for pgno in 1..=100u32 {
        let page = pager.get(pgno).unwrap();
        pager.write(&page).unwrap();
        pager.page_data_mut(&page).fill(0x10);
        model[pgno as usize].fill(0x10);
        pager.unref(page);
    }
    pager.commit().unwrap();

    // A big transaction that spills heavily, then rolls back
    let mut prng = Prng::from_seed(b"rollback-model");
    pager.begin().unwrap();
    for _ in 0..500 {
        let pgno = (prng.below(100) + 1) as Pgno;
        let page = pager.get(pgno).unwrap();
        pager.write(&page).unwrap();
        pager.page_data_mut(&page).fill(0xEE);
        pager.unref(page);
    }
    pager.rollback().unwrap();
    pager.close().unwrap();

    let file = vfs.file_contents("model.db").unwrap();
    for pgno in 1..=100usize {
        let got = &file[(pgno - 1) * PAGE_SIZE..pgno * PAGE_SIZE];
        let want = &model[pgno];
        if pgno == 1 {
            assert_eq!(&got[..24], &want[..24]);
            assert_eq!(&got[28..], &want[28..]);
        } else {
            assert_eq!(got, want, "page {} not restored", pgno);
        }
    }
}
