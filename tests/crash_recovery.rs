//! Crash atomicity and journal recovery
//!
//! The in-memory adapter's fault controller simulates power loss after an
//! arbitrary number of mutating file operations. These tests enumerate
//! every crash point inside a commit and assert that reopening the
//! database always observes either the complete pre-commit state or the
//! complete post-commit state.

use std::sync::Arc;

use strata::os::mem::MemVfs;
use strata::storage::pager::Pager;
use strata::{DbConfig, ErrorCode, Pgno};

const PAGE_SIZE: u32 = 1024;
const N_PAGES: Pgno = 6;

fn config() -> DbConfig {
    DbConfig {
        page_size: PAGE_SIZE,
        cache_size: 16,
        ..Default::default()
    }
}

fn open_pager(vfs: &MemVfs) -> Pager {
    Pager::open(Arc::new(vfs.clone()), "crash.db", &config()).unwrap()
}

fn fill_page(pager: &mut Pager, pgno: Pgno, byte: u8) {
    let page = pager.get(pgno).unwrap();
    pager.write(&page).unwrap();
    pager.page_data_mut(&page).fill(byte);
    pager.unref(page);
}

/// Write generation `gen` into every page and commit.
fn commit_generation(pager: &mut Pager, generation: u8) {
    pager.begin().unwrap();
    for pgno in 1..=N_PAGES {
        fill_page(pager, pgno, generation);
    }
    pager.commit().unwrap();
}

/// Classify the database as uniformly generation A, generation B, or
/// torn. The change counter bytes on page 1 are excluded: the pager owns
/// them.
fn observed_generation(pager: &mut Pager, a: u8, b: u8) -> Option<u8> {
    let mut seen: Option<u8> = None;
    for pgno in 1..=N_PAGES {
        let page = pager.get(pgno).unwrap();
        let data = pager.page_data(&page);
        let probe = if pgno == 1 { &data[32..] } else { &data[..] };
        let byte = probe[0];
        let uniform = probe.iter().all(|&x| x == byte);
        pager.unref(page);
        if !uniform || (byte != a && byte != b) {
            return None;
        }
        match seen {
            None => seen = Some(byte),
            Some(prev) if prev != byte => return None,
            _ => {}
        }
    }
    seen
}

#[test]
fn every_commit_crash_point_is_atomic() {
    // Dry run to learn how many mutating operations one full cycle takes
    let vfs = MemVfs::new();
    let mut pager = open_pager(&vfs);
    commit_generation(&mut pager, 0xA1);
    pager.begin().unwrap();
    for pgno in 1..=N_PAGES {
        fill_page(&mut pager, pgno, 0xB2);
    }
    let before_commit = vfs.mutating_ops();
    pager.commit().unwrap();
    let commit_ops = vfs.mutating_ops() - before_commit;
    pager.close().unwrap();
    assert!(commit_ops > 4, "commit did too little I/O to be real");

    // Crash at every point inside the commit
    for crash_at in 0..commit_ops {
        let vfs = MemVfs::new();
        let mut pager = open_pager(&vfs);
        commit_generation(&mut pager, 0xA1);

        pager.begin().unwrap();
        for pgno in 1..=N_PAGES {
            fill_page(&mut pager, pgno, 0xB2);
        }
        vfs.fail_after(crash_at);
        let rc = pager.commit();
        assert!(rc.is_err(), "crash point {} did not fire", crash_at);
        drop(pager);
        vfs.clear_faults();

        let mut reopened = open_pager(&vfs);
        let generation = observed_generation(&mut reopened, 0xA1, 0xB2);
        assert!(
            generation == Some(0xA1) || generation == Some(0xB2),
            "crash point {} left a torn database: {:?}",
            crash_at,
            generation
        );
        // Recovery leaves no journal behind
        assert!(
            vfs.file_contents("crash.db-journal").is_none(),
            "crash point {} left a journal",
            crash_at
        );
        reopened.close().unwrap();
    }
}

#[test]
fn crash_during_journal_append_preserves_old_state() {
    // Crashes while pre-images are still being appended never touch the
    // main file; the incomplete journal is discarded on reopen.
    let vfs = MemVfs::new();
    let mut pager = open_pager(&vfs);
    commit_generation(&mut pager, 0x51);

    for crash_at in 0..6 {
        pager.begin().unwrap();
        vfs.fail_after(crash_at);
        let rc = (|| -> strata::Result<()> {
            let page = pager.get(5)?;
            pager.write(&page)?;
            pager.page_data_mut(&page).fill(0x62);
            pager.unref(page);
            let page = pager.get(3)?;
            pager.write(&page)?;
            pager.page_data_mut(&page).fill(0x62);
            pager.unref(page);
            Ok(())
        })();
        vfs.clear_faults();
        if rc.is_err() {
            drop(pager);
            let mut reopened = open_pager(&vfs);
            assert_eq!(observed_generation(&mut reopened, 0x51, 0x62), Some(0x51));
            pager = reopened;
        } else {
            pager.rollback().unwrap();
        }
    }
    pager.close().unwrap();
}

#[test]
fn commit_then_crash_before_journal_delete_keeps_new_state() {
    // The full commit sequence minus the final unlink: the header was
    // zeroed, so the leftover journal is cold and the new contents stand.
    let vfs = MemVfs::new();
    let mut pager = open_pager(&vfs);
    commit_generation(&mut pager, 0xA1);

    pager.begin().unwrap();
    for pgno in 1..=N_PAGES {
        fill_page(&mut pager, pgno, 0xB2);
    }
    let before = vfs.mutating_ops();
    pager.commit().unwrap();
    let commit_ops = vfs.mutating_ops() - before;
    pager.close().unwrap();

    // Replay, failing only the unlink (the last operation)
    let vfs = MemVfs::new();
    let mut pager = open_pager(&vfs);
    commit_generation(&mut pager, 0xA1);
    pager.begin().unwrap();
    for pgno in 1..=N_PAGES {
        fill_page(&mut pager, pgno, 0xB2);
    }
    vfs.fail_after(commit_ops - 1);
    let err = pager.commit().unwrap_err();
    assert_eq!(err.code(), ErrorCode::IoErr);
    drop(pager);
    vfs.clear_faults();
    assert!(vfs.file_contents("crash.db-journal").is_some());

    let mut reopened = open_pager(&vfs);
    assert_eq!(observed_generation(&mut reopened, 0xA1, 0xB2), Some(0xB2));
    assert!(vfs.file_contents("crash.db-journal").is_none());
    reopened.close().unwrap();
}

#[test]
fn torn_journal_header_is_treated_as_absent() {
    let vfs = MemVfs::new();
    let mut pager = open_pager(&vfs);
    commit_generation(&mut pager, 0x71);
    pager.close().unwrap();

    // Fabricate a torn journal: too short to hold a header
    {
        use strata::os::vfs::{OpenFlags, Vfs};
        let mut jfd = vfs
            .open(
                Some("crash.db-journal"),
                OpenFlags::READWRITE | OpenFlags::CREATE,
            )
            .unwrap();
        jfd.write(&[0xD7, 0x61, 0x2B], 0).unwrap();
    }

    let mut reopened = open_pager(&vfs);
    assert_eq!(observed_generation(&mut reopened, 0x71, 0x00), Some(0x71));
    assert!(vfs.file_contents("crash.db-journal").is_none());
    reopened.close().unwrap();
}

#[test]
fn corrupt_journal_record_stops_playback() {
    // A record whose checksum fails terminates recovery at that record;
    // earlier records stay applied.
    let vfs = MemVfs::new();
    let mut pager = open_pager(&vfs);
    commit_generation(&mut pager, 0x41);

    // Crash right before the first main-file page write, leaving a
    // durable journal
    pager.begin().unwrap();
    for pgno in 1..=N_PAGES {
        fill_page(&mut pager, pgno, 0x52);
    }
    vfs.fail_after(2); // journal header rewrite + journal fsync
    assert!(pager.commit().is_err());
    drop(pager);
    vfs.clear_faults();

    // Flip a byte inside the last journal record's page image
    {
        use strata::os::vfs::{OpenFlags, Vfs};
        let img = vfs.file_contents("crash.db-journal").unwrap();
        let mut jfd = vfs
            .open(Some("crash.db-journal"), OpenFlags::READWRITE)
            .unwrap();
        let record_size = 4 + PAGE_SIZE as usize + 4;
        let last_record = 28 + (img.len() - 28) / record_size * record_size - record_size;
        // Offset 224 is one of the checksum's sample points
        let target = last_record + 4 + 224;
        jfd.write(&[img[target] ^ 0xFF], target as i64).unwrap();
    }

    // Recovery must not error out; the main file was never touched, so
    // the old generation is intact regardless of where playback stopped
    let mut reopened = open_pager(&vfs);
    assert_eq!(observed_generation(&mut reopened, 0x41, 0x52), Some(0x41));
    reopened.close().unwrap();
}

#[test]
fn recovery_is_idempotent() {
    // Run recovery twice over the same journal bytes: the second pass
    // must leave the main file exactly as the first did.
    let vfs = MemVfs::new();
    let mut pager = open_pager(&vfs);
    commit_generation(&mut pager, 0x31);

    pager.begin().unwrap();
    for pgno in 1..=N_PAGES {
        fill_page(&mut pager, pgno, 0x42);
    }
    vfs.fail_after(3); // journal durable, first page write lands, then crash
    assert!(pager.commit().is_err());
    drop(pager);
    vfs.clear_faults();

    let journal_before = vfs.file_contents("crash.db-journal").unwrap();

    // First recovery
    let reopened = open_pager(&vfs);
    reopened.close().unwrap();
    let file_after_first = vfs.file_contents("crash.db").unwrap();

    // Put the journal back and recover again
    {
        use strata::os::vfs::{OpenFlags, Vfs};
        let mut jfd = vfs
            .open(
                Some("crash.db-journal"),
                OpenFlags::READWRITE | OpenFlags::CREATE,
            )
            .unwrap();
        jfd.write(&journal_before, 0).unwrap();
    }
    let reopened = open_pager(&vfs);
    reopened.close().unwrap();
    let file_after_second = vfs.file_contents("crash.db").unwrap();

    assert_eq!(file_after_first, file_after_second);
}
