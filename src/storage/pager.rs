//! Pager
//!
//! The layer that binds the page cache, the rollback journal, and the file
//! adapter into a transactional paged store. All reads and writes of
//! database pages go through here; the B-tree above never touches the file
//! directly.
//!
//! Write path: the first `write` of a page in a transaction appends the
//! page's pre-image to the journal and records the page number in a
//! bitvec, so later writes to the same page skip the journal. A dirty
//! frame reaches the main file only after its journal record is durable:
//! either during commit (journal fsync precedes the page sweep) or during
//! a cache spill (the journal is fsynced before the victim is written).
//!
//! Lock state machine: `Open -> Reader -> Writer -> WriterLocked`, back to
//! `Open` when a transaction ends with no pages pinned, and `Error` after
//! an I/O failure mid-commit until the transaction is resolved. File locks
//! are released between transactions so that one idle connection never
//! blocks another's commit; a change counter on page 1 tells a returning
//! reader whether its cache survived the gap.

use std::sync::Arc;

use crate::config::{BusyHandler, DbConfig, PageCodec, SyncMode};
use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{AccessFlags, OpenFlags, SyncFlags, Vfs, VfsFile};
use crate::random::Prng;
use crate::storage::pcache::{FrameFlags, FrameId, PageCache};
use crate::types::{DbOffset, LockLevel, Pgno};
use crate::util::bitvec::Bitvec;

// ============================================================================
// Constants
// ============================================================================

/// Journal header magic
pub const JOURNAL_MAGIC: [u8; 8] = [0xd7, 0x61, 0x2b, 0x81, 0x53, 0x9c, 0xe6, 0xa4];

/// Size of the journal header in bytes
pub const JOURNAL_HEADER_SIZE: usize = 28;

/// Default page size
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Minimum page size
pub const MIN_PAGE_SIZE: u32 = 512;

/// Maximum page size
pub const MAX_PAGE_SIZE: u32 = 65536;

// Database header fields the pager consults directly; the full page-1
// layout belongs to the B-tree layer.
const DB_HDR_PAGESIZE_OFFSET: usize = 16;
const DB_HDR_RESERVED_OFFSET: usize = 20;
const DB_HDR_CHANGE_COUNTER_OFFSET: usize = 24;

// ============================================================================
// Enums
// ============================================================================

/// Pager state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum PagerState {
    /// No lock held
    Open = 0,
    /// Shared lock held; reads allowed
    Reader = 1,
    /// Reserved lock held; journal open, writes accumulate in cache
    Writer = 2,
    /// Exclusive lock held; main file being updated
    WriterLocked = 3,
    /// An I/O error poisoned the transaction
    Error = 4,
}

/// How a finished journal is disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Delete the journal file on commit
    Delete,
    /// Truncate the journal to zero length on commit
    Truncate,
    /// Zero the journal header on commit, keep the file
    Persist,
    /// No journal at all (temp / throwaway databases)
    Off,
}

/// Cumulative pager counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PagerStats {
    /// Pages read from disk
    pub n_read: u64,
    /// Pages written to disk
    pub n_write: u64,
    /// Cache hits
    pub n_hit: u64,
    /// Cache misses
    pub n_miss: u64,
}

// ============================================================================
// Page handle
// ============================================================================

/// A pinned page. Obtained from `get`, returned through `unref`. Not
/// copyable: each handle stands for exactly one reference count.
#[derive(Debug)]
pub struct PageRef {
    pgno: Pgno,
    frame: FrameId,
}

impl PageRef {
    pub fn pgno(&self) -> Pgno {
        self.pgno
    }
}

// ============================================================================
// Journal header
// ============================================================================

/// Fixed-size journal header: magic, record count, checksum nonce, page
/// count at transaction start, sector size, page size.
#[derive(Debug, Clone)]
struct JournalHeader {
    n_rec: u32,
    nonce: u32,
    orig_pages: Pgno,
    sector_size: u32,
    page_size: u32,
}

impl JournalHeader {
    fn to_bytes(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        buf[0..8].copy_from_slice(&JOURNAL_MAGIC);
        buf[8..12].copy_from_slice(&self.n_rec.to_be_bytes());
        buf[12..16].copy_from_slice(&self.nonce.to_be_bytes());
        buf[16..20].copy_from_slice(&self.orig_pages.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sector_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.page_size.to_be_bytes());
        buf
    }

    /// Parse a header. `None` when the magic is absent or the buffer is
    /// short: per the recovery contract that means "no transaction".
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < JOURNAL_HEADER_SIZE || data[0..8] != JOURNAL_MAGIC {
            return None;
        }
        let be32 = |o: usize| u32::from_be_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        Some(Self {
            n_rec: be32(8),
            nonce: be32(12),
            orig_pages: be32(16),
            sector_size: be32(20),
            page_size: be32(24),
        })
    }
}

/// Journal record checksum: nonce plus the page number plus a sample of
/// the page image (every 200th byte, walking down from the end).
fn journal_checksum(nonce: u32, pgno: Pgno, data: &[u8]) -> u32 {
    let mut sum = nonce.wrapping_add(pgno);
    let mut i = data.len();
    while i >= 200 {
        i -= 200;
        sum = sum.wrapping_add(data[i] as u32);
    }
    sum
}

// ============================================================================
// Pager
// ============================================================================

/// Transactional paged store over one database file.
pub struct Pager {
    vfs: Arc<dyn Vfs>,
    fd: Box<dyn VfsFile>,
    jfd: Option<Box<dyn VfsFile>>,

    db_path: String,
    journal_path: String,

    state: PagerState,
    lock: LockLevel,
    journal_mode: JournalMode,
    err_code: Option<ErrorCode>,

    page_size: u32,
    reserved_bytes: u8,
    /// Logical page count, including pages appended this transaction
    db_size: Pgno,
    /// Logical page count when the current transaction began
    db_orig_size: Pgno,
    /// Pages physically present in the file
    db_file_size: Pgno,
    /// Value of the page-1 change counter our cache reflects
    change_counter: u32,

    cache: PageCache,
    /// Pages journalled in the active transaction
    in_journal: Option<Bitvec>,
    journal_offset: DbOffset,
    n_rec: u32,
    nonce: u32,
    /// All appended journal records are known durable
    journal_synced: bool,
    /// A spill or commit wrote to the main file this transaction
    db_file_modified: bool,

    sync_mode: SyncMode,
    busy_handler: Option<Box<dyn BusyHandler>>,
    codec: Option<Box<dyn PageCodec>>,
    read_only: bool,
    prng: Prng,
    stats: PagerStats,
}

impl Pager {
    // ========================================================================
    // Open / close
    // ========================================================================

    /// Open a pager on `path`. Takes a momentary shared lock to roll back
    /// any hot journal left by an earlier unclean shutdown, then releases
    /// it; the handle starts unlocked.
    pub fn open(vfs: Arc<dyn Vfs>, path: &str, config: &DbConfig) -> Result<Self> {
        if !config.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&config.page_size)
        {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("invalid page size {}", config.page_size),
            ));
        }

        let full_path = vfs.full_pathname(path)?;
        let journal_path = format!("{}-journal", full_path);

        let mut fd = vfs.open(
            Some(&full_path),
            OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB,
        )?;

        // An existing database dictates the page size. A header that does
        // not parse is not the pager's concern: the tree layer rejects
        // bad magic, so fall back to the configured size here.
        let file_len = fd.file_size()?;
        let (page_size, reserved_bytes) = if file_len >= 100 {
            let mut hdr = [0u8; 32];
            fd.read(&mut hdr, 0)?;
            let raw = u16::from_be_bytes([
                hdr[DB_HDR_PAGESIZE_OFFSET],
                hdr[DB_HDR_PAGESIZE_OFFSET + 1],
            ]);
            let ps = if raw == 1 { 65536u32 } else { raw as u32 };
            if ps.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&ps) {
                (ps, hdr[DB_HDR_RESERVED_OFFSET])
            } else {
                (config.page_size, 0)
            }
        } else {
            (config.page_size, 0)
        };

        let db_file_size = (file_len / page_size as i64) as Pgno;

        let mut pager = Self {
            vfs,
            fd,
            jfd: None,
            db_path: full_path,
            journal_path,
            state: PagerState::Open,
            lock: LockLevel::None,
            journal_mode: JournalMode::Delete,
            err_code: None,
            page_size,
            reserved_bytes,
            db_size: db_file_size,
            db_orig_size: db_file_size,
            db_file_size,
            change_counter: 0,
            cache: PageCache::new(page_size as usize, config.cache_size),
            in_journal: None,
            journal_offset: 0,
            n_rec: 0,
            nonce: 0,
            journal_synced: true,
            db_file_modified: false,
            sync_mode: config.sync_mode,
            busy_handler: if config.busy_timeout_ms > 0 {
                Some(Box::new(crate::config::TimeoutBusyHandler::new(
                    config.busy_timeout_ms,
                )))
            } else {
                None
            },
            codec: None,
            read_only: false,
            prng: Prng::new(),
            stats: PagerStats::default(),
        };

        // Recover eagerly so the caller never sees a hot journal
        pager.shared_lock()?;
        pager.release_read_lock();
        Ok(pager)
    }

    /// Close the pager. Fails with `Misuse` while page references are
    /// outstanding; an active transaction is rolled back.
    pub fn close(mut self) -> Result<()> {
        if self.cache.total_refs() != 0 {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("{} page references leaked at close", self.cache.total_refs()),
            ));
        }
        if self.state >= PagerState::Writer {
            let _ = self.rollback();
        }
        let _ = self.fd.unlock(LockLevel::None);
        Ok(())
    }

    // ========================================================================
    // Accessors and configuration
    // ========================================================================

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Bytes at the end of each page excluded from cell accounting.
    pub fn reserved_bytes(&self) -> u8 {
        self.reserved_bytes
    }

    pub fn usable_size(&self) -> u32 {
        self.page_size - self.reserved_bytes as u32
    }

    /// Current logical page count.
    pub fn page_count(&self) -> Pgno {
        self.db_size
    }

    pub fn state(&self) -> PagerState {
        self.state
    }

    pub fn stats(&self) -> PagerStats {
        self.stats
    }

    pub fn filename(&self) -> &str {
        &self.db_path
    }

    pub fn journal_name(&self) -> &str {
        &self.journal_path
    }

    pub fn is_readonly(&self) -> bool {
        self.read_only
    }

    pub fn in_transaction(&self) -> bool {
        self.state == PagerState::Writer || self.state == PagerState::WriterLocked
    }

    pub fn set_cache_size(&mut self, frames: usize) {
        self.cache.set_max_frames(frames);
    }

    pub fn set_sync_mode(&mut self, mode: SyncMode) {
        self.sync_mode = mode;
    }

    pub fn set_busy_handler(&mut self, handler: Option<Box<dyn BusyHandler>>) {
        self.busy_handler = handler;
    }

    pub fn set_codec(&mut self, codec: Option<Box<dyn PageCodec>>) {
        self.codec = codec;
    }

    /// Journal disposition cannot change mid-transaction.
    pub fn set_journal_mode(&mut self, mode: JournalMode) -> JournalMode {
        if !self.in_transaction() {
            self.journal_mode = mode;
        }
        self.journal_mode
    }

    /// Record the reserved-byte count for a database being created. Only
    /// meaningful before the first page reaches the file.
    pub fn set_reserved_bytes(&mut self, reserved: u8) -> Result<()> {
        if self.db_file_size > 0 {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.reserved_bytes = reserved;
        Ok(())
    }

    // ========================================================================
    // Locking
    // ========================================================================

    /// Acquire `level`, consulting the busy handler on contention.
    fn lock_with_retry(&mut self, level: LockLevel) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            match self.fd.lock(level) {
                Ok(()) => {
                    self.lock = level;
                    return Ok(());
                }
                Err(e) if e.is_busy() => {
                    let keep_trying = match self.busy_handler.as_mut() {
                        Some(handler) => handler.retry(attempts),
                        None => false,
                    };
                    if !keep_trying {
                        return Err(e);
                    }
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquire the Reserved lock for `begin`. Unlike a plain retry loop,
    /// every failed attempt releases our locks entirely before consulting
    /// the busy handler, so the writer we are waiting on can itself reach
    /// Exclusive and finish.
    fn reserved_lock_with_retry(&mut self) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            match self.fd.lock(LockLevel::Reserved) {
                Ok(()) => {
                    self.lock = LockLevel::Reserved;
                    return Ok(());
                }
                Err(e) if e.is_busy() => {
                    if self.cache.total_refs() == 0 {
                        let _ = self.unlock_to(LockLevel::None);
                        self.state = PagerState::Open;
                    }
                    let mut handler = self.busy_handler.take();
                    let keep_trying = handler
                        .as_mut()
                        .map(|h| h.retry(attempts))
                        .unwrap_or(false);
                    self.busy_handler = handler;
                    if !keep_trying {
                        return Err(e);
                    }
                    attempts += 1;
                    self.shared_lock()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn unlock_to(&mut self, level: LockLevel) -> Result<()> {
        if level < self.lock {
            self.fd.unlock(level)?;
            self.lock = level;
        }
        Ok(())
    }

    /// Move from `Open` to `Reader`: shared lock, hot-journal recovery,
    /// cache validation against the change counter.
    fn shared_lock(&mut self) -> Result<()> {
        if self.state >= PagerState::Reader {
            return Ok(());
        }

        self.lock_with_retry(LockLevel::Shared)?;
        match self.shared_lock_body() {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.unlock_to(LockLevel::None);
                Err(e)
            }
        }
    }

    fn shared_lock_body(&mut self) -> Result<()> {
        if self.has_hot_journal()? {
            // Playback needs the file to ourselves
            self.lock_with_retry(LockLevel::Exclusive)?;
            let rc = self.playback_hot_journal();
            self.unlock_to(LockLevel::Shared)?;
            rc?;
        }

        // Another connection may have committed while we were unlocked;
        // the change counter says whether our cache is still the truth.
        let counter = self.read_change_counter()?;
        if counter != self.change_counter {
            self.change_counter = counter;
            self.cache.clear();
        }

        let file_len = self.fd.file_size()?;
        self.db_file_size = (file_len / self.page_size as i64) as Pgno;
        self.db_size = self.db_file_size;
        self.db_orig_size = self.db_file_size;
        self.state = PagerState::Reader;
        Ok(())
    }

    fn read_change_counter(&mut self) -> Result<u32> {
        if self.fd.file_size()? < (DB_HDR_CHANGE_COUNTER_OFFSET + 4) as DbOffset {
            return Ok(0);
        }
        let mut buf = [0u8; 4];
        self.fd.read(&mut buf, DB_HDR_CHANGE_COUNTER_OFFSET as DbOffset)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Drop the read lock when nothing pins the cache. Called between
    /// transactions so writers elsewhere can reach Exclusive.
    fn release_read_lock(&mut self) {
        if self.cache.total_refs() == 0 && self.state <= PagerState::Reader {
            let _ = self.unlock_to(LockLevel::None);
            self.state = PagerState::Open;
        }
    }

    /// End-of-transaction lock release.
    fn end_transaction_locks(&mut self) {
        if self.cache.total_refs() == 0 {
            let _ = self.unlock_to(LockLevel::None);
            self.state = PagerState::Open;
        } else {
            let _ = self.unlock_to(LockLevel::Shared);
            self.state = PagerState::Reader;
        }
    }

    /// A journal file with content and no live writer is hot.
    fn has_hot_journal(&mut self) -> Result<bool> {
        if !self.vfs.access(&self.journal_path, AccessFlags::EXISTS)? {
            return Ok(false);
        }
        if self.fd.check_reserved_lock()? {
            // A writer is mid-transaction; its journal is not ours to touch
            return Ok(false);
        }
        let jfd = self
            .vfs
            .open(Some(&self.journal_path), OpenFlags::READWRITE | OpenFlags::MAIN_JOURNAL)?;
        let len = jfd.file_size()?;
        drop(jfd);
        Ok(len > 0)
    }

    // ========================================================================
    // Page access
    // ========================================================================

    /// Fetch a page, reading through the cache. Pages beyond the current
    /// page count come back zero-filled; the logical count grows only when
    /// such a page is first written.
    pub fn get(&mut self, pgno: Pgno) -> Result<PageRef> {
        if pgno == 0 {
            return Err(Error::with_message(ErrorCode::Corrupt, "page zero requested"));
        }
        if let Some(code) = self.err_code {
            return Err(Error::new(code));
        }
        self.shared_lock()?;

        if let Some(frame) = self.cache.fetch(pgno) {
            self.stats.n_hit += 1;
            return Ok(PageRef { pgno, frame });
        }
        self.stats.n_miss += 1;

        if self.cache.at_capacity() {
            self.make_room()?;
        }

        let frame = self.cache.allocate(pgno);
        if pgno <= self.db_file_size {
            let offset = (pgno as DbOffset - 1) * self.page_size as DbOffset;
            let frame_ref = self.cache.frame_mut(frame);
            if let Err(e) = self.fd.read(&mut frame_ref.data, offset) {
                self.cache.release(frame);
                self.cache.evict(frame);
                return Err(e);
            }
            if let Some(codec) = &self.codec {
                codec.decode(&mut self.cache.frame_mut(frame).data, pgno);
            }
            self.stats.n_read += 1;
        }

        Ok(PageRef { pgno, frame })
    }

    /// Fetch only if cached; no disk read, no allocation.
    pub fn lookup(&mut self, pgno: Pgno) -> Option<PageRef> {
        let frame = self.cache.fetch(pgno)?;
        Some(PageRef { pgno, frame })
    }

    /// Take an additional reference to an already held page.
    pub fn dup_ref(&mut self, page: &PageRef) -> PageRef {
        self.cache.reference(page.frame);
        PageRef {
            pgno: page.pgno,
            frame: page.frame,
        }
    }

    /// Return a page reference. At refcount zero the frame becomes an
    /// eviction candidate. Between transactions, dropping the last pin
    /// also drops the read lock.
    pub fn unref(&mut self, page: PageRef) {
        self.cache.release(page.frame);
        if self.state == PagerState::Reader {
            self.release_read_lock();
        }
    }

    /// Read access to a held page.
    pub fn page_data(&self, page: &PageRef) -> &[u8] {
        &self.cache.frame(page.frame).data
    }

    /// Write access to a held page. Valid only after `write` succeeded
    /// for this page in the current transaction.
    pub fn page_data_mut(&mut self, page: &PageRef) -> &mut [u8] {
        debug_assert!(self
            .cache
            .frame(page.frame)
            .flags
            .contains(FrameFlags::WRITEABLE));
        &mut self.cache.frame_mut(page.frame).data
    }

    /// Make a held page writable: journal its pre-image on the first
    /// write in this transaction, then mark the frame dirty.
    pub fn write(&mut self, page: &PageRef) -> Result<()> {
        if let Some(code) = self.err_code {
            return Err(Error::new(code));
        }
        if !self.in_transaction() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "write outside a transaction",
            ));
        }
        if self.read_only {
            return Err(Error::new(ErrorCode::ReadOnly));
        }

        let frame = page.frame;
        if self.cache.frame(frame).flags.contains(FrameFlags::WRITEABLE) {
            return Ok(());
        }

        // Only pages that existed at transaction start carry pre-images;
        // rollback removes newer pages by truncation.
        if page.pgno <= self.db_orig_size && self.journal_mode != JournalMode::Off {
            let journalled = self
                .in_journal
                .as_ref()
                .map(|bv| bv.test(page.pgno))
                .unwrap_or(false);
            if !journalled {
                self.journal_page(page.pgno, frame)?;
            }
        }

        let frame_ref = self.cache.frame_mut(frame);
        frame_ref.flags.insert(FrameFlags::WRITEABLE);
        self.cache.make_dirty(frame);
        if page.pgno > self.db_size {
            self.db_size = page.pgno;
        }
        Ok(())
    }

    /// Evict the coldest unreferenced frame, spilling it first when dirty.
    fn make_room(&mut self) -> Result<()> {
        let victim = match self.cache.evict_candidate() {
            Some(v) => v,
            None => {
                return Err(Error::with_message(
                    ErrorCode::NoMem,
                    "page cache exhausted and every frame is referenced",
                ))
            }
        };

        if self.cache.frame(victim).is_dirty() {
            self.spill_frame(victim)?;
        }
        self.cache.evict(victim);
        Ok(())
    }

    /// Write one dirty frame to the main file mid-transaction. The
    /// journal is made durable first so the pre-image survives a crash.
    fn spill_frame(&mut self, frame: FrameId) -> Result<()> {
        if self
            .cache
            .frame(frame)
            .flags
            .contains(FrameFlags::NEED_SYNC)
            && !self.journal_synced
        {
            self.sync_journal()?;
        }

        let pgno = self.cache.frame(frame).pgno;
        if let Err(e) = self.write_page_to_db(frame, pgno) {
            self.enter_error_state(&e);
            return Err(e);
        }
        self.cache.make_clean(frame);
        Ok(())
    }

    // ========================================================================
    // Journal
    // ========================================================================

    /// Open the journal exclusively and write its header.
    fn open_journal(&mut self) -> Result<()> {
        if self.journal_mode == JournalMode::Off {
            self.journal_offset = 0;
            self.n_rec = 0;
            self.journal_synced = true;
            return Ok(());
        }

        let flags = OpenFlags::READWRITE
            | OpenFlags::CREATE
            | OpenFlags::EXCLUSIVE
            | OpenFlags::MAIN_JOURNAL;
        let mut jfd = match self.vfs.open(Some(&self.journal_path), flags) {
            Ok(fd) => fd,
            Err(e) if e.code() == ErrorCode::CantOpen => {
                // A cold leftover (e.g. persist-mode) blocks the exclusive
                // create. We hold Reserved, so nobody else owns it.
                self.vfs.delete(&self.journal_path, false)?;
                self.vfs.open(Some(&self.journal_path), flags)?
            }
            Err(e) => return Err(e),
        };

        self.nonce = self.prng.next_u32();
        let header = JournalHeader {
            n_rec: 0,
            nonce: self.nonce,
            orig_pages: self.db_orig_size,
            sector_size: self.fd.sector_size(),
            page_size: self.page_size,
        };
        jfd.write(&header.to_bytes(), 0)?;

        self.jfd = Some(jfd);
        self.journal_offset = JOURNAL_HEADER_SIZE as DbOffset;
        self.n_rec = 0;
        self.journal_synced = self.sync_mode == SyncMode::Off;
        Ok(())
    }

    /// Append one pre-image record for `pgno`.
    fn journal_page(&mut self, pgno: Pgno, frame: FrameId) -> Result<()> {
        let checksum = journal_checksum(self.nonce, pgno, &self.cache.frame(frame).data);

        let jfd = self
            .jfd
            .as_mut()
            .ok_or_else(|| Error::new(ErrorCode::Misuse))?;

        let mut offset = self.journal_offset;
        jfd.write(&pgno.to_be_bytes(), offset)?;
        offset += 4;
        jfd.write(&self.cache.frame(frame).data, offset)?;
        offset += self.page_size as DbOffset;
        jfd.write(&checksum.to_be_bytes(), offset)?;
        offset += 4;

        self.journal_offset = offset;
        self.n_rec += 1;
        if self.sync_mode != SyncMode::Off {
            self.journal_synced = false;
        }

        if let Some(bv) = self.in_journal.as_mut() {
            bv.set(pgno)?;
        }
        self.cache
            .frame_mut(frame)
            .flags
            .insert(FrameFlags::NEED_SYNC);
        Ok(())
    }

    /// Bring the journal header up to date and fsync. After this the
    /// recorded pre-images survive power loss.
    fn sync_journal(&mut self) -> Result<()> {
        if self.journal_mode == JournalMode::Off || self.jfd.is_none() {
            self.journal_synced = true;
            return Ok(());
        }
        let header = JournalHeader {
            n_rec: self.n_rec,
            nonce: self.nonce,
            orig_pages: self.db_orig_size,
            sector_size: self.fd.sector_size(),
            page_size: self.page_size,
        };
        let sync_mode = self.sync_mode;
        let jfd = self.jfd.as_mut().unwrap();
        jfd.write(&header.to_bytes(), 0)?;
        if sync_mode != SyncMode::Off {
            jfd.sync(SyncFlags::NORMAL)?;
        }
        self.journal_synced = true;
        for (_, frame) in self.cache.dirty_pages() {
            self.cache
                .frame_mut(frame)
                .flags
                .remove(FrameFlags::NEED_SYNC);
        }
        Ok(())
    }

    /// Dispose of the finished journal according to the journal mode.
    fn end_journal(&mut self) -> Result<()> {
        match self.journal_mode {
            JournalMode::Delete => {
                // Zeroing the header first moves the commit point to this
                // write: a crash between it and the unlink leaves a cold
                // journal that recovery discards instead of playing back.
                if let Some(jfd) = self.jfd.as_mut() {
                    let zeros = [0u8; JOURNAL_HEADER_SIZE];
                    jfd.write(&zeros, 0)?;
                }
                self.jfd = None;
                self.vfs
                    .delete(&self.journal_path, self.sync_mode == SyncMode::Full)?;
            }
            JournalMode::Truncate => {
                if let Some(jfd) = self.jfd.as_mut() {
                    jfd.truncate(0)?;
                    if self.sync_mode != SyncMode::Off {
                        jfd.sync(SyncFlags::NORMAL)?;
                    }
                }
                self.jfd = None;
            }
            JournalMode::Persist => {
                if let Some(jfd) = self.jfd.as_mut() {
                    let zeros = [0u8; JOURNAL_HEADER_SIZE];
                    jfd.write(&zeros, 0)?;
                    if self.sync_mode != SyncMode::Off {
                        jfd.sync(SyncFlags::NORMAL)?;
                    }
                }
                self.jfd = None;
            }
            JournalMode::Off => {}
        }
        self.journal_offset = 0;
        self.n_rec = 0;
        self.in_journal = None;
        self.journal_synced = true;
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a write transaction: Reserved lock, fresh journal, dirty
    /// state reset. A pager in the error state resolves the poisoned
    /// transaction here first. On a Busy conflict every lock is released
    /// again so the holder can finish.
    pub fn begin(&mut self) -> Result<()> {
        if self.state == PagerState::Error {
            self.recover_from_error()?;
        }
        if self.in_transaction() {
            return Ok(());
        }
        if self.read_only {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        self.shared_lock()?;

        if let Err(e) = self.reserved_lock_with_retry() {
            self.release_read_lock();
            return Err(e);
        }

        self.db_orig_size = self.db_size;
        self.in_journal = Some(Bitvec::new(self.db_orig_size.max(1)));
        self.db_file_modified = false;

        if let Err(e) = self.open_journal() {
            self.in_journal = None;
            let _ = self.unlock_to(LockLevel::Shared);
            self.release_read_lock();
            return Err(e);
        }

        self.state = PagerState::Writer;
        Ok(())
    }

    /// Commit: journal durable, exclusive lock, dirty pages swept to the
    /// file in page order, file durable, journal dropped, locks released.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(code) = self.err_code {
            return Err(Error::new(code));
        }
        if !self.in_transaction() {
            return Ok(());
        }

        match self.commit_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.enter_error_state(&e);
                Err(e)
            }
        }
    }

    fn commit_inner(&mut self) -> Result<()> {
        let must_shrink = self.db_size < self.db_file_size;

        if self.cache.dirty_pages().is_empty() && !must_shrink && !self.db_file_modified {
            // Nothing changed: drop the journal and the write lock
            self.end_journal()?;
            self.end_transaction_locks();
            return Ok(());
        }

        // Bump the change counter so other connections notice the commit.
        // The counter lives on page 1, which goes through the normal
        // journalled write path like any other page.
        if self.db_orig_size >= 1 {
            let counter = self.change_counter.wrapping_add(1);
            let p1 = self.get(1)?;
            let rc = self.write(&p1);
            if rc.is_ok() {
                self.page_data_mut(&p1)
                    [DB_HDR_CHANGE_COUNTER_OFFSET..DB_HDR_CHANGE_COUNTER_OFFSET + 4]
                    .copy_from_slice(&counter.to_be_bytes());
            }
            self.unref(p1);
            rc?;
            self.change_counter = counter;
        }

        self.sync_journal()?;

        self.lock_with_retry(LockLevel::Exclusive)?;
        self.state = PagerState::WriterLocked;

        for (pgno, frame) in self.cache.dirty_pages() {
            self.write_page_to_db(frame, pgno)?;
        }

        if self.db_size < self.db_file_size {
            self.fd
                .truncate(self.db_size as DbOffset * self.page_size as DbOffset)?;
            self.db_file_size = self.db_size;
        }

        if self.sync_mode != SyncMode::Off {
            self.fd.sync(if self.sync_mode == SyncMode::Full {
                SyncFlags::FULL
            } else {
                SyncFlags::NORMAL
            })?;
        }

        // The commit point: dropping the journal makes the new state the
        // only state.
        self.end_journal()?;

        self.cache.clean_all();
        self.db_orig_size = self.db_size;
        self.db_file_modified = false;

        self.state = PagerState::Reader;
        self.end_transaction_locks();
        Ok(())
    }

    /// Roll the active transaction back and discard all in-memory
    /// changes. When the main file was never touched, dropping the dirty
    /// frames is enough; otherwise the journal restores the pre-images.
    pub fn rollback(&mut self) -> Result<()> {
        if self.state == PagerState::Error {
            return self.recover_from_error();
        }
        if !self.in_transaction() {
            return Ok(());
        }

        let mut rc = Ok(());
        if self.db_file_modified && self.jfd.is_some() && self.n_rec > 0 {
            rc = self
                .lock_with_retry(LockLevel::Exclusive)
                .and_then(|()| self.playback_own_journal());
        }

        // Whatever was not restored from the journal is simply dropped:
        // the disk copies of unspilled pages are their own pre-images.
        for (_, frame) in self.cache.dirty_pages() {
            if self.cache.frame(frame).n_ref == 0 {
                self.cache.evict(frame);
            } else {
                debug_assert!(false, "dirty page pinned across rollback");
            }
        }
        // Pages appended during the transaction vanish with it
        self.cache.truncate(self.db_orig_size + 1);
        self.cache.clean_all();
        self.db_size = self.db_orig_size;
        self.db_file_modified = false;

        let rc2 = self.end_journal();
        self.err_code = None;
        self.state = PagerState::Reader;
        self.end_transaction_locks();

        rc.and(rc2)
    }

    /// Shrink the logical page count to `n`. Pages being dropped that
    /// predate the transaction are journalled first so rollback can grow
    /// the file back.
    pub fn truncate(&mut self, n: Pgno) -> Result<()> {
        if !self.in_transaction() {
            return Err(Error::new(ErrorCode::Misuse));
        }
        if n >= self.db_size {
            return Ok(());
        }

        for pgno in (n + 1)..=self.db_size {
            if pgno <= self.db_orig_size
                && self.journal_mode != JournalMode::Off
                && !self
                    .in_journal
                    .as_ref()
                    .map(|bv| bv.test(pgno))
                    .unwrap_or(false)
            {
                let page = self.get(pgno)?;
                let rc = self.journal_page(pgno, page.frame);
                self.unref(page);
                rc?;
            }
        }

        self.cache.truncate(n + 1);
        self.db_size = n;
        Ok(())
    }

    // ========================================================================
    // Playback and recovery
    // ========================================================================

    fn write_page_to_db(&mut self, frame: FrameId, pgno: Pgno) -> Result<()> {
        let offset = (pgno as DbOffset - 1) * self.page_size as DbOffset;
        if let Some(codec) = &self.codec {
            let mut encoded = self.cache.frame(frame).data.clone();
            codec.encode(&mut encoded, pgno);
            self.fd.write(&encoded, offset)?;
        } else {
            // The buffer is moved out for the call because frame data and
            // the file handle live behind the same struct
            let data = std::mem::take(&mut self.cache.frame_mut(frame).data);
            let rc = self.fd.write(&data, offset);
            self.cache.frame_mut(frame).data = data;
            rc?;
        }
        self.stats.n_write += 1;
        self.db_file_modified = true;
        if pgno > self.db_file_size {
            self.db_file_size = pgno;
        }
        Ok(())
    }

    /// Replay our own journal during rollback. The in-memory record count
    /// is authoritative; the on-disk header may still say zero.
    fn playback_own_journal(&mut self) -> Result<()> {
        let n_rec = self.n_rec;
        let nonce = self.nonce;
        let orig = self.db_orig_size;
        self.playback(n_rec, nonce, self.page_size, orig, false)
    }

    /// Validate and replay a journal left behind by a crashed process.
    /// Caller holds the exclusive lock.
    fn playback_hot_journal(&mut self) -> Result<()> {
        let mut jfd = self.vfs.open(
            Some(&self.journal_path),
            OpenFlags::READWRITE | OpenFlags::MAIN_JOURNAL,
        )?;
        let jsize = jfd.file_size()?;

        let mut hdr_buf = [0u8; JOURNAL_HEADER_SIZE];
        let n = jfd.read(&mut hdr_buf, 0)?;

        let header = if n < JOURNAL_HEADER_SIZE {
            None
        } else {
            JournalHeader::from_bytes(&hdr_buf)
        };

        let header = match header {
            Some(h)
                if h.page_size.is_power_of_two()
                    && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&h.page_size) =>
            {
                h
            }
            _ => {
                // Missing or torn header: the transaction never reached
                // its durable point, so the main file is already correct.
                log::warn!(
                    "journal {} has no valid header; discarding",
                    self.journal_path
                );
                drop(jfd);
                self.vfs.delete(&self.journal_path, false)?;
                return Ok(());
            }
        };

        // A crash can leave the header's record count stale at zero while
        // records follow it; size the replay by the file instead.
        let record_size = 4 + header.page_size as DbOffset + 4;
        let mut n_rec = header.n_rec;
        if n_rec == 0 {
            n_rec = ((jsize - JOURNAL_HEADER_SIZE as DbOffset).max(0) / record_size) as u32;
        }

        log::warn!(
            "recovering {} record(s) from hot journal {}",
            n_rec,
            self.journal_path
        );

        self.jfd = Some(jfd);
        let rc = self.playback(n_rec, header.nonce, header.page_size, header.orig_pages, true);
        self.jfd = None;

        self.vfs.delete(&self.journal_path, false)?;
        if rc.is_ok() {
            log::info!("journal recovery of {} complete", self.db_path);
        }
        rc
    }

    /// Restore pre-images from the open journal. Stops quietly at the
    /// first record whose checksum fails: everything at and after it
    /// postdates the last durable point.
    fn playback(
        &mut self,
        n_rec: u32,
        nonce: u32,
        page_size: u32,
        orig_pages: Pgno,
        is_hot: bool,
    ) -> Result<()> {
        let record_size = 4 + page_size as DbOffset + 4;
        let mut page_buf = vec![0u8; page_size as usize];

        for i in 0..n_rec {
            let base = JOURNAL_HEADER_SIZE as DbOffset + i as DbOffset * record_size;

            let (pgno, checksum) = {
                let jfd = self
                    .jfd
                    .as_mut()
                    .ok_or_else(|| Error::new(ErrorCode::Misuse))?;
                let mut word = [0u8; 4];
                if jfd.read(&mut word, base)? < 4 {
                    break;
                }
                let pgno = Pgno::from_be_bytes(word);
                if jfd.read(&mut page_buf, base + 4)? < page_size as usize {
                    break;
                }
                let mut ck = [0u8; 4];
                if jfd.read(&mut ck, base + 4 + page_size as DbOffset)? < 4 {
                    break;
                }
                (pgno, u32::from_be_bytes(ck))
            };

            if pgno == 0 {
                // End-of-journal sentinel
                break;
            }
            if journal_checksum(nonce, pgno, &page_buf) != checksum {
                if is_hot {
                    log::warn!(
                        "journal record {} (page {}) fails its checksum; playback stops",
                        i,
                        pgno
                    );
                }
                break;
            }

            // Restore to the main file and to any cached frame
            let offset = (pgno as DbOffset - 1) * page_size as DbOffset;
            if let Some(codec) = &self.codec {
                let mut encoded = page_buf.clone();
                codec.encode(&mut encoded, pgno);
                self.fd.write(&encoded, offset)?;
            } else {
                self.fd.write(&page_buf, offset)?;
            }
            if pgno > self.db_file_size {
                self.db_file_size = pgno;
            }
            if let Some(frame) = self.cache.lookup(pgno) {
                self.cache.frame_mut(frame).data.copy_from_slice(&page_buf);
                self.cache.make_clean(frame);
            }
        }

        // The file shrinks back to its size at transaction start
        let current_pages = (self.fd.file_size()? / page_size as DbOffset) as Pgno;
        if current_pages > orig_pages {
            self.fd
                .truncate(orig_pages as DbOffset * page_size as DbOffset)?;
        }
        self.db_file_size = orig_pages;
        self.db_size = orig_pages;
        self.change_counter = self.read_change_counter()?;

        if self.sync_mode != SyncMode::Off {
            self.fd.sync(SyncFlags::NORMAL)?;
        }
        Ok(())
    }

    // ========================================================================
    // Error state
    // ========================================================================

    /// I/O failures during commit or spill leave the on-disk state
    /// ambiguous; refuse further work until the transaction resolves.
    fn enter_error_state(&mut self, error: &Error) {
        if matches!(error.code(), ErrorCode::IoErr | ErrorCode::Full) {
            log::error!("pager entering error state: {}", error);
            self.err_code = Some(error.code());
            self.state = PagerState::Error;
        }
    }

    fn recover_from_error(&mut self) -> Result<()> {
        log::warn!("resolving failed transaction on {}", self.db_path);
        self.err_code = None;
        self.state = PagerState::Writer;
        self.rollback()
    }
}

// ============================================================================
// Tests
// ============================================================================
