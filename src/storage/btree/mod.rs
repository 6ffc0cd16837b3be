//! B-tree
//!
//! Ordered key/payload storage over the pager. Two tree flavors share the
//! machinery: table trees are keyed by 64-bit rowids and store row
//! payloads on their leaves; index trees store encoded key records on
//! every level and no separate payload.
//!
//! Pages use a slot-array layout: a fixed header, a growing array of
//! two-byte cell offsets, and cell bodies allocated downward from the end
//! of the usable area. Deleted cells join an in-page freeblock list;
//! compaction happens only when a fitting allocation fails despite enough
//! aggregate free space.
//!
//! Cursors are registered with the tree and addressed by index; any
//! structural change invalidates the other cursors, which re-seek from a
//! saved copy of their key before the next use.

pub mod encoding;
pub mod types;

use std::sync::Arc;

use crate::config::{DbConfig, InterruptFlag, TempStore};
use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::Vfs;
use crate::storage::pager::{JournalMode, PageRef, Pager};
use crate::storage::record::KeyInfo;
use crate::types::{Pgno, RowId};

use encoding::{get_varint, put_varint, read_u16, read_u32, write_u16, write_u32};
use types::*;

// ============================================================================
// Cell info
// ============================================================================

/// Decoded summary of one cell.
#[derive(Debug, Clone, Default)]
pub struct CellInfo {
    /// Left child pointer (interior cells only)
    pub child: Pgno,
    /// Integer key (table trees)
    pub rowid: RowId,
    /// Total payload length, local plus overflow
    pub payload_len: u32,
    /// Bytes of payload stored in the cell itself
    pub local_len: u32,
    /// Offset of the local payload within the page
    pub payload_offset: usize,
    /// First overflow page, or zero
    pub overflow: Pgno,
    /// Total size of the cell within the page
    pub size: u16,
}

/// Local/overflow split for a payload of `payload_len` bytes.
fn local_payload_len(limits: PageLimits, table_leaf: bool, payload_len: u32) -> (u32, bool) {
    let max_local = limits.max_local(table_leaf);
    if payload_len <= max_local {
        return (payload_len, false);
    }
    let min_local = limits.min_local();
    let surplus = min_local + (payload_len - min_local) % limits.overflow_capacity();
    if surplus <= max_local {
        (surplus, true)
    } else {
        (min_local, true)
    }
}

// ============================================================================
// MemPage
// ============================================================================

/// One B-tree page, parsed from and serialized back to its byte image.
pub struct MemPage {
    pub pgno: Pgno,
    pub data: Vec<u8>,
    pub flags: u8,
    pub is_leaf: bool,
    pub is_intkey: bool,
    pub n_cell: u16,
    limits: PageLimits,
}

impl MemPage {
    /// Parse a page image, validating the kind tag and cell bounds.
    pub fn parse(pgno: Pgno, data: Vec<u8>, limits: PageLimits) -> Result<Self> {
        let hdr = limits.header_offset;
        if data.len() < hdr + PAGE_HEADER_SIZE_LEAF {
            return Err(corrupt_page(pgno, "page shorter than its header"));
        }
        let flags = data[hdr + PAGE_HDR_FLAGS];
        if !matches!(
            flags,
            PTF_TABLE_LEAF | PTF_TABLE_INTERIOR | PTF_INDEX_LEAF | PTF_INDEX_INTERIOR
        ) {
            return Err(corrupt_page(
                pgno,
                &format!("unknown page tag 0x{}", hex::encode([flags])),
            ));
        }

        let is_leaf = flags & PTF_LEAF != 0;
        let is_intkey = flags & PTF_INTKEY != 0;
        let n_cell = read_u16(&data, hdr + PAGE_HDR_NCELL)
            .ok_or_else(|| corrupt_page(pgno, "truncated header"))?;

        let page = Self {
            pgno,
            data,
            flags,
            is_leaf,
            is_intkey,
            n_cell,
            limits,
        };

        let usable = limits.usable_size as usize;
        if page.cell_ptr_end() > usable || page.content_start() > usable {
            return Err(corrupt_page(pgno, "cell pointers overflow the page"));
        }
        Ok(page)
    }

    /// Fresh empty page of the given kind.
    pub fn zeroed(pgno: Pgno, flags: u8, limits: PageLimits) -> Self {
        let mut data = vec![0u8; limits.page_size as usize];
        let hdr = limits.header_offset;
        data[hdr + PAGE_HDR_FLAGS] = flags;
        let content = limits.usable_size;
        let encoded = if content == 65536 { 0u16 } else { content as u16 };
        let _ = write_u16(&mut data, hdr + PAGE_HDR_CONTENT_START, encoded);
        Self {
            pgno,
            data,
            flags,
            is_leaf: flags & PTF_LEAF != 0,
            is_intkey: flags & PTF_INTKEY != 0,
            n_cell: 0,
            limits,
        }
    }

    pub fn limits(&self) -> PageLimits {
        self.limits
    }

    pub fn header_size(&self) -> usize {
        if self.is_leaf {
            PAGE_HEADER_SIZE_LEAF
        } else {
            PAGE_HEADER_SIZE_INTERIOR
        }
    }

    fn hdr(&self) -> usize {
        self.limits.header_offset
    }

    fn cell_ptr_start(&self) -> usize {
        self.hdr() + self.header_size()
    }

    fn cell_ptr_end(&self) -> usize {
        self.cell_ptr_start() + self.n_cell as usize * CELL_PTR_SIZE
    }

    /// Start of the cell content area.
    pub fn content_start(&self) -> usize {
        let raw = read_u16(&self.data, self.hdr() + PAGE_HDR_CONTENT_START).unwrap_or(0);
        if raw == 0 && self.limits.usable_size == 65536 {
            65536
        } else {
            raw as usize
        }
    }

    fn set_content_start(&mut self, value: usize) {
        let encoded = if value == 65536 { 0u16 } else { value as u16 };
        let off = self.hdr() + PAGE_HDR_CONTENT_START;
        let _ = write_u16(&mut self.data, off, encoded);
    }

    fn freeblock_head(&self) -> usize {
        read_u16(&self.data, self.hdr() + PAGE_HDR_FREEBLOCK).unwrap_or(0) as usize
    }

    fn set_freeblock_head(&mut self, value: usize) {
        let off = self.hdr() + PAGE_HDR_FREEBLOCK;
        let _ = write_u16(&mut self.data, off, value as u16);
    }

    fn frag_bytes(&self) -> usize {
        self.data[self.hdr() + PAGE_HDR_FRAG_BYTES] as usize
    }

    fn set_frag_bytes(&mut self, value: usize) {
        let off = self.hdr() + PAGE_HDR_FRAG_BYTES;
        self.data[off] = value as u8;
    }

    fn set_n_cell(&mut self, n: u16) {
        self.n_cell = n;
        let off = self.hdr() + PAGE_HDR_NCELL;
        let _ = write_u16(&mut self.data, off, n);
    }

    /// Right-most child of an interior page.
    pub fn right_child(&self) -> Pgno {
        debug_assert!(!self.is_leaf);
        read_u32(&self.data, self.hdr() + PAGE_HDR_RIGHT_CHILD).unwrap_or(0)
    }

    pub fn set_right_child(&mut self, pgno: Pgno) {
        debug_assert!(!self.is_leaf);
        let off = self.hdr() + PAGE_HDR_RIGHT_CHILD;
        let _ = write_u32(&mut self.data, off, pgno);
    }

    /// Offset of cell `i` within the page.
    pub fn cell_ptr(&self, i: u16) -> Result<usize> {
        if i >= self.n_cell {
            return Err(corrupt_page(self.pgno, "cell index out of range"));
        }
        let off = self.cell_ptr_start() + i as usize * CELL_PTR_SIZE;
        let ptr = read_u16(&self.data, off).ok_or_else(|| corrupt_page(self.pgno, "bad ptr"))?;
        let ptr = ptr as usize;
        if ptr < self.cell_ptr_end() || ptr >= self.limits.usable_size as usize {
            return Err(corrupt_page(self.pgno, "cell offset outside content area"));
        }
        Ok(ptr)
    }

    fn set_cell_ptr(&mut self, i: u16, value: usize) {
        let off = self.cell_ptr_start() + i as usize * CELL_PTR_SIZE;
        let _ = write_u16(&mut self.data, off, value as u16);
    }

    /// Decode the cell at slot `i`.
    pub fn cell(&self, i: u16) -> Result<CellInfo> {
        let offset = self.cell_ptr(i)?;
        self.cell_at(offset)
    }

    /// Decode a cell by page offset.
    pub fn cell_at(&self, offset: usize) -> Result<CellInfo> {
        let data = &self.data;
        let mut pos = offset;
        let mut info = CellInfo::default();

        if !self.is_leaf {
            info.child = read_u32(data, pos).ok_or_else(|| corrupt_page(self.pgno, "cell child"))?;
            pos += 4;
        }

        if self.is_intkey {
            if self.is_leaf {
                let (len, n) = get_varint(data, pos)?;
                info.payload_len = len as u32;
                pos += n;
                let (key, n) = get_varint(data, pos)?;
                info.rowid = key as i64;
                pos += n;
            } else {
                // Table interior cells carry the key only
                let (key, n) = get_varint(data, pos)?;
                info.rowid = key as i64;
                pos += n;
                info.size = (pos - offset) as u16;
                return Ok(info);
            }
        } else {
            let (len, n) = get_varint(data, pos)?;
            info.payload_len = len as u32;
            pos += n;
        }

        let (local, has_overflow) = local_payload_len(
            self.limits,
            self.is_intkey && self.is_leaf,
            info.payload_len,
        );
        info.local_len = local;
        info.payload_offset = pos;
        pos += local as usize;
        if has_overflow {
            info.overflow =
                read_u32(data, pos).ok_or_else(|| corrupt_page(self.pgno, "overflow ptr"))?;
            pos += 4;
        }
        if pos > self.limits.usable_size as usize {
            return Err(corrupt_page(self.pgno, "cell spills past usable area"));
        }
        info.size = (pos - offset) as u16;
        Ok(info)
    }

    /// Local payload slice of a decoded cell.
    pub fn local_payload(&self, info: &CellInfo) -> &[u8] {
        &self.data[info.payload_offset..info.payload_offset + info.local_len as usize]
    }

    /// Raw bytes of cell `i`.
    pub fn cell_bytes(&self, i: u16) -> Result<Vec<u8>> {
        let off = self.cell_ptr(i)?;
        let info = self.cell_at(off)?;
        Ok(self.data[off..off + info.size as usize].to_vec())
    }

    // ------------------------------------------------------------------
    // Free space accounting
    // ------------------------------------------------------------------

    fn gap(&self) -> usize {
        self.content_start().saturating_sub(self.cell_ptr_end())
    }

    /// Total free bytes: the gap, the freeblock list, and fragments.
    pub fn free_total(&self) -> usize {
        let mut total = self.gap() + self.frag_bytes();
        let mut block = self.freeblock_head();
        let mut guard = 0;
        while block != 0 && guard < self.limits.usable_size {
            total += read_u16(&self.data, block + 2).unwrap_or(0) as usize;
            block = read_u16(&self.data, block).unwrap_or(0) as usize;
            guard += 1;
        }
        total
    }

    /// Bytes available to cells and their pointers.
    pub fn cell_area(&self) -> usize {
        self.limits.usable_size as usize - self.hdr() - self.header_size()
    }

    /// Below one third of the cell budget; candidate for balancing.
    pub fn is_underfull(&self) -> bool {
        let area = self.cell_area();
        (area - self.free_total()) * (MIN_FILL_DIVISOR as usize) < area
    }

    // ------------------------------------------------------------------
    // Space allocation
    // ------------------------------------------------------------------

    /// Take a block from the freeblock list, first fit.
    fn take_freeblock(&mut self, size: usize) -> Option<usize> {
        let mut prev = 0usize;
        let mut block = self.freeblock_head();
        let mut guard = 0u32;
        while block != 0 && guard < 65536 {
            let next = read_u16(&self.data, block).unwrap_or(0) as usize;
            let bsize = read_u16(&self.data, block + 2).unwrap_or(0) as usize;
            if bsize >= size {
                let remainder = bsize - size;
                if remainder >= 4 {
                    // Keep the head of the block free, allocate the tail
                    let _ = write_u16(&mut self.data, block + 2, remainder as u16);
                    return Some(block + remainder);
                }
                // Swallow the whole block; sub-4-byte leftovers fragment
                if prev == 0 {
                    self.set_freeblock_head(next);
                } else {
                    let _ = write_u16(&mut self.data, prev, next as u16);
                }
                self.set_frag_bytes(self.frag_bytes() + remainder);
                return Some(block);
            }
            prev = block;
            block = next;
            guard += 1;
        }
        None
    }

    /// Allocate `size` bytes of cell content, compacting if the gap is
    /// fragmented away. `None` when the page genuinely cannot hold it.
    fn allocate_space(&mut self, size: usize) -> Option<usize> {
        // Room for the new cell pointer itself comes first
        if self.gap() < CELL_PTR_SIZE {
            self.defragment().ok()?;
        }
        if let Some(off) = self.take_freeblock(size) {
            return Some(off);
        }
        if self.gap() < size + CELL_PTR_SIZE {
            self.defragment().ok()?;
        }
        if self.gap() < size + CELL_PTR_SIZE {
            return None;
        }
        let new_start = self.content_start() - size;
        self.set_content_start(new_start);
        Some(new_start)
    }

    /// Return a cell body to the free list, coalescing neighbors.
    fn free_space(&mut self, start: usize, size: usize) {
        if size < 4 {
            self.set_frag_bytes(self.frag_bytes() + size);
            return;
        }

        let mut start = start;
        let mut size = size;

        // Find the blocks around `start` in the address-ordered list
        let mut prev = 0usize;
        let mut cur = self.freeblock_head();
        while cur != 0 && cur < start {
            prev = cur;
            cur = read_u16(&self.data, cur).unwrap_or(0) as usize;
        }

        // Coalesce with the following block
        let mut next_link = cur;
        if cur != 0 && start + size == cur {
            size += read_u16(&self.data, cur + 2).unwrap_or(0) as usize;
            next_link = read_u16(&self.data, cur).unwrap_or(0) as usize;
        }

        // Coalesce with the preceding block
        if prev != 0 {
            let prev_size = read_u16(&self.data, prev + 2).unwrap_or(0) as usize;
            if prev + prev_size == start {
                let _ = write_u16(&mut self.data, prev + 2, (prev_size + size) as u16);
                let _ = write_u16(&mut self.data, prev, next_link as u16);
                self.absorb_gap_blocks();
                return;
            }
        }

        let _ = write_u16(&mut self.data, start, next_link as u16);
        let _ = write_u16(&mut self.data, start + 2, size as u16);
        if prev == 0 {
            self.set_freeblock_head(start);
        } else {
            let _ = write_u16(&mut self.data, prev, start as u16);
        }
        self.absorb_gap_blocks();
    }

    /// Fold freeblocks that touch the content-area boundary back into the
    /// gap.
    fn absorb_gap_blocks(&mut self) {
        loop {
            let head = self.freeblock_head();
            if head == 0 || head != self.content_start() {
                return;
            }
            let next = read_u16(&self.data, head).unwrap_or(0) as usize;
            let size = read_u16(&self.data, head + 2).unwrap_or(0) as usize;
            self.set_content_start(head + size);
            self.set_freeblock_head(next);
        }
    }

    /// Rewrite all cells contiguously at the top of the page.
    pub fn defragment(&mut self) -> Result<()> {
        let mut cells = Vec::with_capacity(self.n_cell as usize);
        for i in 0..self.n_cell {
            let off = self.cell_ptr(i)?;
            let info = self.cell_at(off)?;
            cells.push((off, info.size as usize));
        }

        let snapshot = self.data.clone();
        let mut top = self.limits.usable_size as usize;
        for (i, (off, size)) in cells.iter().enumerate() {
            top -= size;
            self.data[top..top + size].copy_from_slice(&snapshot[*off..*off + *size]);
            self.set_cell_ptr(i as u16, top);
        }
        self.set_content_start(top);
        self.set_freeblock_head(0);
        self.set_frag_bytes(0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cell insertion / removal
    // ------------------------------------------------------------------

    /// Insert a prebuilt cell at slot `idx`. `Ok(false)` when the page is
    /// full and must split.
    pub fn insert_cell(&mut self, idx: u16, cell: &[u8]) -> Result<bool> {
        debug_assert!(idx <= self.n_cell);
        if self.free_total() < cell.len() + CELL_PTR_SIZE {
            return Ok(false);
        }
        let off = match self.allocate_space(cell.len()) {
            Some(o) => o,
            None => return Ok(false),
        };
        self.data[off..off + cell.len()].copy_from_slice(cell);

        // Shift the pointer array right to open slot `idx`
        let n = self.n_cell;
        for i in (idx..n).rev() {
            let p = self.cell_ptr(i)?;
            self.set_cell_ptr(i + 1, p);
        }
        self.set_n_cell(n + 1);
        self.set_cell_ptr(idx, off);
        Ok(true)
    }

    /// Remove the cell at slot `idx`, returning its decoded info.
    pub fn remove_cell(&mut self, idx: u16) -> Result<CellInfo> {
        let off = self.cell_ptr(idx)?;
        let info = self.cell_at(off)?;

        let n = self.n_cell;
        for i in idx + 1..n {
            let p = self.cell_ptr(i)?;
            self.set_cell_ptr(i - 1, p);
        }
        self.set_n_cell(n - 1);
        self.free_space(off, info.size as usize);
        Ok(info)
    }

    /// All cell images in slot order.
    pub fn all_cells(&self) -> Result<Vec<Vec<u8>>> {
        (0..self.n_cell).map(|i| self.cell_bytes(i)).collect()
    }

    /// Rebuild this page from scratch with the given cells.
    pub fn rebuild(&mut self, flags: u8, cells: &[Vec<u8>], right_child: Pgno) -> Result<()> {
        let fresh = MemPage::zeroed(self.pgno, flags, self.limits);
        self.data = fresh.data;
        self.flags = flags;
        self.is_leaf = flags & PTF_LEAF != 0;
        self.is_intkey = flags & PTF_INTKEY != 0;
        self.n_cell = 0;
        if !self.is_leaf {
            self.set_right_child(right_child);
        }
        for (i, cell) in cells.iter().enumerate() {
            if !self.insert_cell(i as u16, cell)? {
                return Err(corrupt_page(self.pgno, "rebuild does not fit"));
            }
        }
        Ok(())
    }
}

fn corrupt_page(pgno: Pgno, what: &str) -> Error {
    Error::with_message(ErrorCode::Corrupt, format!("page {}: {}", pgno, what))
}

impl MemPage {
    /// Child pointer `j`: cell `j`'s child for `j < n_cell`, the
    /// right-most child for `j == n_cell`.
    pub fn child_at(&self, j: u16) -> Result<Pgno> {
        if j < self.n_cell {
            Ok(self.cell(j)?.child)
        } else if j == self.n_cell {
            Ok(self.right_child())
        } else {
            Err(corrupt_page(self.pgno, "child index out of range"))
        }
    }

    fn set_child_at(&mut self, j: u16, pgno: Pgno) -> Result<()> {
        if j < self.n_cell {
            let off = self.cell_ptr(j)?;
            write_u32(&mut self.data, off, pgno)
        } else if j == self.n_cell {
            self.set_right_child(pgno);
            Ok(())
        } else {
            Err(corrupt_page(self.pgno, "child index out of range"))
        }
    }
}

/// Rowid of a table-leaf cell image.
fn leaf_cell_rowid(cell: &[u8]) -> Result<RowId> {
    let (_, n) = get_varint(cell, 0)?;
    let (rowid, _) = get_varint(cell, n)?;
    Ok(rowid as RowId)
}

/// Pick the split point of `cells` by accumulated size. With `promote`
/// the middle cell moves up to the parent and both halves must stay
/// non-empty around it.
fn partition_point(cells: &[Vec<u8>], promote: bool) -> usize {
    let total: usize = cells.iter().map(|c| c.len() + CELL_PTR_SIZE).sum();
    let mut acc = 0usize;
    let mut m = cells.len() / 2;
    for (i, c) in cells.iter().enumerate() {
        acc += c.len() + CELL_PTR_SIZE;
        if acc > total / 2 {
            m = i;
            break;
        }
    }
    let max = if promote {
        cells.len().saturating_sub(2)
    } else {
        cells.len() - 1
    };
    m.clamp(1, max.max(1))
}

// ============================================================================
// Cursors
// ============================================================================

/// Handle to a cursor in the tree's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorId(usize);

#[derive(Debug, Clone)]
enum SavedPosition {
    Rowid(RowId),
    Key(Vec<u8>),
}

struct Cursor {
    root: Pgno,
    writable: bool,
    key_info: Option<Arc<KeyInfo>>,
    pos: CursorPos,
    /// Path of (page, child index taken) from the root down to the
    /// current page, exclusive.
    stack: Vec<(Pgno, u16)>,
    /// Current page, leaf for table trees, any level for index trees
    page: Option<MemPage>,
    idx: u16,
    /// Pager pin held while the cursor is valid
    pin: Option<PageRef>,
    saved: Option<SavedPosition>,
    skip_next: bool,
    skip_prev: bool,
}

impl Cursor {
    fn is_index(&self) -> bool {
        self.key_info.is_some()
    }
}

// ============================================================================
// Btree
// ============================================================================

/// One connection's B-tree layer over one database file.
pub struct Btree {
    pager: Pager,
    header: DbHeader,
    trans: TransState,
    cursors: Vec<Option<Cursor>>,
    interrupt: InterruptFlag,
    text_encoding: crate::config::TextEncoding,
}

impl Btree {
    // ========================================================================
    // Open / close
    // ========================================================================

    /// Open (or create) a database file through the given adapter.
    pub fn open(vfs: Arc<dyn Vfs>, path: &str, config: &DbConfig) -> Result<Self> {
        let mut pager = Pager::open(vfs, path, config)?;

        let header = if pager.page_count() >= 1 {
            // An existing file's encoding wins; the configured one only
            // applies at creation time.
            let page = pager.get(1)?;
            let parsed = DbHeader::parse(pager.page_data(&page));
            pager.unref(page);
            parsed?
        } else {
            DbHeader::new(
                pager.page_size(),
                pager.reserved_bytes(),
                config.text_encoding,
            )
        };

        Ok(Self {
            pager,
            header,
            trans: TransState::None,
            cursors: Vec::new(),
            interrupt: InterruptFlag::new(),
            text_encoding: config.text_encoding,
        })
    }

    /// Open a throwaway tree for temporary use. Journaling is off: a
    /// temp tree that dies in a crash was disposable anyway.
    pub fn open_temp(config: &DbConfig) -> Result<Self> {
        let vfs: Arc<dyn Vfs> = match config.temp_store {
            TempStore::Memory => Arc::new(crate::os::mem::MemVfs::new()),
            TempStore::File => crate::config::Context::global().vfs().clone(),
        };
        let mut prng = crate::random::Prng::new();
        let path = match config.temp_store {
            TempStore::Memory => "temp.db".to_string(),
            TempStore::File => format!("/tmp/strata_temp_{:016x}.db", prng.next_u64()),
        };
        let mut tree = Self::open(vfs, &path, config)?;
        tree.pager.set_journal_mode(JournalMode::Off);
        Ok(tree)
    }

    /// Close the tree, its cursors, and the pager underneath.
    pub fn close(mut self) -> Result<()> {
        for i in 0..self.cursors.len() {
            if let Some(mut cur) = self.cursors[i].take() {
                if let Some(pin) = cur.pin.take() {
                    self.pager.unref(pin);
                }
            }
        }
        if self.trans == TransState::Write {
            let _ = self.pager.rollback();
        }
        self.pager.close()
    }

    /// Handle for asynchronous cancellation of long operations.
    pub fn interrupt_handle(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn page_count(&self) -> Pgno {
        self.pager.page_count()
    }

    pub fn txn_state(&self) -> TransState {
        self.trans
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a read or write transaction. A write transaction on an
    /// empty file creates the database.
    pub fn begin_trans(&mut self, write: bool) -> Result<()> {
        if write {
            if self.trans == TransState::Write {
                return Ok(());
            }
            self.pager.begin()?;
            if self.pager.page_count() == 0 {
                self.new_db()?;
            } else {
                self.refresh_header()?;
            }
            self.trans = TransState::Write;
        } else {
            if self.trans != TransState::None {
                return Ok(());
            }
            if self.pager.page_count() >= 1 {
                self.refresh_header()?;
            }
            self.trans = TransState::Read;
        }
        Ok(())
    }

    /// Commit the active transaction. Cursors survive but must re-seek.
    pub fn commit(&mut self) -> Result<()> {
        self.save_all_cursors(usize::MAX)?;
        self.pager.commit()?;
        self.trans = TransState::None;
        Ok(())
    }

    /// Abandon the active transaction. Cursors become invalid.
    pub fn rollback(&mut self) -> Result<()> {
        for i in 0..self.cursors.len() {
            if let Some(cur) = self.cursors[i].as_mut() {
                cur.pos = CursorPos::Invalid;
                cur.saved = None;
                cur.page = None;
                cur.stack.clear();
                if let Some(pin) = cur.pin.take() {
                    self.pager.unref(pin);
                }
            }
        }
        self.pager.rollback()?;
        self.trans = TransState::None;
        if self.pager.page_count() >= 1 {
            self.refresh_header()?;
        }
        Ok(())
    }

    fn refresh_header(&mut self) -> Result<()> {
        let page = self.pager.get(1)?;
        let parsed = DbHeader::parse(self.pager.page_data(&page));
        self.pager.unref(page);
        self.header = parsed?;
        Ok(())
    }

    fn require_write_txn(&self) -> Result<()> {
        if self.trans != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "operation requires a write transaction",
            ));
        }
        Ok(())
    }

    /// Initialize page 1 of a fresh database: the file header followed by
    /// an empty table-leaf root for the schema table.
    fn new_db(&mut self) -> Result<()> {
        let header = DbHeader::new(
            self.pager.page_size(),
            self.pager.reserved_bytes(),
            self.text_encoding,
        );
        let mut page1 = MemPage::zeroed(1, PTF_TABLE_LEAF, self.limits_for(1));
        header.write(&mut page1.data)?;
        self.header = header;
        self.write_mempage(&page1)
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Read a header field as cached at transaction start.
    pub fn get_meta(&self, field: MetaField) -> u32 {
        match field {
            MetaField::SchemaCookie => self.header.schema_cookie,
            MetaField::UserCookie => self.header.user_cookie,
            MetaField::FreelistTrunk => self.header.freelist_trunk,
            MetaField::FreelistCount => self.header.freelist_count,
            MetaField::PageCount => self.header.page_count,
        }
    }

    /// Update a header field inside a write transaction.
    pub fn update_meta(&mut self, field: MetaField, value: u32) -> Result<()> {
        self.require_write_txn()?;
        match field {
            MetaField::SchemaCookie => self.header.schema_cookie = value,
            MetaField::UserCookie => self.header.user_cookie = value,
            MetaField::FreelistTrunk => self.header.freelist_trunk = value,
            MetaField::FreelistCount => self.header.freelist_count = value,
            MetaField::PageCount => self.header.page_count = value,
        }
        self.write_header()
    }

    /// Compare the schema cookie on disk against the value a statement
    /// was prepared with; mismatch means the statement is stale.
    pub fn check_schema_cookie(&mut self, expected: u32) -> Result<()> {
        let current = if self.pager.page_count() >= 1 {
            let page = self.pager.get(1)?;
            let parsed = DbHeader::parse(self.pager.page_data(&page));
            self.pager.unref(page);
            parsed?.schema_cookie
        } else {
            0
        };
        if current != expected {
            return Err(Error::new(ErrorCode::Schema));
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let page = self.pager.get(1)?;
        let rc = self.pager.write(&page);
        if rc.is_ok() {
            self.header.write(self.pager.page_data_mut(&page))?;
        }
        self.pager.unref(page);
        rc
    }

    // ========================================================================
    // Page I/O helpers
    // ========================================================================

    fn limits_for(&self, pgno: Pgno) -> PageLimits {
        PageLimits::for_page(self.pager.page_size(), self.pager.usable_size(), pgno)
    }

    /// Geometry for payload math; identical for every page of the file.
    fn payload_limits(&self) -> PageLimits {
        PageLimits::new(self.pager.page_size(), self.pager.usable_size())
    }

    fn read_mempage(&mut self, pgno: Pgno) -> Result<MemPage> {
        let limits = self.limits_for(pgno);
        let page = self.pager.get(pgno)?;
        let data = self.pager.page_data(&page).to_vec();
        self.pager.unref(page);
        MemPage::parse(pgno, data, limits)
    }

    fn write_mempage(&mut self, page: &MemPage) -> Result<()> {
        let handle = self.pager.get(page.pgno)?;
        let rc = self.pager.write(&handle);
        if rc.is_ok() {
            self.pager
                .page_data_mut(&handle)
                .copy_from_slice(&page.data);
            if page.pgno == 1 {
                // The cached header is authoritative: a structural change
                // to the page-1 tree must not clobber header updates made
                // while this in-memory copy was held.
                self.header.write(self.pager.page_data_mut(&handle))?;
            }
        }
        self.pager.unref(handle);
        rc
    }

    fn read_raw(&mut self, pgno: Pgno) -> Result<Vec<u8>> {
        let page = self.pager.get(pgno)?;
        let data = self.pager.page_data(&page).to_vec();
        self.pager.unref(page);
        Ok(data)
    }

    fn write_raw(&mut self, pgno: Pgno, data: &[u8]) -> Result<()> {
        let page = self.pager.get(pgno)?;
        let rc = self.pager.write(&page);
        if rc.is_ok() {
            self.pager.page_data_mut(&page)[..data.len()].copy_from_slice(data);
        }
        self.pager.unref(page);
        rc
    }

    // ========================================================================
    // Free-list and page allocation
    // ========================================================================

    fn trunk_capacity(&self) -> usize {
        (self.pager.usable_size() as usize - 8) / 4
    }

    /// Allocate a page, preferring the free-list over file growth.
    fn allocate_page(&mut self) -> Result<Pgno> {
        self.require_write_txn()?;

        if self.header.freelist_count > 0 && self.header.freelist_trunk != 0 {
            let trunk_pgno = self.header.freelist_trunk;
            let trunk = self.read_raw(trunk_pgno)?;
            let n_leaf = read_u32(&trunk, 4).unwrap_or(0);

            if n_leaf > 0 {
                let slot = 8 + (n_leaf as usize - 1) * 4;
                let leaf = read_u32(&trunk, slot)
                    .ok_or_else(|| corrupt_page(trunk_pgno, "truncated free-list trunk"))?;
                if leaf < 2 || leaf > self.header.page_count {
                    return Err(corrupt_page(trunk_pgno, "free-list entry out of range"));
                }
                let mut updated = trunk;
                write_u32(&mut updated, 4, n_leaf - 1)?;
                self.write_raw(trunk_pgno, &updated)?;
                self.header.freelist_count -= 1;
                self.write_header()?;
                return Ok(leaf);
            }

            // The trunk itself becomes the allocated page
            let next = read_u32(&trunk, 0).unwrap_or(0);
            self.header.freelist_trunk = next;
            self.header.freelist_count -= 1;
            self.write_header()?;
            return Ok(trunk_pgno);
        }

        let pgno = self.header.page_count + 1;
        self.header.page_count = pgno;
        self.write_header()?;
        Ok(pgno)
    }

    /// Push a page onto the free-list.
    fn free_page(&mut self, pgno: Pgno) -> Result<()> {
        self.require_write_txn()?;
        if pgno < 2 || pgno > self.header.page_count {
            return Err(corrupt_page(pgno, "freeing a page outside the file"));
        }

        if self.header.freelist_trunk == 0 {
            let mut trunk = vec![0u8; self.pager.page_size() as usize];
            write_u32(&mut trunk, 0, 0)?;
            write_u32(&mut trunk, 4, 0)?;
            self.write_raw(pgno, &trunk)?;
            self.header.freelist_trunk = pgno;
            self.header.freelist_count += 1;
            return self.write_header();
        }

        let trunk_pgno = self.header.freelist_trunk;
        let trunk = self.read_raw(trunk_pgno)?;
        let n_leaf = read_u32(&trunk, 4).unwrap_or(0) as usize;

        if n_leaf < self.trunk_capacity() {
            let mut updated = trunk;
            write_u32(&mut updated, 8 + n_leaf * 4, pgno)?;
            write_u32(&mut updated, 4, n_leaf as u32 + 1)?;
            self.write_raw(trunk_pgno, &updated)?;
        } else {
            // Current trunk is full: the freed page starts a new trunk
            let mut new_trunk = vec![0u8; self.pager.page_size() as usize];
            write_u32(&mut new_trunk, 0, trunk_pgno)?;
            write_u32(&mut new_trunk, 4, 0)?;
            self.write_raw(pgno, &new_trunk)?;
            self.header.freelist_trunk = pgno;
        }
        self.header.freelist_count += 1;
        self.write_header()
    }

    // ========================================================================
    // Cells, payloads, overflow chains
    // ========================================================================

    /// Build a cell image, writing overflow pages as needed.
    fn make_cell(
        &mut self,
        flags: u8,
        child: Pgno,
        rowid: RowId,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let limits = self.payload_limits();
        let is_leaf = flags & PTF_LEAF != 0;
        let is_intkey = flags & PTF_INTKEY != 0;

        let mut cell = Vec::new();
        if !is_leaf {
            cell.extend_from_slice(&child.to_be_bytes());
        }

        if is_intkey {
            if is_leaf {
                let mut buf = [0u8; 9];
                let n = put_varint(&mut buf, payload.len() as u64);
                cell.extend_from_slice(&buf[..n]);
                let n = put_varint(&mut buf, rowid as u64);
                cell.extend_from_slice(&buf[..n]);
            } else {
                let mut buf = [0u8; 9];
                let n = put_varint(&mut buf, rowid as u64);
                cell.extend_from_slice(&buf[..n]);
                return Ok(cell);
            }
        } else {
            let mut buf = [0u8; 9];
            let n = put_varint(&mut buf, payload.len() as u64);
            cell.extend_from_slice(&buf[..n]);
        }

        let (local, has_overflow) =
            local_payload_len(limits, is_intkey && is_leaf, payload.len() as u32);
        cell.extend_from_slice(&payload[..local as usize]);

        if has_overflow {
            let first = self.write_overflow_chain(&payload[local as usize..])?;
            cell.extend_from_slice(&first.to_be_bytes());
        }
        Ok(cell)
    }

    /// Write `rest` into a fresh overflow chain, returning its head.
    fn write_overflow_chain(&mut self, rest: &[u8]) -> Result<Pgno> {
        let cap = self.payload_limits().overflow_capacity() as usize;
        let chunks: Vec<&[u8]> = rest.chunks(cap).collect();

        let mut pages = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            pages.push(self.allocate_page()?);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let next = pages.get(i + 1).copied().unwrap_or(0);
            let mut data = vec![0u8; self.pager.page_size() as usize];
            write_u32(&mut data, 0, next)?;
            data[4..4 + chunk.len()].copy_from_slice(chunk);
            self.write_raw(pages[i], &data)?;
        }
        Ok(pages[0])
    }

    /// Free the overflow chain hanging off a cell, if any.
    fn free_cell_overflow(&mut self, info: &CellInfo) -> Result<()> {
        let mut pgno = info.overflow;
        let cap = self.payload_limits().overflow_capacity();
        let mut remaining = (info.payload_len - info.local_len).div_ceil(cap) + 1;
        while pgno != 0 && remaining > 0 {
            let data = self.read_raw(pgno)?;
            let next = read_u32(&data, 0).unwrap_or(0);
            self.free_page(pgno)?;
            pgno = next;
            remaining -= 1;
        }
        Ok(())
    }

    /// Materialize a cell's full payload, local part plus overflow.
    fn read_payload_of(&mut self, page: &MemPage, info: &CellInfo) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(info.payload_len as usize);
        out.extend_from_slice(page.local_payload(info));

        let cap = self.payload_limits().overflow_capacity() as usize;
        let mut pgno = info.overflow;
        let mut remaining = info.payload_len as usize - info.local_len as usize;
        while remaining > 0 {
            if pgno == 0 {
                return Err(corrupt_page(page.pgno, "overflow chain ends early"));
            }
            self.interrupt.check()?;
            let data = self.read_raw(pgno)?;
            let take = remaining.min(cap);
            out.extend_from_slice(&data[4..4 + take]);
            remaining -= take;
            pgno = read_u32(&data, 0).unwrap_or(0);
        }
        Ok(out)
    }

    // ========================================================================
    // Table management
    // ========================================================================

    /// Create an empty tree; `index` selects the key-only flavor.
    /// Returns the root page number, the tree's permanent identity.
    pub fn create_table(&mut self, index: bool) -> Result<Pgno> {
        self.require_write_txn()?;
        let pgno = self.allocate_page()?;
        let flags = if index { PTF_INDEX_LEAF } else { PTF_TABLE_LEAF };
        let page = MemPage::zeroed(pgno, flags, self.limits_for(pgno));
        self.write_mempage(&page)?;
        Ok(pgno)
    }

    /// Delete every row of a tree, returning the pages to the free-list.
    /// Returns the number of rows removed.
    pub fn clear_table(&mut self, root: Pgno) -> Result<i64> {
        self.require_write_txn()?;
        self.save_all_cursors(usize::MAX)?;

        let mut rows = 0i64;
        let mut pending = vec![root];
        let mut root_flags = PTF_TABLE_LEAF;

        while let Some(pgno) = pending.pop() {
            self.interrupt.check()?;
            let page = self.read_mempage(pgno)?;
            if pgno == root {
                root_flags = if page.is_intkey {
                    PTF_TABLE_LEAF
                } else {
                    PTF_INDEX_LEAF
                };
            }

            for i in 0..page.n_cell {
                let info = page.cell(i)?;
                if info.overflow != 0 {
                    self.free_cell_overflow(&info)?;
                }
                if !page.is_leaf {
                    pending.push(info.child);
                }
                // Rows live on leaves; for index trees interior cells are
                // rows as well
                if page.is_leaf || !page.is_intkey {
                    rows += 1;
                }
            }
            if !page.is_leaf {
                pending.push(page.right_child());
            }
            if pgno != root {
                self.free_page(pgno)?;
            }
        }

        let empty = MemPage::zeroed(root, root_flags, self.limits_for(root));
        self.write_mempage(&empty)?;
        Ok(rows)
    }

    /// Clear a tree and return its root to the free-list. The schema
    /// root on page 1 cannot be dropped.
    pub fn drop_table(&mut self, root: Pgno) -> Result<()> {
        if root == 1 {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.clear_table(root)?;
        self.free_page(root)
    }

    // ========================================================================
    // Cursor registry
    // ========================================================================

    /// Open a cursor. `key_info` selects index semantics; `writable`
    /// requires a write transaction.
    pub fn cursor_open(
        &mut self,
        root: Pgno,
        key_info: Option<Arc<KeyInfo>>,
        writable: bool,
    ) -> Result<CursorId> {
        if self.trans == TransState::None {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "cursor outside a transaction",
            ));
        }
        if writable {
            self.require_write_txn()?;
        }

        let cursor = Cursor {
            root,
            writable,
            key_info,
            pos: CursorPos::Invalid,
            stack: Vec::new(),
            page: None,
            idx: 0,
            pin: None,
            saved: None,
            skip_next: false,
            skip_prev: false,
        };

        for (i, slot) in self.cursors.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(cursor);
                return Ok(CursorId(i));
            }
        }
        self.cursors.push(Some(cursor));
        Ok(CursorId(self.cursors.len() - 1))
    }

    pub fn cursor_close(&mut self, id: CursorId) {
        if let Some(Some(mut cur)) = self.cursors.get_mut(id.0).map(|s| s.take()) {
            if let Some(pin) = cur.pin.take() {
                self.pager.unref(pin);
            }
        }
    }

    fn take_cursor(&mut self, id: CursorId) -> Result<Cursor> {
        self.cursors
            .get_mut(id.0)
            .and_then(|s| s.take())
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "unknown cursor"))
    }

    fn put_cursor(&mut self, id: CursorId, cur: Cursor) {
        self.cursors[id.0] = Some(cur);
    }

    fn unpin(&mut self, cur: &mut Cursor) {
        if let Some(pin) = cur.pin.take() {
            self.pager.unref(pin);
        }
    }

    fn set_current(&mut self, cur: &mut Cursor, page: MemPage, idx: u16) -> Result<()> {
        self.unpin(cur);
        cur.pin = Some(self.pager.get(page.pgno)?);
        cur.page = Some(page);
        cur.idx = idx;
        cur.pos = CursorPos::Valid;
        Ok(())
    }

    fn invalidate(&mut self, cur: &mut Cursor) {
        self.unpin(cur);
        cur.page = None;
        cur.stack.clear();
        cur.pos = CursorPos::Invalid;
    }

    /// Record every valid cursor's key and force a re-seek before its
    /// next use. Ran before any structural change; `except` skips the
    /// acting cursor (`usize::MAX` saves all).
    fn save_all_cursors(&mut self, except: usize) -> Result<()> {
        for i in 0..self.cursors.len() {
            if i == except {
                continue;
            }
            let mut cur = match self.cursors[i].take() {
                Some(c) => c,
                None => continue,
            };
            if cur.pos == CursorPos::Valid {
                let saved = self.current_position_key(&mut cur);
                match saved {
                    Ok(saved) => {
                        cur.saved = Some(saved);
                        cur.pos = CursorPos::RequireSeek;
                    }
                    Err(e) => {
                        self.cursors[i] = Some(cur);
                        return Err(e);
                    }
                }
                self.unpin(&mut cur);
                cur.page = None;
                cur.stack.clear();
            }
            self.cursors[i] = Some(cur);
        }
        Ok(())
    }

    fn current_position_key(&mut self, cur: &mut Cursor) -> Result<SavedPosition> {
        let page = cur
            .page
            .as_ref()
            .ok_or_else(|| Error::new(ErrorCode::Misuse))?;
        let info = page.cell(cur.idx)?;
        if cur.is_index() {
            // Borrow dance: payload reads need the pager
            let page = cur.page.take().unwrap();
            let key = self.read_payload_of(&page, &info);
            cur.page = Some(page);
            Ok(SavedPosition::Key(key?))
        } else {
            Ok(SavedPosition::Rowid(info.rowid))
        }
    }

    /// Bring a cursor back to a usable position after an invalidation.
    fn cursor_restore(&mut self, cur: &mut Cursor) -> Result<()> {
        if cur.pos != CursorPos::RequireSeek {
            return Ok(());
        }
        let saved = cur
            .saved
            .clone()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "cursor has no saved key"))?;
        let res = match &saved {
            SavedPosition::Rowid(rowid) => self.table_seek_inner(cur, *rowid)?,
            SavedPosition::Key(key) => self.index_seek_inner(cur, key)?,
        };
        cur.saved = Some(saved);
        if cur.pos == CursorPos::Valid {
            if res > 0 {
                cur.skip_next = true;
            } else if res < 0 {
                cur.skip_prev = true;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Seeks and movement
// ============================================================================

impl Btree {
    /// Position on the first entry; `false` when the tree is empty.
    pub fn cursor_first(&mut self, id: CursorId) -> Result<bool> {
        let mut cur = self.take_cursor(id)?;
        let rc = self.first_inner(&mut cur);
        self.put_cursor(id, cur);
        rc
    }

    fn first_inner(&mut self, cur: &mut Cursor) -> Result<bool> {
        cur.skip_next = false;
        cur.skip_prev = false;
        cur.saved = None;
        cur.stack.clear();
        self.unpin(cur);

        let page = self.read_mempage(cur.root)?;
        if page.is_leaf {
            if page.n_cell == 0 {
                cur.pin = Some(self.pager.get(page.pgno)?);
                cur.page = Some(page);
                cur.idx = 0;
                cur.pos = CursorPos::Invalid;
                return Ok(false);
            }
            self.set_current(cur, page, 0)?;
            return Ok(true);
        }
        let child = page.child_at(0)?;
        cur.stack.push((page.pgno, 0));
        self.descend_leftmost(cur, child)
    }

    /// Position on the last entry; `false` when the tree is empty.
    pub fn cursor_last(&mut self, id: CursorId) -> Result<bool> {
        let mut cur = self.take_cursor(id)?;
        let rc = self.last_inner(&mut cur);
        self.put_cursor(id, cur);
        rc
    }

    fn last_inner(&mut self, cur: &mut Cursor) -> Result<bool> {
        cur.skip_next = false;
        cur.skip_prev = false;
        cur.saved = None;
        cur.stack.clear();
        self.unpin(cur);

        let page = self.read_mempage(cur.root)?;
        if page.is_leaf {
            if page.n_cell == 0 {
                cur.pin = Some(self.pager.get(page.pgno)?);
                cur.page = Some(page);
                cur.idx = 0;
                cur.pos = CursorPos::Invalid;
                return Ok(false);
            }
            let idx = page.n_cell - 1;
            self.set_current(cur, page, idx)?;
            return Ok(true);
        }
        let child = page.right_child();
        cur.stack.push((page.pgno, page.n_cell));
        self.descend_rightmost(cur, child)
    }

    fn descend_leftmost(&mut self, cur: &mut Cursor, mut pgno: Pgno) -> Result<bool> {
        loop {
            let page = self.read_mempage(pgno)?;
            if page.is_leaf {
                if page.n_cell == 0 {
                    return Err(corrupt_page(pgno, "empty non-root leaf"));
                }
                self.set_current(cur, page, 0)?;
                return Ok(true);
            }
            let child = page.child_at(0)?;
            cur.stack.push((page.pgno, 0));
            pgno = child;
        }
    }

    fn descend_rightmost(&mut self, cur: &mut Cursor, mut pgno: Pgno) -> Result<bool> {
        loop {
            let page = self.read_mempage(pgno)?;
            if page.is_leaf {
                if page.n_cell == 0 {
                    return Err(corrupt_page(pgno, "empty non-root leaf"));
                }
                let idx = page.n_cell - 1;
                self.set_current(cur, page, idx)?;
                return Ok(true);
            }
            let child = page.right_child();
            cur.stack.push((page.pgno, page.n_cell));
            pgno = child;
        }
    }

    /// Advance to the following entry; `false` at the end.
    pub fn cursor_next(&mut self, id: CursorId) -> Result<bool> {
        let mut cur = self.take_cursor(id)?;
        let rc = self.next_inner(&mut cur);
        self.put_cursor(id, cur);
        rc
    }

    fn next_inner(&mut self, cur: &mut Cursor) -> Result<bool> {
        self.interrupt.check()?;
        self.cursor_restore(cur)?;
        if cur.pos != CursorPos::Valid {
            return Ok(false);
        }
        if cur.skip_next {
            cur.skip_next = false;
            cur.skip_prev = false;
            return Ok(true);
        }
        cur.skip_prev = false;

        let page = cur.page.as_ref().unwrap();
        if page.is_leaf {
            if cur.idx + 1 < page.n_cell {
                cur.idx += 1;
                return Ok(true);
            }
            // Climb until a subtree to the right exists
            loop {
                match cur.stack.pop() {
                    None => {
                        self.invalidate(cur);
                        return Ok(false);
                    }
                    Some((ppgno, k)) => {
                        let parent = self.read_mempage(ppgno)?;
                        if !parent.is_intkey && k < parent.n_cell {
                            // Index interior cells are entries themselves
                            self.set_current(cur, parent, k)?;
                            return Ok(true);
                        }
                        if k < parent.n_cell {
                            let child = parent.child_at(k + 1)?;
                            cur.stack.push((ppgno, k + 1));
                            return self.descend_leftmost(cur, child);
                        }
                    }
                }
            }
        } else {
            // Index interior position: continue into the next subtree
            let child = page.child_at(cur.idx + 1)?;
            let pgno = page.pgno;
            cur.stack.push((pgno, cur.idx + 1));
            self.descend_leftmost(cur, child)
        }
    }

    /// Step back to the preceding entry; `false` at the start.
    pub fn cursor_prev(&mut self, id: CursorId) -> Result<bool> {
        let mut cur = self.take_cursor(id)?;
        let rc = self.prev_inner(&mut cur);
        self.put_cursor(id, cur);
        rc
    }

    fn prev_inner(&mut self, cur: &mut Cursor) -> Result<bool> {
        self.interrupt.check()?;
        self.cursor_restore(cur)?;
        if cur.pos != CursorPos::Valid {
            return Ok(false);
        }
        if cur.skip_prev {
            cur.skip_prev = false;
            cur.skip_next = false;
            return Ok(true);
        }
        cur.skip_next = false;

        let page = cur.page.as_ref().unwrap();
        if page.is_leaf {
            if cur.idx > 0 {
                cur.idx -= 1;
                return Ok(true);
            }
            loop {
                match cur.stack.pop() {
                    None => {
                        self.invalidate(cur);
                        return Ok(false);
                    }
                    Some((ppgno, k)) => {
                        let parent = self.read_mempage(ppgno)?;
                        if !parent.is_intkey && k > 0 {
                            self.set_current(cur, parent, k - 1)?;
                            return Ok(true);
                        }
                        if parent.is_intkey && k > 0 {
                            let child = parent.child_at(k - 1)?;
                            cur.stack.push((ppgno, k - 1));
                            return self.descend_rightmost(cur, child);
                        }
                    }
                }
            }
        } else {
            // Index interior position: the preceding entries live in the
            // subtree to the left of this cell
            let child = page.child_at(cur.idx)?;
            let pgno = page.pgno;
            cur.stack.push((pgno, cur.idx));
            self.descend_rightmost(cur, child)
        }
    }

    pub fn cursor_valid(&self, id: CursorId) -> bool {
        self.cursors
            .get(id.0)
            .and_then(|s| s.as_ref())
            .map(|c| c.pos == CursorPos::Valid)
            .unwrap_or(false)
    }

    /// Seek a table cursor to `rowid`. Returns 0 on an exact hit, -1 when
    /// the cursor lands on the last smaller entry (or the tree is empty),
    /// +1 when it lands on the first larger entry.
    pub fn table_seek(&mut self, id: CursorId, rowid: RowId) -> Result<i32> {
        let mut cur = self.take_cursor(id)?;
        let rc = self.table_seek_inner(&mut cur, rowid);
        self.put_cursor(id, cur);
        rc
    }

    fn table_seek_inner(&mut self, cur: &mut Cursor, rowid: RowId) -> Result<i32> {
        cur.skip_next = false;
        cur.skip_prev = false;
        cur.saved = None;
        cur.stack.clear();
        self.unpin(cur);

        let mut pgno = cur.root;
        loop {
            self.interrupt.check()?;
            let page = self.read_mempage(pgno)?;
            if !page.is_intkey {
                return Err(corrupt_page(pgno, "table cursor on an index page"));
            }

            if page.is_leaf {
                let mut lo = 0i64;
                let mut hi = page.n_cell as i64 - 1;
                while lo <= hi {
                    let mid = (lo + hi) / 2;
                    let cell_rowid = page.cell(mid as u16)?.rowid;
                    match cell_rowid.cmp(&rowid) {
                        std::cmp::Ordering::Equal => {
                            self.set_current(cur, page, mid as u16)?;
                            return Ok(0);
                        }
                        std::cmp::Ordering::Less => lo = mid + 1,
                        std::cmp::Ordering::Greater => hi = mid - 1,
                    }
                }
                // lo is the insertion point
                if page.n_cell == 0 {
                    cur.pin = Some(self.pager.get(page.pgno)?);
                    cur.page = Some(page);
                    cur.idx = 0;
                    cur.pos = CursorPos::Invalid;
                    return Ok(-1);
                }
                if lo > 0 {
                    self.set_current(cur, page, (lo - 1) as u16)?;
                    return Ok(-1);
                }
                self.set_current(cur, page, 0)?;
                return Ok(1);
            }

            // First separator with key >= rowid routes left of itself
            let mut lo = 0i64;
            let mut hi = page.n_cell as i64 - 1;
            while lo <= hi {
                let mid = (lo + hi) / 2;
                if page.cell(mid as u16)?.rowid >= rowid {
                    hi = mid - 1;
                } else {
                    lo = mid + 1;
                }
            }
            let k = lo as u16;
            let child = page.child_at(k)?;
            cur.stack.push((page.pgno, k));
            pgno = child;
        }
    }

    /// Seek an index cursor to an encoded key. Same result convention as
    /// `table_seek`; an exact hit may land on an interior cell.
    pub fn index_seek(&mut self, id: CursorId, key: &[u8]) -> Result<i32> {
        let mut cur = self.take_cursor(id)?;
        let rc = self.index_seek_inner(&mut cur, key);
        self.put_cursor(id, cur);
        rc
    }

    fn index_seek_inner(&mut self, cur: &mut Cursor, key: &[u8]) -> Result<i32> {
        let key_info = cur
            .key_info
            .clone()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "index seek on a table cursor"))?;
        cur.skip_next = false;
        cur.skip_prev = false;
        cur.saved = None;
        cur.stack.clear();
        self.unpin(cur);

        let mut pgno = cur.root;
        loop {
            self.interrupt.check()?;
            let page = self.read_mempage(pgno)?;
            if page.is_intkey {
                return Err(corrupt_page(pgno, "index cursor on a table page"));
            }

            let mut lo = 0i64;
            let mut hi = page.n_cell as i64 - 1;
            let mut found: Option<u16> = None;
            while lo <= hi {
                let mid = (lo + hi) / 2;
                let ord = self.compare_cell_key(&page, mid as u16, key, &key_info)?;
                match ord {
                    std::cmp::Ordering::Equal => {
                        found = Some(mid as u16);
                        break;
                    }
                    std::cmp::Ordering::Less => lo = mid + 1,
                    std::cmp::Ordering::Greater => hi = mid - 1,
                }
            }

            if let Some(idx) = found {
                self.set_current(cur, page, idx)?;
                return Ok(0);
            }

            if page.is_leaf {
                if page.n_cell == 0 {
                    cur.pin = Some(self.pager.get(page.pgno)?);
                    cur.page = Some(page);
                    cur.idx = 0;
                    cur.pos = CursorPos::Invalid;
                    return Ok(-1);
                }
                if lo > 0 {
                    self.set_current(cur, page, (lo - 1) as u16)?;
                    return Ok(-1);
                }
                self.set_current(cur, page, 0)?;
                return Ok(1);
            }

            let k = lo as u16;
            let child = page.child_at(k)?;
            cur.stack.push((page.pgno, k));
            pgno = child;
        }
    }

    /// Ordering of cell `idx`'s key relative to `key`.
    fn compare_cell_key(
        &mut self,
        page: &MemPage,
        idx: u16,
        key: &[u8],
        key_info: &KeyInfo,
    ) -> Result<std::cmp::Ordering> {
        let info = page.cell(idx)?;
        if info.overflow == 0 {
            key_info.compare(page.local_payload(&info), key)
        } else {
            let full = self.read_payload_of(page, &info)?;
            key_info.compare(&full, key)
        }
    }

    // ========================================================================
    // Row access
    // ========================================================================

    /// Rowid under a valid table cursor.
    pub fn cursor_rowid(&mut self, id: CursorId) -> Result<RowId> {
        let mut cur = self.take_cursor(id)?;
        let rc = (|| {
            self.cursor_restore(&mut cur)?;
            if cur.pos != CursorPos::Valid {
                return Err(Error::with_message(ErrorCode::Misuse, "cursor not valid"));
            }
            let page = cur.page.as_ref().unwrap();
            Ok(page.cell(cur.idx)?.rowid)
        })();
        self.put_cursor(id, cur);
        rc
    }

    /// Payload under a valid cursor: the row for tables, the key record
    /// for indexes.
    pub fn cursor_payload(&mut self, id: CursorId) -> Result<Vec<u8>> {
        let mut cur = self.take_cursor(id)?;
        let rc = (|| {
            self.cursor_restore(&mut cur)?;
            if cur.pos != CursorPos::Valid {
                return Err(Error::with_message(ErrorCode::Misuse, "cursor not valid"));
            }
            let page = cur.page.take().unwrap();
            let info = page.cell(cur.idx);
            let out = info.and_then(|info| self.read_payload_of(&page, &info));
            cur.page = Some(page);
            out
        })();
        self.put_cursor(id, cur);
        rc
    }

    /// Total payload length under a valid cursor.
    pub fn cursor_payload_size(&mut self, id: CursorId) -> Result<u32> {
        let mut cur = self.take_cursor(id)?;
        let rc = (|| {
            self.cursor_restore(&mut cur)?;
            if cur.pos != CursorPos::Valid {
                return Err(Error::with_message(ErrorCode::Misuse, "cursor not valid"));
            }
            let page = cur.page.as_ref().unwrap();
            Ok(page.cell(cur.idx)?.payload_len)
        })();
        self.put_cursor(id, cur);
        rc
    }
}

// ============================================================================
// Insert, delete, balance
// ============================================================================

impl Btree {
    /// Insert or replace the row `rowid` in a table tree.
    pub fn table_insert(&mut self, id: CursorId, rowid: RowId, payload: &[u8]) -> Result<()> {
        self.interrupt.check()?;
        self.require_write_txn()?;
        let mut cur = self.take_cursor(id)?;
        let rc = self.table_insert_inner(&mut cur, id.0, rowid, payload);
        self.put_cursor(id, cur);
        rc
    }

    fn table_insert_inner(
        &mut self,
        cur: &mut Cursor,
        self_idx: usize,
        rowid: RowId,
        payload: &[u8],
    ) -> Result<()> {
        if !cur.writable {
            return Err(Error::with_message(ErrorCode::Misuse, "read-only cursor"));
        }
        self.save_all_cursors(self_idx)?;

        let res = self.table_seek_inner(cur, rowid)?;
        let mut page = cur.page.take().ok_or_else(|| Error::new(ErrorCode::Misuse))?;
        let stack = cur.stack.clone();
        self.unpin(cur);

        let idx = if res == 0 {
            // Replace: drop the old row first
            let removed = page.remove_cell(cur.idx)?;
            if removed.overflow != 0 {
                self.free_cell_overflow(&removed)?;
            }
            cur.idx
        } else if cur.pos == CursorPos::Valid {
            if res < 0 {
                cur.idx + 1
            } else {
                cur.idx
            }
        } else {
            0
        };

        let cell = self.make_cell(PTF_TABLE_LEAF, 0, rowid, payload)?;
        self.insert_cell_on_page(page, &stack, idx, cell)?;

        cur.page = None;
        cur.stack.clear();
        cur.pos = CursorPos::RequireSeek;
        cur.saved = Some(SavedPosition::Rowid(rowid));
        Ok(())
    }

    /// Insert a key record into an index tree. Inserting a key that is
    /// already present is a no-op.
    pub fn index_insert(&mut self, id: CursorId, key: &[u8]) -> Result<()> {
        self.interrupt.check()?;
        self.require_write_txn()?;
        let mut cur = self.take_cursor(id)?;
        let rc = self.index_insert_inner(&mut cur, id.0, key);
        self.put_cursor(id, cur);
        rc
    }

    fn index_insert_inner(&mut self, cur: &mut Cursor, self_idx: usize, key: &[u8]) -> Result<()> {
        if !cur.writable {
            return Err(Error::with_message(ErrorCode::Misuse, "read-only cursor"));
        }
        self.save_all_cursors(self_idx)?;

        let res = self.index_seek_inner(cur, key)?;
        if res == 0 {
            // The key is the whole row; an equal row is already there
            return Ok(());
        }

        let page = cur.page.take().ok_or_else(|| Error::new(ErrorCode::Misuse))?;
        let stack = cur.stack.clone();
        self.unpin(cur);

        let idx = if cur.pos == CursorPos::Valid {
            if res < 0 {
                cur.idx + 1
            } else {
                cur.idx
            }
        } else {
            0
        };

        let cell = self.make_cell(PTF_INDEX_LEAF, 0, 0, key)?;
        self.insert_cell_on_page(page, &stack, idx, cell)?;

        cur.page = None;
        cur.stack.clear();
        cur.pos = CursorPos::RequireSeek;
        cur.saved = Some(SavedPosition::Key(key.to_vec()));
        Ok(())
    }

    /// Delete the entry under the cursor. Afterwards the cursor re-seeks
    /// to the deleted key's position: `next` continues with the entry
    /// that followed it.
    pub fn cursor_delete(&mut self, id: CursorId) -> Result<()> {
        self.interrupt.check()?;
        self.require_write_txn()?;
        let mut cur = self.take_cursor(id)?;
        let rc = self.cursor_delete_inner(&mut cur, id.0);
        self.put_cursor(id, cur);
        rc
    }

    fn cursor_delete_inner(&mut self, cur: &mut Cursor, self_idx: usize) -> Result<()> {
        if !cur.writable {
            return Err(Error::with_message(ErrorCode::Misuse, "read-only cursor"));
        }
        self.cursor_restore(cur)?;
        if cur.pos != CursorPos::Valid {
            return Err(Error::with_message(ErrorCode::Misuse, "cursor not valid"));
        }
        self.save_all_cursors(self_idx)?;

        let page = cur.page.take().ok_or_else(|| Error::new(ErrorCode::Misuse))?;
        let idx = cur.idx;
        let stack = cur.stack.clone();

        // Remember where we were for the post-delete re-seek
        let info = page.cell(idx)?;
        let saved = if cur.is_index() {
            SavedPosition::Key(self.read_payload_of(&page, &info)?)
        } else {
            SavedPosition::Rowid(info.rowid)
        };
        self.unpin(cur);

        if page.is_leaf {
            let mut page = page;
            let removed = page.remove_cell(idx)?;
            if removed.overflow != 0 {
                self.free_cell_overflow(&removed)?;
            }
            self.write_mempage(&page)?;
            self.balance(page, stack)?;
        } else {
            // Index interior rows are replaced by their predecessor
            let key = match &saved {
                SavedPosition::Key(k) => k.clone(),
                SavedPosition::Rowid(_) => {
                    return Err(corrupt_page(page.pgno, "table cursor on interior page"))
                }
            };
            drop(page);
            self.delete_interior_index_row(cur, &key)?;
        }

        cur.page = None;
        cur.stack.clear();
        cur.pos = CursorPos::RequireSeek;
        cur.saved = Some(saved);
        Ok(())
    }

    /// Remove an index row that lives on an interior page: delete its
    /// in-order predecessor from its leaf, then splice the predecessor
    /// into the interior slot. Balancing in between may demote the
    /// target to a leaf, in which case the removal is ordinary and the
    /// predecessor is re-inserted as a fresh row.
    fn delete_interior_index_row(&mut self, cur: &mut Cursor, key: &[u8]) -> Result<()> {
        // Locate the target and its left subtree
        let res = self.index_seek_inner(cur, key)?;
        if res != 0 {
            return Err(Error::with_message(ErrorCode::Corrupt, "index row vanished"));
        }
        let page = cur.page.take().unwrap();
        if page.is_leaf {
            // Already demoted by an earlier pass: plain leaf delete
            let mut page = page;
            let idx = cur.idx;
            let stack = cur.stack.clone();
            self.unpin(cur);
            let removed = page.remove_cell(idx)?;
            if removed.overflow != 0 {
                self.free_cell_overflow(&removed)?;
            }
            self.write_mempage(&page)?;
            return self.balance(page, stack);
        }

        let child = page.cell(cur.idx)?.child;
        self.unpin(cur);
        drop(page);

        // Materialize the predecessor: rightmost row of the left subtree
        let mut pgno = child;
        let leaf = loop {
            let p = self.read_mempage(pgno)?;
            if p.is_leaf {
                break p;
            }
            pgno = p.right_child();
        };
        let pinfo = leaf.cell(leaf.n_cell - 1)?;
        let pred = self.read_payload_of(&leaf, &pinfo)?;
        drop(leaf);

        // Remove the predecessor row from its leaf
        let res = self.index_seek_inner(cur, &pred)?;
        if res != 0 {
            return Err(Error::with_message(ErrorCode::Corrupt, "predecessor vanished"));
        }
        let mut lpage = cur.page.take().unwrap();
        let lidx = cur.idx;
        let lstack = cur.stack.clone();
        self.unpin(cur);
        if !lpage.is_leaf {
            return Err(corrupt_page(lpage.pgno, "predecessor not on a leaf"));
        }
        let removed = lpage.remove_cell(lidx)?;
        if removed.overflow != 0 {
            self.free_cell_overflow(&removed)?;
        }
        self.write_mempage(&lpage)?;
        self.balance(lpage, lstack)?;

        // Find the target again; balancing may have moved it
        let res = self.index_seek_inner(cur, key)?;
        if res != 0 {
            return Err(Error::with_message(ErrorCode::Corrupt, "index row vanished"));
        }
        let kpage = cur.page.take().unwrap();
        let kidx = cur.idx;
        let kstack = cur.stack.clone();
        self.unpin(cur);

        if kpage.is_leaf {
            let mut kpage = kpage;
            let removed = kpage.remove_cell(kidx)?;
            if removed.overflow != 0 {
                self.free_cell_overflow(&removed)?;
            }
            self.write_mempage(&kpage)?;
            self.balance(kpage, kstack)?;

            // The predecessor goes back in as an ordinary row
            let res = self.index_seek_inner(cur, &pred)?;
            if res == 0 {
                return Err(Error::with_message(ErrorCode::Corrupt, "duplicate row"));
            }
            let page = cur.page.take().unwrap();
            let stack = cur.stack.clone();
            self.unpin(cur);
            let idx = if cur.pos == CursorPos::Valid {
                if res < 0 {
                    cur.idx + 1
                } else {
                    cur.idx
                }
            } else {
                0
            };
            let cell = self.make_cell(PTF_INDEX_LEAF, 0, 0, &pred)?;
            self.insert_cell_on_page(page, &stack, idx, cell)
        } else {
            let mut kpage = kpage;
            let old = kpage.cell(kidx)?;
            let child_ptr = old.child;
            let removed = kpage.remove_cell(kidx)?;
            if removed.overflow != 0 {
                self.free_cell_overflow(&removed)?;
            }
            let cell = self.make_cell(PTF_INDEX_INTERIOR, child_ptr, 0, &pred)?;
            self.insert_cell_on_page(kpage, &kstack, kidx, cell)
        }
    }

    /// Insert a prebuilt cell into a page, splitting up the tree as
    /// needed. Writes every touched page.
    fn insert_cell_on_page(
        &mut self,
        mut page: MemPage,
        stack: &[(Pgno, u16)],
        idx: u16,
        cell: Vec<u8>,
    ) -> Result<()> {
        if page.insert_cell(idx, &cell)? {
            return self.write_mempage(&page);
        }

        // Split: gather every cell including the newcomer
        let mut cells = page.all_cells()?;
        cells.insert(idx as usize, cell);
        let old_right_child = if page.is_leaf { 0 } else { page.right_child() };

        if stack.is_empty() {
            return self.split_root(page, cells, old_right_child);
        }
        let (ppgno, k) = *stack.last().unwrap();

        let new_pgno = self.allocate_page()?;
        let promote = !(page.is_leaf && page.is_intkey);
        let m = partition_point(&cells, promote);

        let (lcells, promoted, rcells): (Vec<Vec<u8>>, Option<Vec<u8>>, Vec<Vec<u8>>) = if promote {
            (
                cells[..m].to_vec(),
                Some(cells[m].clone()),
                cells[m + 1..].to_vec(),
            )
        } else {
            (cells[..m].to_vec(), None, cells[m..].to_vec())
        };

        // Left keeps the page number the parent already points at through
        // the separator we are about to insert; right is brand new.
        let (left_rc, right_rc) = if page.is_leaf {
            (0, 0)
        } else {
            let p = promoted.as_ref().unwrap();
            let promoted_child = read_u32(p, 0).ok_or_else(|| corrupt_page(page.pgno, "bad cell"))?;
            (promoted_child, old_right_child)
        };

        let flags = page.flags;
        page.rebuild(flags, &lcells, left_rc)?;
        let mut right = MemPage::zeroed(new_pgno, flags, self.limits_for(new_pgno));
        right.rebuild(flags, &rcells, right_rc)?;

        // Separator cell carried up to the parent: child = left page
        let sep_cell = if page.is_leaf && page.is_intkey {
            let rowid = leaf_cell_rowid(lcells.last().unwrap())?;
            let mut sep = page.pgno.to_be_bytes().to_vec();
            let mut buf = [0u8; 9];
            let n = put_varint(&mut buf, rowid as u64);
            sep.extend_from_slice(&buf[..n]);
            sep
        } else {
            let p = promoted.as_ref().unwrap();
            let key_part = if page.is_leaf { &p[..] } else { &p[4..] };
            let mut sep = page.pgno.to_be_bytes().to_vec();
            sep.extend_from_slice(key_part);
            sep
        };

        self.write_mempage(&page)?;
        self.write_mempage(&right)?;

        // The parent pointer that reached the old page now reaches the
        // right half; the separator carries the left half.
        let mut parent = self.read_mempage(ppgno)?;
        parent.set_child_at(k, new_pgno)?;
        self.insert_cell_on_page(parent, &stack[..stack.len() - 1], k, sep_cell)
    }

    /// Split a full root in place, growing the tree by one level. The
    /// root page number never changes.
    fn split_root(
        &mut self,
        mut root: MemPage,
        cells: Vec<Vec<u8>>,
        old_right_child: Pgno,
    ) -> Result<()> {
        let left_pgno = self.allocate_page()?;
        let right_pgno = self.allocate_page()?;

        let promote = !(root.is_leaf && root.is_intkey);
        let m = partition_point(&cells, promote);
        let (lcells, promoted, rcells): (Vec<Vec<u8>>, Option<Vec<u8>>, Vec<Vec<u8>>) = if promote {
            (
                cells[..m].to_vec(),
                Some(cells[m].clone()),
                cells[m + 1..].to_vec(),
            )
        } else {
            (cells[..m].to_vec(), None, cells[m..].to_vec())
        };

        let (left_rc, right_rc) = if root.is_leaf {
            (0, 0)
        } else {
            let p = promoted.as_ref().unwrap();
            let promoted_child = read_u32(p, 0).ok_or_else(|| corrupt_page(root.pgno, "bad cell"))?;
            (promoted_child, old_right_child)
        };

        let child_flags = root.flags;
        let mut left = MemPage::zeroed(left_pgno, child_flags, self.limits_for(left_pgno));
        left.rebuild(child_flags, &lcells, left_rc)?;
        let mut right = MemPage::zeroed(right_pgno, child_flags, self.limits_for(right_pgno));
        right.rebuild(child_flags, &rcells, right_rc)?;

        let sep_cell = if root.is_leaf && root.is_intkey {
            let rowid = leaf_cell_rowid(lcells.last().unwrap())?;
            let mut sep = left_pgno.to_be_bytes().to_vec();
            let mut buf = [0u8; 9];
            let n = put_varint(&mut buf, rowid as u64);
            sep.extend_from_slice(&buf[..n]);
            sep
        } else {
            let p = promoted.as_ref().unwrap();
            let key_part = if root.is_leaf { &p[..] } else { &p[4..] };
            let mut sep = left_pgno.to_be_bytes().to_vec();
            sep.extend_from_slice(key_part);
            sep
        };

        let interior_flags = if root.is_intkey {
            PTF_TABLE_INTERIOR
        } else {
            PTF_INDEX_INTERIOR
        };
        root.rebuild(interior_flags, &[sep_cell], right_pgno)?;

        self.write_mempage(&left)?;
        self.write_mempage(&right)?;
        self.write_mempage(&root)
    }

    /// Rebalance after a deletion: pages below the minimum fill borrow
    /// from or merge with a sibling, preferring the left one; an interior
    /// root left with a single child collapses into it.
    fn balance(&mut self, page: MemPage, mut stack: Vec<(Pgno, u16)>) -> Result<()> {
        let mut page = page;
        loop {
            if stack.is_empty() {
                // Root: collapse a childless interior level
                if !page.is_leaf && page.n_cell == 0 {
                    let child_pgno = page.right_child();
                    let child = self.read_mempage(child_pgno)?;
                    let cells = child.all_cells()?;
                    let total: usize = cells.iter().map(|c| c.len() + CELL_PTR_SIZE).sum();
                    if total <= page.cell_area() {
                        let rc = if child.is_leaf { 0 } else { child.right_child() };
                        let flags = child.flags;
                        drop(child);
                        page.rebuild(flags, &cells, rc)?;
                        self.write_mempage(&page)?;
                        self.free_page(child_pgno)?;
                        continue;
                    }
                }
                return self.write_mempage(&page);
            }

            if !page.is_underfull() {
                return self.write_mempage(&page);
            }

            let (ppgno, k) = *stack.last().unwrap();
            let mut parent = self.read_mempage(ppgno)?;
            if parent.n_cell == 0 {
                // Lone child; nothing to balance against at this level
                self.write_mempage(&page)?;
                stack.pop();
                page = parent;
                continue;
            }

            // Prefer the left sibling; fall back to the right one
            let sep_idx = if k > 0 { k - 1 } else { 0 };
            let left_pgno = parent.child_at(sep_idx)?;
            let right_pgno = parent.child_at(sep_idx + 1)?;

            self.write_mempage(&page)?;
            drop(page);
            let left = self.read_mempage(left_pgno)?;
            let right = self.read_mempage(right_pgno)?;
            let sep_cell = parent.cell_bytes(sep_idx)?;

            // Demoted separator: for index trees the separator is a real
            // row; for interior merges it regains a child pointer
            let demoted: Option<Vec<u8>> = if left.is_leaf {
                if left.is_intkey {
                    None
                } else {
                    Some(sep_cell[4..].to_vec())
                }
            } else {
                let mut d = left.right_child().to_be_bytes().to_vec();
                d.extend_from_slice(&sep_cell[4..]);
                Some(d)
            };

            let mut cells = left.all_cells()?;
            if let Some(d) = &demoted {
                cells.push(d.clone());
            }
            cells.extend(right.all_cells()?);
            let combined_rc = if left.is_leaf { 0 } else { right.right_child() };
            let flags = left.flags;

            let total: usize = cells.iter().map(|c| c.len() + CELL_PTR_SIZE).sum();
            if total <= left.cell_area() {
                // Merge everything into the left page
                let mut merged = left;
                merged.rebuild(flags, &cells, combined_rc)?;
                self.write_mempage(&merged)?;
                drop(right);

                parent.set_child_at(sep_idx + 1, left_pgno)?;
                parent.remove_cell(sep_idx)?;
                self.write_mempage(&parent)?;
                self.free_page(right_pgno)?;

                stack.pop();
                page = parent;
                continue;
            }

            // Redistribute across both siblings
            let promote = !(left.is_leaf && left.is_intkey);
            let m = partition_point(&cells, promote);
            let (lcells, promoted, rcells): (Vec<Vec<u8>>, Option<Vec<u8>>, Vec<Vec<u8>>) =
                if promote {
                    (
                        cells[..m].to_vec(),
                        Some(cells[m].clone()),
                        cells[m + 1..].to_vec(),
                    )
                } else {
                    (cells[..m].to_vec(), None, cells[m..].to_vec())
                };

            let (left_rc, right_rc) = if left.is_leaf {
                (0, 0)
            } else {
                let p = promoted.as_ref().unwrap();
                let promoted_child =
                    read_u32(p, 0).ok_or_else(|| corrupt_page(left_pgno, "bad cell"))?;
                (promoted_child, combined_rc)
            };

            let mut new_left = left;
            new_left.rebuild(flags, &lcells, left_rc)?;
            let mut new_right = right;
            new_right.rebuild(flags, &rcells, right_rc)?;

            let new_sep = if new_left.is_leaf && new_left.is_intkey {
                let rowid = leaf_cell_rowid(lcells.last().unwrap())?;
                let mut sep = left_pgno.to_be_bytes().to_vec();
                let mut buf = [0u8; 9];
                let n = put_varint(&mut buf, rowid as u64);
                sep.extend_from_slice(&buf[..n]);
                sep
            } else {
                let p = promoted.as_ref().unwrap();
                let key_part = if new_left.is_leaf { &p[..] } else { &p[4..] };
                let mut sep = left_pgno.to_be_bytes().to_vec();
                sep.extend_from_slice(key_part);
                sep
            };

            self.write_mempage(&new_left)?;
            self.write_mempage(&new_right)?;

            parent.remove_cell(sep_idx)?;
            let pstack = stack[..stack.len() - 1].to_vec();
            return self.insert_cell_on_page(parent, &pstack, sep_idx, new_sep);
        }
    }
}

// ============================================================================
// Integrity check
// ============================================================================

/// Outcome of an integrity scan.
#[derive(Debug)]
pub struct IntegrityReport {
    pub errors: Vec<String>,
    pub pages_visited: u32,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Btree {
    /// Walk the given trees and the free-list, verifying structure, key
    /// order, and overflow chains. Collects up to `max_errors` findings.
    pub fn integrity_check(&mut self, roots: &[Pgno], max_errors: usize) -> Result<IntegrityReport> {
        let mut report = IntegrityReport {
            errors: Vec::new(),
            pages_visited: 0,
        };

        for &root in roots {
            let key_info = KeyInfo::new(16);
            self.check_subtree(root, &mut report, max_errors, None, None, &key_info)?;
            if report.errors.len() >= max_errors {
                report.errors.push("... further errors suppressed".into());
                return Ok(report);
            }
        }

        // Free-list accounting
        let mut counted = 0u32;
        let mut trunk = self.header.freelist_trunk;
        let mut hops = 0u32;
        while trunk != 0 {
            self.interrupt.check()?;
            if hops > self.header.page_count {
                report.errors.push("free-list trunk chain loops".into());
                break;
            }
            let data = self.read_raw(trunk)?;
            let n_leaf = read_u32(&data, 4).unwrap_or(0);
            counted += 1 + n_leaf;
            trunk = read_u32(&data, 0).unwrap_or(0);
            hops += 1;
        }
        if counted != self.header.freelist_count {
            report.errors.push(format!(
                "free-list holds {} pages but the header records {}",
                counted, self.header.freelist_count
            ));
        }

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn check_subtree(
        &mut self,
        pgno: Pgno,
        report: &mut IntegrityReport,
        max_errors: usize,
        min_rowid: Option<RowId>,
        max_rowid: Option<RowId>,
        key_info: &KeyInfo,
    ) -> Result<()> {
        if report.errors.len() >= max_errors {
            return Ok(());
        }
        self.interrupt.check()?;
        report.pages_visited += 1;

        if pgno == 0 || pgno > self.header.page_count.max(self.pager.page_count()) {
            report.errors.push(format!("child pointer {} out of range", pgno));
            return Ok(());
        }

        let page = match self.read_mempage(pgno) {
            Ok(p) => p,
            Err(e) => {
                report.errors.push(format!("page {}: {}", pgno, e));
                return Ok(());
            }
        };

        let mut prev_rowid: Option<RowId> = None;
        let mut prev_key: Option<Vec<u8>> = None;

        for i in 0..page.n_cell {
            let info = match page.cell(i) {
                Ok(info) => info,
                Err(e) => {
                    report.errors.push(format!("page {} cell {}: {}", pgno, i, e));
                    continue;
                }
            };

            if page.is_intkey {
                if let Some(prev) = prev_rowid {
                    if info.rowid <= prev {
                        report.errors.push(format!(
                            "page {}: rowid {} out of order after {}",
                            pgno, info.rowid, prev
                        ));
                    }
                }
                if let Some(min) = min_rowid {
                    if info.rowid <= min {
                        report
                            .errors
                            .push(format!("page {}: rowid {} below subtree bound", pgno, info.rowid));
                    }
                }
                if let Some(max) = max_rowid {
                    if info.rowid > max {
                        report
                            .errors
                            .push(format!("page {}: rowid {} above subtree bound", pgno, info.rowid));
                    }
                }
                prev_rowid = Some(info.rowid);
            } else if info.payload_len > 0 {
                let key = self.read_payload_of(&page, &info)?;
                if let Some(prev) = &prev_key {
                    if key_info.compare(prev, &key)? != std::cmp::Ordering::Less {
                        report
                            .errors
                            .push(format!("page {} cell {}: key out of order", pgno, i));
                    }
                }
                prev_key = Some(key);
            }

            // Overflow chain length must match the payload accounting
            if info.overflow != 0 {
                let cap = self.payload_limits().overflow_capacity();
                let expected = (info.payload_len - info.local_len).div_ceil(cap);
                let mut n = 0u32;
                let mut ov = info.overflow;
                while ov != 0 && n <= expected {
                    let data = self.read_raw(ov)?;
                    ov = read_u32(&data, 0).unwrap_or(0);
                    n += 1;
                }
                if n != expected {
                    report.errors.push(format!(
                        "page {} cell {}: overflow chain of {} pages, expected {}",
                        pgno, i, n, expected
                    ));
                }
            }

            if !page.is_leaf {
                // Children left of a separator carry keys up to it; the
                // previous separator bounds them from below
                let child_max = if page.is_intkey { Some(info.rowid) } else { None };
                let child_min = if page.is_intkey {
                    if i == 0 {
                        min_rowid
                    } else {
                        Some(page.cell(i - 1)?.rowid)
                    }
                } else {
                    None
                };
                self.check_subtree(info.child, report, max_errors, child_min, child_max, key_info)?;
            }
        }

        if !page.is_leaf {
            let last_sep = if page.is_intkey && page.n_cell > 0 {
                Some(page.cell(page.n_cell - 1)?.rowid)
            } else {
                min_rowid
            };
            self.check_subtree(
                page.right_child(),
                report,
                max_errors,
                last_sep,
                max_rowid,
                key_info,
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::os::mem::MemVfs;
    use crate::random::Prng;
    use crate::storage::record::{encode_record, CollSeq, KeyInfo};
    use crate::types::Value;

    fn mem_tree(vfs: &MemVfs, path: &str) -> Btree {
        let config = DbConfig {
            cache_size: 32,
            page_size: 1024,
            ..Default::default()
        };
        Btree::open(Arc::new(vfs.clone()), path, &config).unwrap()
    }

    fn new_table(tree: &mut Btree) -> Pgno {
        tree.begin_trans(true).unwrap();
        tree.create_table(false).unwrap()
    }

    fn row_payload(n: i64) -> Vec<u8> {
        encode_record(&[Value::Integer(n), Value::Text(format!("row-{}", n))])
    }

    fn collect_rowids(tree: &mut Btree, root: Pgno) -> Vec<RowId> {
        let cur = tree.cursor_open(root, None, false).unwrap();
        let mut out = Vec::new();
        let mut more = tree.cursor_first(cur).unwrap();
        while more {
            out.push(tree.cursor_rowid(cur).unwrap());
            more = tree.cursor_next(cur).unwrap();
        }
        tree.cursor_close(cur);
        out
    }

    #[test]
    fn test_new_db_has_valid_header() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        tree.begin_trans(true).unwrap();
        tree.commit().unwrap();

        let tree2 = mem_tree(&vfs, "t.db");
        assert_eq!(tree2.get_meta(MetaField::PageCount), 1);
        tree2.close().unwrap();
        tree.close().unwrap();
    }

    #[test]
    fn test_insert_and_read_single_row() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let cur = tree.cursor_open(root, None, true).unwrap();
        tree.table_insert(cur, 7, &row_payload(7)).unwrap();
        assert_eq!(tree.table_seek(cur, 7).unwrap(), 0);
        assert_eq!(tree.cursor_rowid(cur).unwrap(), 7);
        assert_eq!(tree.cursor_payload(cur).unwrap(), row_payload(7));
        tree.cursor_close(cur);
        tree.commit().unwrap();
        tree.close().unwrap();
    }

    #[test]
    fn test_rows_come_back_ordered() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let cur = tree.cursor_open(root, None, true).unwrap();
        // Insert shuffled
        let mut prng = Prng::from_seed(b"order");
        let mut ids: Vec<RowId> = (1..=500).collect();
        for i in (1..ids.len()).rev() {
            let j = prng.below(i as u64 + 1) as usize;
            ids.swap(i, j);
        }
        for &rowid in &ids {
            tree.table_insert(cur, rowid, &row_payload(rowid)).unwrap();
        }
        tree.cursor_close(cur);
        tree.commit().unwrap();

        tree.begin_trans(false).unwrap();
        let got = collect_rowids(&mut tree, root);
        let want: Vec<RowId> = (1..=500).collect();
        assert_eq!(got, want);
        tree.close().unwrap();
    }

    #[test]
    fn test_split_grows_and_persists() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let cur = tree.cursor_open(root, None, true).unwrap();
        for rowid in 1..=2000 {
            tree.table_insert(cur, rowid, &row_payload(rowid)).unwrap();
        }
        tree.cursor_close(cur);
        tree.commit().unwrap();
        assert!(tree.page_count() > 3, "tree never split");
        tree.close().unwrap();

        // Fresh connection reads everything back
        let mut tree = mem_tree(&vfs, "t.db");
        tree.begin_trans(false).unwrap();
        let got = collect_rowids(&mut tree, root);
        assert_eq!(got.len(), 2000);
        assert_eq!(got.first(), Some(&1));
        assert_eq!(got.last(), Some(&2000));
        tree.close().unwrap();
    }

    #[test]
    fn test_replace_overwrites_payload() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let cur = tree.cursor_open(root, None, true).unwrap();
        tree.table_insert(cur, 1, b"before").unwrap();
        tree.table_insert(cur, 1, b"after").unwrap();
        assert_eq!(tree.table_seek(cur, 1).unwrap(), 0);
        assert_eq!(tree.cursor_payload(cur).unwrap(), b"after");
        tree.cursor_close(cur);

        let got = collect_rowids(&mut tree, root);
        assert_eq!(got, vec![1]);
        tree.close().unwrap();
    }

    #[test]
    fn test_delete_and_rebalance() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let cur = tree.cursor_open(root, None, true).unwrap();
        for rowid in 1..=1000 {
            tree.table_insert(cur, rowid, &row_payload(rowid)).unwrap();
        }
        // Delete every third row
        for rowid in (1..=1000).filter(|r| r % 3 == 0) {
            assert_eq!(tree.table_seek(cur, rowid).unwrap(), 0);
            tree.cursor_delete(cur).unwrap();
        }
        tree.cursor_close(cur);
        tree.commit().unwrap();

        tree.begin_trans(false).unwrap();
        let got = collect_rowids(&mut tree, root);
        let want: Vec<RowId> = (1..=1000).filter(|r| r % 3 != 0).collect();
        assert_eq!(got, want);

        let report = tree.integrity_check(&[root], 50).unwrap();
        assert!(report.is_ok(), "integrity: {:?}", report.errors);
        tree.close().unwrap();
    }

    #[test]
    fn test_delete_then_next_continues() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let cur = tree.cursor_open(root, None, true).unwrap();
        for rowid in 1..=10 {
            tree.table_insert(cur, rowid, b"x").unwrap();
        }
        assert_eq!(tree.table_seek(cur, 5).unwrap(), 0);
        tree.cursor_delete(cur).unwrap();
        // The cursor re-seeks around the deleted key; next is row 6
        assert!(tree.cursor_next(cur).unwrap());
        assert_eq!(tree.cursor_rowid(cur).unwrap(), 6);
        tree.cursor_close(cur);
        tree.close().unwrap();
    }

    #[test]
    fn test_overflow_payload_roundtrip() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        // Payload much larger than a 1 KiB page
        let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let cur = tree.cursor_open(root, None, true).unwrap();
        tree.table_insert(cur, 1, &big).unwrap();
        tree.table_insert(cur, 2, b"small").unwrap();
        tree.cursor_close(cur);
        tree.commit().unwrap();

        tree.begin_trans(false).unwrap();
        let cur = tree.cursor_open(root, None, false).unwrap();
        assert_eq!(tree.table_seek(cur, 1).unwrap(), 0);
        assert_eq!(tree.cursor_payload_size(cur).unwrap(), 10_000);
        assert_eq!(tree.cursor_payload(cur).unwrap(), big);
        tree.cursor_close(cur);

        let report = tree.integrity_check(&[root], 10).unwrap();
        assert!(report.is_ok(), "integrity: {:?}", report.errors);
        tree.close().unwrap();
    }

    #[test]
    fn test_overflow_pages_are_reclaimed() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let big = vec![0xABu8; 8000];
        let cur = tree.cursor_open(root, None, true).unwrap();
        tree.table_insert(cur, 1, &big).unwrap();
        assert_eq!(tree.table_seek(cur, 1).unwrap(), 0);
        tree.cursor_delete(cur).unwrap();
        tree.cursor_close(cur);

        // The chain went back to the free-list
        assert!(tree.get_meta(MetaField::FreelistCount) >= 7);
        tree.commit().unwrap();
        tree.close().unwrap();
    }

    #[test]
    fn test_freelist_reuse_over_growth() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let cur = tree.cursor_open(root, None, true).unwrap();
        for rowid in 1..=1500 {
            tree.table_insert(cur, rowid, &row_payload(rowid)).unwrap();
        }
        tree.cursor_close(cur);
        tree.commit().unwrap();

        tree.begin_trans(true).unwrap();
        let pages_before = tree.get_meta(MetaField::PageCount);
        tree.clear_table(root).unwrap();
        assert!(tree.get_meta(MetaField::FreelistCount) > 0);

        // Refill: freed pages get used before the file grows
        let cur = tree.cursor_open(root, None, true).unwrap();
        for rowid in 1..=1500 {
            tree.table_insert(cur, rowid, &row_payload(rowid)).unwrap();
        }
        tree.cursor_close(cur);
        tree.commit().unwrap();
        assert!(tree.get_meta(MetaField::PageCount) <= pages_before + 1);
        tree.close().unwrap();
    }

    #[test]
    fn test_clear_table_counts_rows() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let cur = tree.cursor_open(root, None, true).unwrap();
        for rowid in 1..=321 {
            tree.table_insert(cur, rowid, b"r").unwrap();
        }
        tree.cursor_close(cur);
        assert_eq!(tree.clear_table(root).unwrap(), 321);
        assert!(collect_rowids(&mut tree, root).is_empty());
        tree.commit().unwrap();
        tree.close().unwrap();
    }

    #[test]
    fn test_drop_table_frees_root() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);
        let free_before = tree.get_meta(MetaField::FreelistCount);
        tree.drop_table(root).unwrap();
        assert!(tree.get_meta(MetaField::FreelistCount) > free_before);
        assert_eq!(
            tree.drop_table(1).unwrap_err().code(),
            ErrorCode::Misuse
        );
        tree.commit().unwrap();
        tree.close().unwrap();
    }

    #[test]
    fn test_index_tree_text_keys() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(true).unwrap();
        let ki = Arc::new(KeyInfo::new(1));

        let cur = tree.cursor_open(root, Some(ki.clone()), true).unwrap();
        let words = ["pear", "apple", "quince", "banana", "cherry", "fig"];
        for w in words {
            let key = encode_record(&[Value::Text(w.into())]);
            tree.index_insert(cur, &key).unwrap();
        }

        // Exact lookup
        let probe = encode_record(&[Value::Text("cherry".into())]);
        assert_eq!(tree.index_seek(cur, &probe).unwrap(), 0);

        // Ordered scan
        let mut seen = Vec::new();
        let mut more = tree.cursor_first(cur).unwrap();
        while more {
            let rec = tree.cursor_payload(cur).unwrap();
            let vals = crate::storage::record::decode_record(&rec).unwrap();
            if let Value::Text(s) = &vals[0] {
                seen.push(s.clone());
            }
            more = tree.cursor_next(cur).unwrap();
        }
        let mut want: Vec<String> = words.iter().map(|s| s.to_string()).collect();
        want.sort();
        assert_eq!(seen, want);
        tree.cursor_close(cur);
        tree.commit().unwrap();
        tree.close().unwrap();
    }

    #[test]
    fn test_index_duplicate_insert_is_noop() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(true).unwrap();
        let ki = Arc::new(KeyInfo::new(1));

        let cur = tree.cursor_open(root, Some(ki), true).unwrap();
        let key = encode_record(&[Value::Integer(42)]);
        tree.index_insert(cur, &key).unwrap();
        tree.index_insert(cur, &key).unwrap();

        let mut count = 0;
        let mut more = tree.cursor_first(cur).unwrap();
        while more {
            count += 1;
            more = tree.cursor_next(cur).unwrap();
        }
        assert_eq!(count, 1);
        tree.cursor_close(cur);
        tree.close().unwrap();
    }

    #[test]
    fn test_index_bulk_insert_delete() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(true).unwrap();
        let ki = Arc::new(KeyInfo::new(1));

        let cur = tree.cursor_open(root, Some(ki.clone()), true).unwrap();
        for i in 0..800i64 {
            // Scatter the insertion order
            let v = (i * 389) % 800;
            let key = encode_record(&[Value::Integer(v)]);
            tree.index_insert(cur, &key).unwrap();
        }

        // Delete half, including rows that sit on interior pages
        for v in 0..400i64 {
            let key = encode_record(&[Value::Integer(v)]);
            assert_eq!(tree.index_seek(cur, &key).unwrap(), 0, "missing {}", v);
            tree.cursor_delete(cur).unwrap();
        }

        // Scan what remains
        let mut remaining = Vec::new();
        let mut more = tree.cursor_first(cur).unwrap();
        while more {
            let rec = tree.cursor_payload(cur).unwrap();
            let vals = crate::storage::record::decode_record(&rec).unwrap();
            if let Value::Integer(v) = vals[0] {
                remaining.push(v);
            }
            more = tree.cursor_next(cur).unwrap();
        }
        let want: Vec<i64> = (400..800).collect();
        assert_eq!(remaining, want);
        tree.cursor_close(cur);

        let report = tree.integrity_check(&[root], 50).unwrap();
        assert!(report.is_ok(), "integrity: {:?}", report.errors);
        tree.commit().unwrap();
        tree.close().unwrap();
    }

    #[test]
    fn test_nocase_collation_in_tree() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        tree.begin_trans(true).unwrap();
        let root = tree.create_table(true).unwrap();
        let ki = Arc::new(KeyInfo::with_collations(vec![CollSeq::NoCase]));

        let cur = tree.cursor_open(root, Some(ki), true).unwrap();
        let key = encode_record(&[Value::Text("Hello".into())]);
        tree.index_insert(cur, &key).unwrap();
        let probe = encode_record(&[Value::Text("hello".into())]);
        assert_eq!(tree.index_seek(cur, &probe).unwrap(), 0);
        tree.cursor_close(cur);
        tree.close().unwrap();
    }

    #[test]
    fn test_prev_walks_backwards() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let cur = tree.cursor_open(root, None, true).unwrap();
        for rowid in 1..=300 {
            tree.table_insert(cur, rowid, b"p").unwrap();
        }
        let mut got = Vec::new();
        let mut more = tree.cursor_last(cur).unwrap();
        while more {
            got.push(tree.cursor_rowid(cur).unwrap());
            more = tree.cursor_prev(cur).unwrap();
        }
        let want: Vec<RowId> = (1..=300).rev().collect();
        assert_eq!(got, want);
        tree.cursor_close(cur);
        tree.close().unwrap();
    }

    #[test]
    fn test_two_cursors_one_writes() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let writer = tree.cursor_open(root, None, true).unwrap();
        for rowid in 1..=200 {
            tree.table_insert(writer, rowid, b"w").unwrap();
        }

        let reader = tree.cursor_open(root, None, false).unwrap();
        assert!(tree.cursor_first(reader).unwrap());
        assert_eq!(tree.cursor_rowid(reader).unwrap(), 1);

        // The write invalidates the reader, which must re-seek and
        // continue from where it stood
        tree.table_insert(writer, 500, b"w").unwrap();
        assert!(tree.cursor_next(reader).unwrap());
        assert_eq!(tree.cursor_rowid(reader).unwrap(), 2);

        tree.cursor_close(writer);
        tree.cursor_close(reader);
        tree.close().unwrap();
    }

    #[test]
    fn test_schema_cookie_detection() {
        let vfs = MemVfs::new();
        let mut a = mem_tree(&vfs, "t.db");
        a.begin_trans(true).unwrap();
        a.commit().unwrap();

        // "Prepare" against the current cookie
        a.begin_trans(false).unwrap();
        let seen = a.get_meta(MetaField::SchemaCookie);
        a.check_schema_cookie(seen).unwrap();

        // Another connection changes the schema
        let mut b = mem_tree(&vfs, "t.db");
        b.begin_trans(true).unwrap();
        let cookie = b.get_meta(MetaField::SchemaCookie);
        b.update_meta(MetaField::SchemaCookie, cookie + 1).unwrap();
        b.commit().unwrap();
        b.close().unwrap();

        // The prepared statement is now stale
        assert_eq!(
            a.check_schema_cookie(seen).unwrap_err().code(),
            ErrorCode::Schema
        );
        a.close().unwrap();
    }

    #[test]
    fn test_interrupt_unwinds_scan() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let cur = tree.cursor_open(root, None, true).unwrap();
        for rowid in 1..=50 {
            tree.table_insert(cur, rowid, b"i").unwrap();
        }

        let flag = tree.interrupt_handle();
        assert!(tree.cursor_first(cur).unwrap());
        flag.interrupt();
        assert_eq!(
            tree.cursor_next(cur).unwrap_err().code(),
            ErrorCode::Interrupt
        );
        flag.clear();
        assert!(tree.cursor_next(cur).unwrap());
        tree.cursor_close(cur);
        tree.close().unwrap();
    }

    #[test]
    fn test_rollback_restores_tree() {
        let vfs = MemVfs::new();
        let mut tree = mem_tree(&vfs, "t.db");
        let root = new_table(&mut tree);

        let cur = tree.cursor_open(root, None, true).unwrap();
        for rowid in 1..=100 {
            tree.table_insert(cur, rowid, b"k").unwrap();
        }
        tree.cursor_close(cur);
        tree.commit().unwrap();

        tree.begin_trans(true).unwrap();
        let cur = tree.cursor_open(root, None, true).unwrap();
        for rowid in 101..=200 {
            tree.table_insert(cur, rowid, b"k").unwrap();
        }
        tree.cursor_close(cur);
        tree.rollback().unwrap();

        tree.begin_trans(false).unwrap();
        assert_eq!(collect_rowids(&mut tree, root).len(), 100);
        tree.close().unwrap();
    }

    #[test]
    fn test_open_rejects_garbage_file() {
        let vfs = MemVfs::new();
        {
            use crate::os::vfs::{OpenFlags, Vfs as _};
            let mut f = vfs
                .open(Some("junk.db"), OpenFlags::READWRITE | OpenFlags::CREATE)
                .unwrap();
            f.write(&[0x5A; 2048], 0).unwrap();
        }
        let config = DbConfig {
            page_size: 1024,
            ..Default::default()
        };
        let err = match Btree::open(Arc::new(vfs), "junk.db", &config) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.code(), ErrorCode::Corrupt);
    }

    #[test]
    fn test_temp_tree_memory() {
        let config = DbConfig {
            temp_store: crate::config::TempStore::Memory,
            page_size: 1024,
            ..Default::default()
        };
        let mut tree = Btree::open_temp(&config).unwrap();
        let root = new_table(&mut tree);
        let cur = tree.cursor_open(root, None, true).unwrap();
        tree.table_insert(cur, 1, b"tmp").unwrap();
        assert_eq!(tree.table_seek(cur, 1).unwrap(), 0);
        tree.cursor_close(cur);
        tree.commit().unwrap();
        tree.close().unwrap();
    }
}
