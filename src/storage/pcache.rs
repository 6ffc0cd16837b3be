//! Page cache
//!
//! Frames live in an arena indexed by `FrameId`; hash-bucket chains and the
//! LRU list are integer links into the same arena, so no frame ever holds a
//! pointer to another. A frame is on the LRU list exactly when its
//! refcount is zero, which is also the only state in which it may be
//! evicted. The cache itself never touches disk: the pager decides when a
//! dirty victim may be written out and tells the cache to evict afterwards.

use bitflags::bitflags;

use crate::types::Pgno;

bitflags! {
    /// Frame state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Contents differ from the on-disk page
        const DIRTY = 0x01;
        /// Pre-image appended to the journal, not yet known durable
        const NEED_SYNC = 0x02;
        /// `write` has blessed this frame for mutation in this transaction
        const WRITEABLE = 0x04;
    }
}

/// Arena index of a cached frame.
pub type FrameId = usize;

const NO_FRAME: usize = usize::MAX;

/// One page-sized buffer plus its cache bookkeeping.
pub struct Frame {
    pub pgno: Pgno,
    pub data: Vec<u8>,
    pub flags: FrameFlags,
    pub n_ref: u32,
    hash_next: usize,
    lru_prev: usize,
    lru_next: usize,
    in_use: bool,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            pgno: 0,
            data: vec![0u8; page_size],
            flags: FrameFlags::empty(),
            n_ref: 0,
            hash_next: NO_FRAME,
            lru_prev: NO_FRAME,
            lru_next: NO_FRAME,
            in_use: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(FrameFlags::DIRTY)
    }
}

/// Reference-counted frame cache with LRU recycling.
pub struct PageCache {
    frames: Vec<Frame>,
    /// Recycled arena slots
    free_slots: Vec<FrameId>,
    /// Hash heads; chain via `Frame::hash_next`
    buckets: Vec<usize>,
    /// LRU list: head is the coldest unreferenced frame
    lru_head: usize,
    lru_tail: usize,
    page_size: usize,
    max_frames: usize,
    n_used: usize,
}

impl PageCache {
    pub fn new(page_size: usize, max_frames: usize) -> Self {
        let max_frames = max_frames.max(1);
        let n_buckets = (max_frames * 2).next_power_of_two().max(16);
        Self {
            frames: Vec::new(),
            free_slots: Vec::new(),
            buckets: vec![NO_FRAME; n_buckets],
            lru_head: NO_FRAME,
            lru_tail: NO_FRAME,
            page_size,
            max_frames,
            n_used: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Frames currently holding a page.
    pub fn frames_used(&self) -> usize {
        self.n_used
    }

    pub fn at_capacity(&self) -> bool {
        self.n_used >= self.max_frames
    }

    pub fn set_max_frames(&mut self, max_frames: usize) {
        self.max_frames = max_frames.max(1);
    }

    pub fn frame(&self, id: FrameId) -> &Frame {
        &self.frames[id]
    }

    pub fn frame_mut(&mut self, id: FrameId) -> &mut Frame {
        &mut self.frames[id]
    }

    fn bucket_of(&self, pgno: Pgno) -> usize {
        // Multiplicative hash; bucket count is a power of two
        (pgno as usize).wrapping_mul(0x9e37_79b1) & (self.buckets.len() - 1)
    }

    // ------------------------------------------------------------------
    // Hash chain maintenance
    // ------------------------------------------------------------------

    fn hash_insert(&mut self, id: FrameId) {
        let b = self.bucket_of(self.frames[id].pgno);
        self.frames[id].hash_next = self.buckets[b];
        self.buckets[b] = id;
    }

    fn hash_remove(&mut self, id: FrameId) {
        let b = self.bucket_of(self.frames[id].pgno);
        let mut cur = self.buckets[b];
        if cur == id {
            self.buckets[b] = self.frames[id].hash_next;
        } else {
            while cur != NO_FRAME {
                let next = self.frames[cur].hash_next;
                if next == id {
                    self.frames[cur].hash_next = self.frames[id].hash_next;
                    break;
                }
                cur = next;
            }
        }
        self.frames[id].hash_next = NO_FRAME;
    }

    // ------------------------------------------------------------------
    // LRU maintenance
    // ------------------------------------------------------------------

    fn lru_push_tail(&mut self, id: FrameId) {
        self.frames[id].lru_next = NO_FRAME;
        self.frames[id].lru_prev = self.lru_tail;
        if self.lru_tail != NO_FRAME {
            self.frames[self.lru_tail].lru_next = id;
        } else {
            self.lru_head = id;
        }
        self.lru_tail = id;
    }

    fn lru_remove(&mut self, id: FrameId) {
        let prev = self.frames[id].lru_prev;
        let next = self.frames[id].lru_next;
        if prev != NO_FRAME {
            self.frames[prev].lru_next = next;
        } else if self.lru_head == id {
            self.lru_head = next;
        }
        if next != NO_FRAME {
            self.frames[next].lru_prev = prev;
        } else if self.lru_tail == id {
            self.lru_tail = prev;
        }
        self.frames[id].lru_prev = NO_FRAME;
        self.frames[id].lru_next = NO_FRAME;
    }

    // ------------------------------------------------------------------
    // Lookup / allocate / release / evict
    // ------------------------------------------------------------------

    /// Find a cached page without pinning it.
    pub fn lookup(&self, pgno: Pgno) -> Option<FrameId> {
        let mut cur = self.buckets[self.bucket_of(pgno)];
        while cur != NO_FRAME {
            if self.frames[cur].pgno == pgno {
                return Some(cur);
            }
            cur = self.frames[cur].hash_next;
        }
        None
    }

    /// Find and pin a cached page.
    pub fn fetch(&mut self, pgno: Pgno) -> Option<FrameId> {
        let id = self.lookup(pgno)?;
        if self.frames[id].n_ref == 0 {
            self.lru_remove(id);
        }
        self.frames[id].n_ref += 1;
        Some(id)
    }

    /// Install a new page in a fresh frame, pinned once, zero-filled.
    /// The caller checks capacity and evicts first.
    pub fn allocate(&mut self, pgno: Pgno) -> FrameId {
        debug_assert!(self.lookup(pgno).is_none());

        let id = match self.free_slots.pop() {
            Some(id) => id,
            None => {
                let page_size = self.page_size;
                self.frames.push(Frame::new(page_size));
                self.frames.len() - 1
            }
        };

        let frame = &mut self.frames[id];
        frame.pgno = pgno;
        frame.data.fill(0);
        frame.flags = FrameFlags::empty();
        frame.n_ref = 1;
        frame.in_use = true;
        self.n_used += 1;
        self.hash_insert(id);
        id
    }

    /// Bump the pin count of an already pinned frame.
    pub fn reference(&mut self, id: FrameId) {
        debug_assert!(self.frames[id].in_use);
        self.frames[id].n_ref += 1;
    }

    /// Drop one pin; the frame joins the LRU list at zero.
    pub fn release(&mut self, id: FrameId) {
        let frame = &mut self.frames[id];
        debug_assert!(frame.n_ref > 0);
        frame.n_ref -= 1;
        if frame.n_ref == 0 {
            self.lru_push_tail(id);
        }
    }

    /// Coldest unreferenced frame, if any.
    pub fn evict_candidate(&self) -> Option<FrameId> {
        if self.lru_head == NO_FRAME {
            None
        } else {
            Some(self.lru_head)
        }
    }

    /// Remove an unreferenced frame from the cache. Dirty contents must
    /// have been dealt with by the caller beforehand.
    pub fn evict(&mut self, id: FrameId) {
        debug_assert_eq!(self.frames[id].n_ref, 0);
        self.lru_remove(id);
        self.hash_remove(id);
        let frame = &mut self.frames[id];
        frame.in_use = false;
        frame.pgno = 0;
        frame.flags = FrameFlags::empty();
        self.n_used -= 1;
        self.free_slots.push(id);
    }

    // ------------------------------------------------------------------
    // Dirty tracking
    // ------------------------------------------------------------------

    pub fn make_dirty(&mut self, id: FrameId) {
        self.frames[id].flags.insert(FrameFlags::DIRTY);
    }

    pub fn make_clean(&mut self, id: FrameId) {
        self.frames[id]
            .flags
            .remove(FrameFlags::DIRTY | FrameFlags::NEED_SYNC | FrameFlags::WRITEABLE);
    }

    /// Clear dirty state everywhere (end of transaction).
    pub fn clean_all(&mut self) {
        for frame in self.frames.iter_mut().filter(|f| f.in_use) {
            frame
                .flags
                .remove(FrameFlags::DIRTY | FrameFlags::NEED_SYNC | FrameFlags::WRITEABLE);
        }
    }

    /// Dirty page numbers in ascending order, for the commit sweep.
    pub fn dirty_pages(&self) -> Vec<(Pgno, FrameId)> {
        let mut dirty: Vec<(Pgno, FrameId)> = self
            .frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.in_use && f.is_dirty())
            .map(|(id, f)| (f.pgno, id))
            .collect();
        dirty.sort_unstable_by_key(|&(pgno, _)| pgno);
        dirty
    }

    /// Discard every cached page numbered `first_gone` or higher.
    /// Referenced frames among them must not exist (caller contract).
    pub fn truncate(&mut self, first_gone: Pgno) {
        let doomed: Vec<FrameId> = self
            .frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.in_use && f.pgno >= first_gone)
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            debug_assert_eq!(self.frames[id].n_ref, 0);
            if self.frames[id].n_ref == 0 {
                self.evict(id);
            }
        }
    }

    /// Drop every unreferenced frame. Used when another connection has
    /// changed the file underneath us and the whole cache is stale.
    pub fn clear(&mut self) {
        let doomed: Vec<FrameId> = self
            .frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.in_use && f.n_ref == 0)
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            self.evict(id);
        }
    }

    /// Sum of all pins; zero is a precondition of a clean close.
    pub fn total_refs(&self) -> u64 {
        self.frames
            .iter()
            .filter(|f| f.in_use)
            .map(|f| f.n_ref as u64)
            .sum()
    }
}

// ============================================================================
// Tests
// ============================================================================
