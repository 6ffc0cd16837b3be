//! Buddy pool allocator
//!
//! Serves allocations out of a fixed arena partitioned into power-of-two
//! blocks: a free list per size class, blocks split on demand, and buddies
//! coalesced back together on free. Every internal link is an atom index
//! into side tables; the only pointer arithmetic is at the public
//! boundary where offsets become addresses inside the arena.

#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::sync::Mutex;

use super::Allocator;

/// Control-byte flag: the block starting at this atom is free.
const CTRL_FREE: u8 = 0x20;
/// Control-byte mask for log2 of the block size in atoms.
const CTRL_LOGSIZE: u8 = 0x1f;

const NO_LINK: u32 = u32::MAX;

struct PoolState {
    /// The arena. Boxed slice so the base address never moves.
    arena: Box<[u8]>,
    /// One control byte per atom; meaningful at block starts.
    ctrl: Vec<u8>,
    /// Doubly-linked free lists, one head per size class.
    free_heads: Vec<u32>,
    next: Vec<u32>,
    prev: Vec<u32>,
    /// log2 of atom count (arena holds 2^log_atoms atoms)
    log_atoms: u32,
    alloc_count: u64,
    free_count: u64,
    outstanding: usize,
    highwater: usize,
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub arena_size: usize,
    pub outstanding_bytes: usize,
    pub highwater_bytes: usize,
    pub alloc_count: u64,
    pub free_count: u64,
}

/// Buddy allocator over a fixed arena.
pub struct BuddyAllocator {
    /// Atom size: the smallest block handed out (power of two).
    atom: usize,
    state: Mutex<PoolState>,
}

// Raw pointers into the arena are only dereferenced by callers; all
// metadata access goes through the mutex.
unsafe impl Send for BuddyAllocator {}
unsafe impl Sync for BuddyAllocator {}

impl BuddyAllocator {
    /// Create a pool of `arena_size` bytes with the given minimum block
    /// size. Both round to powers of two; the arena rounds down.
    pub fn new(arena_size: usize, min_block: usize) -> Self {
        let atom = min_block.max(8).next_power_of_two();
        let n_atoms = (arena_size / atom).next_power_of_two() / 2;
        let n_atoms = n_atoms.max(1);
        let n_atoms = if n_atoms * atom * 2 <= arena_size {
            n_atoms * 2
        } else {
            n_atoms
        };
        let log_atoms = n_atoms.trailing_zeros();

        let mut state = PoolState {
            arena: vec![0u8; n_atoms * atom].into_boxed_slice(),
            ctrl: vec![0u8; n_atoms],
            free_heads: vec![NO_LINK; log_atoms as usize + 1],
            next: vec![NO_LINK; n_atoms],
            prev: vec![NO_LINK; n_atoms],
            log_atoms,
            alloc_count: 0,
            free_count: 0,
            outstanding: 0,
            highwater: 0,
        };

        // The arena starts as one maximal free block
        state.ctrl[0] = CTRL_FREE | log_atoms as u8;
        state.free_heads[log_atoms as usize] = 0;

        Self {
            atom,
            state: Mutex::new(state),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            arena_size: state.arena.len(),
            outstanding_bytes: state.outstanding,
            highwater_bytes: state.highwater,
            alloc_count: state.alloc_count,
            free_count: state.free_count,
        }
    }

    fn push_free(state: &mut PoolState, block: u32, log: u32) {
        state.ctrl[block as usize] = CTRL_FREE | log as u8;
        let head = state.free_heads[log as usize];
        state.next[block as usize] = head;
        state.prev[block as usize] = NO_LINK;
        if head != NO_LINK {
            state.prev[head as usize] = block;
        }
        state.free_heads[log as usize] = block;
    }

    fn unlink_free(state: &mut PoolState, block: u32, log: u32) {
        let next = state.next[block as usize];
        let prev = state.prev[block as usize];
        if prev != NO_LINK {
            state.next[prev as usize] = next;
        } else {
            state.free_heads[log as usize] = next;
        }
        if next != NO_LINK {
            state.prev[next as usize] = prev;
        }
        state.next[block as usize] = NO_LINK;
        state.prev[block as usize] = NO_LINK;
    }

    /// Size class (log2 of atoms) for a byte request.
    fn class_for(&self, size: usize) -> u32 {
        let atoms = size.div_ceil(self.atom).next_power_of_two();
        atoms.trailing_zeros()
    }

    fn offset_of(&self, state: &PoolState, ptr: *mut u8) -> Option<usize> {
        let base = state.arena.as_ptr() as usize;
        let addr = ptr as usize;
        if addr < base || addr >= base + state.arena.len() {
            return None;
        }
        let off = addr - base;
        if off % self.atom != 0 {
            return None;
        }
        Some(off)
    }
}

impl Allocator for BuddyAllocator {
    fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return std::ptr::null_mut();
        }

        let log = self.class_for(size);
        let mut state = self.state.lock().unwrap();
        if log > state.log_atoms {
            return std::ptr::null_mut();
        }

        // Smallest class with a free block
        let mut k = log;
        while k <= state.log_atoms && state.free_heads[k as usize] == NO_LINK {
            k += 1;
        }
        if k > state.log_atoms {
            return std::ptr::null_mut();
        }

        let block = state.free_heads[k as usize];
        Self::unlink_free(&mut state, block, k);

        // Split down, parking the upper buddy of each split
        while k > log {
            k -= 1;
            let buddy = block + (1u32 << k);
            Self::push_free(&mut state, buddy, k);
        }

        state.ctrl[block as usize] = log as u8;
        state.alloc_count += 1;
        let bytes = (1usize << log) * self.atom;
        state.outstanding += bytes;
        state.highwater = state.highwater.max(state.outstanding);

        let off = block as usize * self.atom;
        unsafe { state.arena.as_mut_ptr().add(off) }
    }

    fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return std::ptr::null_mut();
        }

        let old_size = self.size_of_allocation(ptr);
        if new_size <= old_size && self.roundup(new_size) == old_size {
            return ptr;
        }

        let new_ptr = self.allocate(new_size);
        if new_ptr.is_null() {
            return std::ptr::null_mut();
        }
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
        }
        self.free(ptr);
        new_ptr
    }

    fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let mut state = self.state.lock().unwrap();
        let off = match self.offset_of(&state, ptr) {
            Some(o) => o,
            None => return,
        };

        let mut block = (off / self.atom) as u32;
        let mut log = (state.ctrl[block as usize] & CTRL_LOGSIZE) as u32;
        if state.ctrl[block as usize] & CTRL_FREE != 0 {
            // Double free; leave the lists intact
            return;
        }

        state.free_count += 1;
        state.outstanding -= (1usize << log) * self.atom;

        // Coalesce with the buddy while it is free and the same size
        while log < state.log_atoms {
            let buddy = block ^ (1u32 << log);
            if state.ctrl[buddy as usize] != (CTRL_FREE | log as u8) {
                break;
            }
            Self::unlink_free(&mut state, buddy, log);
            state.ctrl[buddy as usize] = 0;
            block = block.min(buddy);
            log += 1;
        }

        Self::push_free(&mut state, block, log);
    }

    fn size_of_allocation(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let state = self.state.lock().unwrap();
        match self.offset_of(&state, ptr) {
            Some(off) => {
                let block = off / self.atom;
                let log = (state.ctrl[block] & CTRL_LOGSIZE) as u32;
                (1usize << log) * self.atom
            }
            None => 0,
        }
    }

    fn roundup(&self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        size.div_ceil(self.atom).next_power_of_two() * self.atom
    }
}

// ============================================================================
// Tests
// ============================================================================
