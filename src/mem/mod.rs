//! Memory allocator interface
//!
//! The core never calls the host allocator directly for page buffers and
//! other bounded allocations; it goes through the injected `Allocator`.
//! `SystemAllocator` wraps the Rust global allocator and is the default.
//! `pool::BuddyAllocator` serves environments where the host allocator
//! fragments badly.

#![allow(clippy::not_unsafe_ptr_arg_deref)]

pub mod pool;

use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::Mutex;

// ============================================================================
// Allocator Trait
// ============================================================================

/// Pluggable memory allocator. All methods must be thread-safe.
pub trait Allocator: Send + Sync {
    /// Allocate at least `size` bytes, 8-byte aligned. Null on failure.
    fn allocate(&self, size: usize) -> *mut u8;

    /// Change the size of an allocation. Null on failure, in which case
    /// the original allocation is untouched.
    fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8;

    /// Free an allocation. Null is a no-op.
    fn free(&self, ptr: *mut u8);

    /// Size of the allocation behind `ptr` (0 for null).
    fn size_of_allocation(&self, ptr: *mut u8) -> usize;

    /// Round a request up to a size this allocator can serve exactly.
    fn roundup(&self, size: usize) -> usize;
}

// ============================================================================
// System Allocator
// ============================================================================

/// Alignment of every block the system allocator hands out.
const SYSTEM_ALIGN: usize = 8;

/// Wrapper around the Rust global allocator. Blocks carry no header:
/// sizes live in a registry keyed by block address, so every allocation
/// is exactly the requested size and the registry doubles as a live-block
/// census for leak accounting.
pub struct SystemAllocator {
    sizes: Mutex<HashMap<usize, usize>>,
}

fn system_layout(size: usize) -> Layout {
    // Size and alignment are both known here; nothing rides in the block
    Layout::from_size_align(size, SYSTEM_ALIGN).unwrap()
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self {
            sizes: Mutex::new(HashMap::new()),
        }
    }

    /// Number of blocks currently allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.sizes.lock().unwrap().len()
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return std::ptr::null_mut();
        }
        let ptr = unsafe { std::alloc::alloc(system_layout(size)) };
        if !ptr.is_null() {
            self.sizes.lock().unwrap().insert(ptr as usize, size);
        }
        ptr
    }

    fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return std::ptr::null_mut();
        }

        // The registry supplies the layout the global allocator wants back
        let old_size = match self.sizes.lock().unwrap().get(&(ptr as usize)).copied() {
            Some(size) => size,
            None => return std::ptr::null_mut(),
        };

        let new_ptr = unsafe { std::alloc::realloc(ptr, system_layout(old_size), new_size) };
        if new_ptr.is_null() {
            // Original block is untouched and stays registered
            return std::ptr::null_mut();
        }

        let mut sizes = self.sizes.lock().unwrap();
        sizes.remove(&(ptr as usize));
        sizes.insert(new_ptr as usize, new_size);
        new_ptr
    }

    fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // A pointer we never handed out is ignored rather than freed
        if let Some(size) = self.sizes.lock().unwrap().remove(&(ptr as usize)) {
            unsafe { std::alloc::dealloc(ptr, system_layout(size)) };
        }
    }

    fn size_of_allocation(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        self.sizes
            .lock()
            .unwrap()
            .get(&(ptr as usize))
            .copied()
            .unwrap_or(0)
    }

    fn roundup(&self, size: usize) -> usize {
        (size + 7) & !7
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_free() {
        let alloc = SystemAllocator::new();
        let ptr = alloc.allocate(100);
        assert!(!ptr.is_null());
        unsafe {
            std::ptr::write_bytes(ptr, 0x55, 100);
        }
        assert_eq!(alloc.size_of_allocation(ptr), 100);
        alloc.free(ptr);
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn test_zero_size_is_null() {
        let alloc = SystemAllocator::new();
        assert!(alloc.allocate(0).is_null());
        assert_eq!(alloc.size_of_allocation(std::ptr::null_mut()), 0);
        alloc.free(std::ptr::null_mut());
    }

    #[test]
    fn test_resize_preserves_prefix() {
        let alloc = SystemAllocator::new();
        let ptr = alloc.allocate(64);
        unsafe {
            std::ptr::write_bytes(ptr, 0xAA, 64);
        }

        let grown = alloc.resize(ptr, 256);
        assert!(!grown.is_null());
        assert_eq!(alloc.size_of_allocation(grown), 256);
        unsafe {
            let slice = std::slice::from_raw_parts(grown, 64);
            assert!(slice.iter().all(|&b| b == 0xAA));
        }
        alloc.free(grown);
    }

    #[test]
    fn test_registry_tracks_outstanding_blocks() {
        let alloc = SystemAllocator::new();
        let a = alloc.allocate(16);
        let b = alloc.allocate(32);
        let c = alloc.allocate(48);
        assert_eq!(alloc.outstanding(), 3);

        alloc.free(b);
        assert_eq!(alloc.outstanding(), 2);
        assert_eq!(alloc.size_of_allocation(a), 16);
        assert_eq!(alloc.size_of_allocation(c), 48);

        alloc.free(a);
        alloc.free(c);
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn test_foreign_pointer_is_ignored() {
        let alloc = SystemAllocator::new();
        let mut local = 0u64;
        let bogus = &mut local as *mut u64 as *mut u8;
        // Neither freeing nor sizing an unregistered pointer does anything
        alloc.free(bogus);
        assert_eq!(alloc.size_of_allocation(bogus), 0);
        assert!(alloc.resize(bogus, 64).is_null());
    }

    #[test]
    fn test_roundup() {
        let alloc = SystemAllocator::new();
        assert_eq!(alloc.roundup(1), 8);
        assert_eq!(alloc.roundup(8), 8);
        assert_eq!(alloc.roundup(9), 16);
    }

    #[test]
    fn test_alignment() {
        let alloc = SystemAllocator::new();
        for _ in 0..32 {
            let ptr = alloc.allocate(17);
            assert_eq!((ptr as usize) % 8, 0);
            alloc.free(ptr);
        }
    }
}
