//! Configuration surface
//!
//! Per-connection options consumed by the pager and B-tree, the busy and
//! page-codec hooks, the asynchronous interrupt flag, and the process-wide
//! `Context` that carries the default VFS and allocator. The context is
//! built once on first use and never mutated; everything a handle needs is
//! threaded through it explicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::mem::{Allocator, SystemAllocator};
use crate::os::vfs::Vfs;
use crate::types::Pgno;

// ============================================================================
// Option enums
// ============================================================================

/// How aggressively commits reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// No fsyncs; durability left to the OS. Fast and unsafe.
    Off,
    /// Journal fsync before the main-file update.
    #[default]
    Normal,
    /// Normal plus the main-file fsync before the journal is dropped.
    Full,
}

/// Where temporary trees live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TempStore {
    #[default]
    File,
    Memory,
}

/// Text encoding recorded at database creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TextEncoding {
    #[default]
    Utf8 = 1,
    Legacy = 2,
}

impl TextEncoding {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(TextEncoding::Utf8),
            2 => Some(TextEncoding::Legacy),
            _ => None,
        }
    }
}

// ============================================================================
// Per-connection configuration
// ============================================================================

/// Options the storage core consumes. Everything else belongs to the
/// excluded outer layers.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Upper bound on cached frames.
    pub cache_size: usize,
    /// Page size used when creating a new database; validated on open.
    pub page_size: u32,
    /// Maximum total wait inside the busy-retry loop, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Commit durability mode.
    pub sync_mode: SyncMode,
    /// Backing store for temporary trees.
    pub temp_store: TempStore,
    /// Encoding fixed at creation.
    pub text_encoding: TextEncoding,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            cache_size: 2000,
            page_size: 4096,
            busy_timeout_ms: 0,
            sync_mode: SyncMode::Normal,
            temp_store: TempStore::File,
            text_encoding: TextEncoding::Utf8,
        }
    }
}

// ============================================================================
// Busy handler
// ============================================================================

/// Caller-supplied reaction to a Busy lock conflict. Invoked with the
/// number of prior attempts for this acquisition; returning `false` gives
/// up and surfaces `Busy`. The handler performs its own sleeping.
pub trait BusyHandler: Send {
    fn retry(&mut self, count: u32) -> bool;
}

impl<F: FnMut(u32) -> bool + Send> BusyHandler for F {
    fn retry(&mut self, count: u32) -> bool {
        self(count)
    }
}

/// Sleep-and-retry handler bounded by a total timeout.
pub struct TimeoutBusyHandler {
    timeout_ms: u64,
    slept_ms: u64,
}

// Per-attempt delays; later attempts back off harder.
const BUSY_DELAYS_MS: [u64; 12] = [1, 2, 5, 10, 15, 20, 25, 25, 25, 50, 50, 100];

impl TimeoutBusyHandler {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            slept_ms: 0,
        }
    }
}

impl BusyHandler for TimeoutBusyHandler {
    fn retry(&mut self, count: u32) -> bool {
        let idx = (count as usize).min(BUSY_DELAYS_MS.len() - 1);
        let mut delay = BUSY_DELAYS_MS[idx];
        if self.slept_ms >= self.timeout_ms {
            return false;
        }
        if self.slept_ms + delay > self.timeout_ms {
            delay = self.timeout_ms - self.slept_ms;
        }
        std::thread::sleep(std::time::Duration::from_millis(delay));
        self.slept_ms += delay;
        true
    }
}

// ============================================================================
// Page codec hook
// ============================================================================

/// Optional transform applied to page images at the VFS boundary. The
/// core makes no cryptographic decisions; both directions must be exact
/// inverses and size-preserving.
pub trait PageCodec: Send {
    /// Transform a page on its way to disk.
    fn encode(&self, page: &mut [u8], pgno: Pgno);
    /// Transform a page read from disk.
    fn decode(&self, page: &mut [u8], pgno: Pgno);
}

// ============================================================================
// Interrupt flag
// ============================================================================

/// Cancellation flag set asynchronously and polled at operation
/// boundaries. Observing it unwinds the current statement; it never rolls
/// back a transaction by itself.
#[derive(Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Poll point: error out when an interrupt is pending.
    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            Err(Error::new(ErrorCode::Interrupt))
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Process context
// ============================================================================

/// Process-wide defaults threaded through open handles. Immutable after
/// construction.
pub struct Context {
    vfs: Arc<dyn Vfs>,
    allocator: Arc<dyn Allocator>,
}

impl Context {
    pub fn new(vfs: Arc<dyn Vfs>, allocator: Arc<dyn Allocator>) -> Self {
        Self { vfs, allocator }
    }

    /// The default context: platform VFS plus the system allocator.
    pub fn global() -> &'static Context {
        lazy_static::lazy_static! {
            static ref GLOBAL: Context = Context::new(default_vfs(), Arc::new(SystemAllocator::new()));
        }
        &GLOBAL
    }

    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }
}

#[cfg(unix)]
fn default_vfs() -> Arc<dyn Vfs> {
    Arc::new(crate::os::unix::UnixVfs::new())
}

#[cfg(not(unix))]
fn default_vfs() -> Arc<dyn Vfs> {
    Arc::new(crate::os::mem::MemVfs::new())
}

// ============================================================================
// Tests
// ============================================================================
