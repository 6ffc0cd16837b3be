//! File system adapter traits
//!
//! The storage core talks to the host only through `Vfs` (path-level
//! operations) and `VfsFile` (one open handle). Implementations live in
//! `os::unix` and `os::mem`; the pager does not care which it was given.

use bitflags::bitflags;

use crate::error::Result;
use crate::types::{DbOffset, LockLevel};

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    /// File open flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READONLY      = 0x0001;
        const READWRITE     = 0x0002;
        const CREATE        = 0x0004;
        const DELETEONCLOSE = 0x0008;
        const EXCLUSIVE     = 0x0010;
        const MAIN_DB       = 0x0100;
        const TEMP_DB       = 0x0200;
        const MAIN_JOURNAL  = 0x0800;
        const TEMP_JOURNAL  = 0x1000;
    }

    /// Flags for checking file access
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        /// Check if file exists
        const EXISTS = 0;
        /// Check if file is readable and writable
        const READWRITE = 1;
        /// Check if file is readable
        const READ = 2;
    }

    /// Flags for file sync operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x0002;
        const FULL     = 0x0003;
        const DATAONLY = 0x0010;
    }

    /// Device characteristics advisory flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCharacteristics: u32 {
        const ATOMIC              = 0x0001;
        const ATOMIC512           = 0x0002;
        const ATOMIC1K            = 0x0004;
        const ATOMIC2K            = 0x0008;
        const ATOMIC4K            = 0x0010;
        const ATOMIC8K            = 0x0020;
        const ATOMIC16K           = 0x0040;
        const ATOMIC32K           = 0x0080;
        const ATOMIC64K           = 0x0100;
        const SAFE_APPEND         = 0x0200;
        const SEQUENTIAL          = 0x0400;
        const POWERSAFE_OVERWRITE = 0x1000;
    }
}

// ============================================================================
// Traits
// ============================================================================

/// One open file handle.
pub trait VfsFile: Send {
    /// Read at offset, returning the byte count actually read. Short reads
    /// zero-fill the remainder of the buffer.
    fn read(&mut self, buf: &mut [u8], offset: DbOffset) -> Result<usize>;

    /// Write the whole buffer at offset.
    fn write(&mut self, buf: &[u8], offset: DbOffset) -> Result<()>;

    /// Truncate the file to `size` bytes.
    fn truncate(&mut self, size: DbOffset) -> Result<()>;

    /// Flush all prior writes to stable storage.
    fn sync(&mut self, flags: SyncFlags) -> Result<()>;

    /// Current file size in bytes.
    fn file_size(&self) -> Result<DbOffset>;

    /// Escalate the file lock to `level`. Returns `Busy` when another
    /// connection holds an incompatible lock.
    fn lock(&mut self, level: LockLevel) -> Result<()>;

    /// De-escalate the file lock to `level`.
    fn unlock(&mut self, level: LockLevel) -> Result<()>;

    /// True when some connection holds Reserved or higher on this file.
    fn check_reserved_lock(&self) -> Result<bool>;

    /// Minimum atomic write unit of the underlying device.
    fn sector_size(&self) -> u32 {
        512
    }

    /// Advisory device characteristics.
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }
}

/// Path-level file system operations.
pub trait Vfs: Send + Sync {
    /// Adapter name, e.g. "unix" or "mem".
    fn name(&self) -> &str;

    /// Open a file. `None` path means an anonymous temp file.
    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>>;

    /// Delete a file; optionally fsync the containing directory after.
    fn delete(&self, path: &str, sync_dir: bool) -> Result<()>;

    /// Check existence / accessibility.
    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool>;

    /// Canonicalize a path.
    fn full_pathname(&self, path: &str) -> Result<String>;

    /// Fill the buffer with entropy; returns bytes written.
    fn randomness(&self, buf: &mut [u8]) -> usize;

    /// Sleep for at least `microseconds`; returns the actual amount.
    fn sleep(&self, microseconds: u64) -> u64;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
        assert!(flags.contains(OpenFlags::READWRITE));
        assert!(flags.contains(OpenFlags::CREATE));
        assert!(!flags.contains(OpenFlags::READONLY));
    }

    #[test]
    fn test_sync_flags() {
        let flags = SyncFlags::FULL | SyncFlags::DATAONLY;
        assert!(flags.contains(SyncFlags::FULL));
        assert!(flags.contains(SyncFlags::DATAONLY));
    }

    #[test]
    fn test_device_characteristics() {
        let chars = DeviceCharacteristics::ATOMIC4K | DeviceCharacteristics::SAFE_APPEND;
        assert!(chars.contains(DeviceCharacteristics::ATOMIC4K));
        assert!(!chars.contains(DeviceCharacteristics::SEQUENTIAL));
    }
}
