//! In-memory file adapter
//!
//! Files live in a registry shared by every handle opened through the same
//! `MemVfs`, so two "connections" opened on one path observe each other's
//! writes and locks exactly as two processes would on disk. The lock table
//! implements the four-level compatibility rules precisely, which makes
//! this adapter the substrate for the cross-connection and busy-retry
//! tests.
//!
//! A fault controller simulates power loss: after a configured number of
//! mutating operations every subsequent write, sync, truncate, and delete
//! fails, freezing the byte image the way a crash would. Tests then clear
//! the fault and reopen to exercise recovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorCode, IoKind, Result};
use crate::os::vfs::{AccessFlags, DeviceCharacteristics, OpenFlags, SyncFlags, Vfs, VfsFile};
use crate::random::Prng;
use crate::types::{DbOffset, LockLevel};

// ============================================================================
// Shared state
// ============================================================================

/// Byte image plus the lock table of one registered file.
struct MemFileState {
    data: Vec<u8>,
    n_shared: u32,
    reserved: bool,
    pending: bool,
    exclusive: bool,
}

impl MemFileState {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            n_shared: 0,
            reserved: false,
            pending: false,
            exclusive: false,
        }
    }
}

/// Crash simulation: a countdown of mutating operations that may still
/// succeed. Reaching zero trips the crashed flag; everything mutating
/// fails from then on until `clear_faults`.
struct FaultState {
    countdown: Option<u64>,
    crashed: bool,
    mutating_ops: u64,
}

struct MemVfsState {
    files: HashMap<String, Arc<Mutex<MemFileState>>>,
    faults: FaultState,
    prng: Prng,
}

/// In-memory adapter. Clones share the same file namespace.
#[derive(Clone)]
pub struct MemVfs {
    state: Arc<Mutex<MemVfsState>>,
}

impl MemVfs {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemVfsState {
                files: HashMap::new(),
                faults: FaultState {
                    countdown: None,
                    crashed: false,
                    mutating_ops: 0,
                },
                prng: Prng::from_seed(b"memvfs"),
            })),
        }
    }

    /// Allow `n` more mutating operations, then behave as if power failed.
    pub fn fail_after(&self, n: u64) {
        let mut state = self.state.lock().unwrap();
        state.faults.countdown = Some(n);
        state.faults.crashed = false;
    }

    /// Clear crash state (the byte images stay as they were at the crash).
    pub fn clear_faults(&self) {
        let mut state = self.state.lock().unwrap();
        state.faults.countdown = None;
        state.faults.crashed = false;
    }

    /// Mutating operations performed since construction.
    pub fn mutating_ops(&self) -> u64 {
        self.state.lock().unwrap().faults.mutating_ops
    }

    /// True once a fault countdown has expired.
    pub fn crashed(&self) -> bool {
        self.state.lock().unwrap().faults.crashed
    }

    /// Current byte image of a registered file, for test assertions.
    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(path)
            .map(|f| f.lock().unwrap().data.clone())
    }

    /// Number of registered files.
    pub fn file_count(&self) -> usize {
        self.state.lock().unwrap().files.len()
    }

    fn charge_mutation(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let faults = &mut state.faults;
        if faults.crashed {
            return Err(Error::io(IoKind::Write, "simulated power failure"));
        }
        match faults.countdown {
            Some(0) => {
                faults.crashed = true;
                Err(Error::io(IoKind::Write, "simulated power failure"))
            }
            Some(ref mut n) => {
                *n -= 1;
                faults.mutating_ops += 1;
                Ok(())
            }
            None => {
                faults.mutating_ops += 1;
                Ok(())
            }
        }
    }

    fn crashed_check(&self) -> Result<()> {
        if self.state.lock().unwrap().faults.crashed {
            return Err(Error::io(IoKind::Read, "simulated power failure"));
        }
        Ok(())
    }
}

impl Default for MemVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for MemVfs {
    fn name(&self) -> &str {
        "mem"
    }

    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let mut state = self.state.lock().unwrap();

        let path = match path {
            Some(p) => p.to_string(),
            None => {
                let n = state.prng.next_u64();
                format!("temp/{:016x}", n)
            }
        };

        let exists = state.files.contains_key(&path);
        if exists && flags.contains(OpenFlags::EXCLUSIVE) {
            return Err(Error::with_message(
                ErrorCode::CantOpen,
                format!("file exists: {}", path),
            ));
        }
        if !exists && !flags.contains(OpenFlags::CREATE) {
            return Err(Error::with_message(
                ErrorCode::CantOpen,
                format!("no such file: {}", path),
            ));
        }

        let file = state
            .files
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(MemFileState::new())))
            .clone();

        Ok(Box::new(MemFile {
            vfs: self.clone(),
            path,
            file,
            lock_level: LockLevel::None,
            owns_reserved: false,
            delete_on_close: flags.contains(OpenFlags::DELETEONCLOSE),
        }))
    }

    fn delete(&self, path: &str, _sync_dir: bool) -> Result<()> {
        self.charge_mutation()?;
        self.state.lock().unwrap().files.remove(path);
        Ok(())
    }

    fn access(&self, path: &str, _flags: AccessFlags) -> Result<bool> {
        Ok(self.state.lock().unwrap().files.contains_key(path))
    }

    fn full_pathname(&self, path: &str) -> Result<String> {
        Ok(path.to_string())
    }

    fn randomness(&self, buf: &mut [u8]) -> usize {
        self.state.lock().unwrap().prng.fill(buf);
        buf.len()
    }

    fn sleep(&self, microseconds: u64) -> u64 {
        // No blocking in the in-memory adapter; callers that need real
        // elapsed time use the unix adapter.
        microseconds
    }
}

// ============================================================================
// File handle
// ============================================================================

/// One handle into the shared registry.
pub struct MemFile {
    vfs: MemVfs,
    path: String,
    file: Arc<Mutex<MemFileState>>,
    lock_level: LockLevel,
    /// We set the file's reserved flag (a Pending holder coming straight
    /// from Shared never did, and must not clear someone else's).
    owns_reserved: bool,
    delete_on_close: bool,
}

impl Drop for MemFile {
    fn drop(&mut self) {
        // Process death releases advisory locks
        let _ = self.release_to(LockLevel::None);
        if self.delete_on_close {
            self.vfs.state.lock().unwrap().files.remove(&self.path);
        }
    }
}

impl MemFile {
    fn release_to(&mut self, level: LockLevel) -> Result<()> {
        if level >= self.lock_level {
            return Ok(());
        }
        let mut f = self.file.lock().unwrap();

        if self.lock_level == LockLevel::Exclusive {
            f.exclusive = false;
        }
        if self.lock_level >= LockLevel::Pending {
            f.pending = false;
        }
        if self.owns_reserved && level < LockLevel::Reserved {
            f.reserved = false;
            self.owns_reserved = false;
        }
        if self.lock_level >= LockLevel::Shared && level < LockLevel::Shared {
            f.n_shared -= 1;
        }

        self.lock_level = level;
        Ok(())
    }
}

impl VfsFile for MemFile {
    fn read(&mut self, buf: &mut [u8], offset: DbOffset) -> Result<usize> {
        self.vfs.crashed_check()?;
        let f = self.file.lock().unwrap();
        let offset = offset as usize;

        if offset >= f.data.len() {
            buf.fill(0);
            return Ok(0);
        }

        let n = buf.len().min(f.data.len() - offset);
        buf[..n].copy_from_slice(&f.data[offset..offset + n]);
        buf[n..].fill(0);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8], offset: DbOffset) -> Result<()> {
        self.vfs.charge_mutation()?;
        let mut f = self.file.lock().unwrap();
        let offset = offset as usize;

        if f.data.len() < offset + buf.len() {
            f.data.resize(offset + buf.len(), 0);
        }
        f.data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, size: DbOffset) -> Result<()> {
        self.vfs.charge_mutation()?;
        let mut f = self.file.lock().unwrap();
        f.data.truncate(size as usize);
        Ok(())
    }

    fn sync(&mut self, _flags: SyncFlags) -> Result<()> {
        // The byte image is always "durable"; the fault controller is the
        // only way a sync can fail here.
        self.vfs.charge_mutation()
    }

    fn file_size(&self) -> Result<DbOffset> {
        Ok(self.file.lock().unwrap().data.len() as DbOffset)
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        if level <= self.lock_level {
            return Ok(());
        }
        if self.lock_level == LockLevel::None && level != LockLevel::Shared {
            return Err(Error::new(ErrorCode::Misuse));
        }

        let mut f = self.file.lock().unwrap();
        match level {
            LockLevel::Shared => {
                if f.exclusive || f.pending {
                    return Err(Error::new(ErrorCode::Busy));
                }
                f.n_shared += 1;
            }
            LockLevel::Reserved => {
                if f.reserved || f.pending || f.exclusive {
                    return Err(Error::new(ErrorCode::Busy));
                }
                f.reserved = true;
                self.owns_reserved = true;
            }
            LockLevel::Pending | LockLevel::Exclusive => {
                if f.exclusive || (f.pending && self.lock_level < LockLevel::Pending) {
                    return Err(Error::new(ErrorCode::Busy));
                }
                f.pending = true;
                if level == LockLevel::Exclusive {
                    // Our own shared slot is the one allowed survivor
                    if f.n_shared > 1 {
                        self.lock_level = LockLevel::Pending;
                        return Err(Error::new(ErrorCode::Busy));
                    }
                    f.exclusive = true;
                }
            }
            LockLevel::None => unreachable!(),
        }

        self.lock_level = level;
        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        if level != LockLevel::None && level != LockLevel::Shared {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.release_to(level)
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        if self.lock_level >= LockLevel::Reserved {
            return Ok(true);
        }
        let f = self.file.lock().unwrap();
        Ok(f.reserved || f.pending || f.exclusive)
    }

    fn sector_size(&self) -> u32 {
        512
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open_rw(vfs: &MemVfs, path: &str) -> Box<dyn VfsFile> {
        vfs.open(Some(path), OpenFlags::READWRITE | OpenFlags::CREATE)
            .unwrap()
    }

    #[test]
    fn test_handles_share_contents() {
        let vfs = MemVfs::new();
        let mut a = open_rw(&vfs, "shared.db");
        let mut b = open_rw(&vfs, "shared.db");

        a.write(b"from a", 0).unwrap();
        let mut buf = [0u8; 6];
        b.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"from a");
    }

    #[test]
    fn test_exclusive_create_fails_on_existing() {
        let vfs = MemVfs::new();
        let _a = open_rw(&vfs, "x.db");
        let err = match vfs.open(
            Some("x.db"),
            OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
        ) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.code(), ErrorCode::CantOpen);
    }

    #[test]
    fn test_shared_readers_coexist() {
        let vfs = MemVfs::new();
        let mut a = open_rw(&vfs, "l.db");
        let mut b = open_rw(&vfs, "l.db");

        a.lock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Shared).unwrap();
    }

    #[test]
    fn test_second_reserved_is_busy() {
        let vfs = MemVfs::new();
        let mut a = open_rw(&vfs, "l.db");
        let mut b = open_rw(&vfs, "l.db");

        a.lock(LockLevel::Shared).unwrap();
        a.lock(LockLevel::Reserved).unwrap();

        b.lock(LockLevel::Shared).unwrap();
        assert_eq!(
            b.lock(LockLevel::Reserved).unwrap_err().code(),
            ErrorCode::Busy
        );
        assert!(b.check_reserved_lock().unwrap());
    }

    #[test]
    fn test_exclusive_blocked_by_reader() {
        let vfs = MemVfs::new();
        let mut a = open_rw(&vfs, "l.db");
        let mut b = open_rw(&vfs, "l.db");

        a.lock(LockLevel::Shared).unwrap();
        a.lock(LockLevel::Reserved).unwrap();
        b.lock(LockLevel::Shared).unwrap();

        // Reader still present: exclusive is Busy, Pending is retained
        assert_eq!(
            a.lock(LockLevel::Exclusive).unwrap_err().code(),
            ErrorCode::Busy
        );
        // New readers now refused by the pending flag
        let mut c = open_rw(&vfs, "l.db");
        assert_eq!(
            c.lock(LockLevel::Shared).unwrap_err().code(),
            ErrorCode::Busy
        );

        // Reader leaves; upgrade succeeds
        b.unlock(LockLevel::None).unwrap();
        a.lock(LockLevel::Exclusive).unwrap();
    }

    #[test]
    fn test_drop_releases_locks() {
        let vfs = MemVfs::new();
        let mut a = open_rw(&vfs, "l.db");
        a.lock(LockLevel::Shared).unwrap();
        a.lock(LockLevel::Reserved).unwrap();
        drop(a);

        let mut b = open_rw(&vfs, "l.db");
        b.lock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Reserved).unwrap();
    }

    #[test]
    fn test_fault_countdown_trips() {
        let vfs = MemVfs::new();
        let mut f = open_rw(&vfs, "crash.db");

        vfs.fail_after(2);
        f.write(b"one", 0).unwrap();
        f.write(b"two", 8).unwrap();
        assert!(f.write(b"three", 16).is_err());
        assert!(vfs.crashed());
        // Everything mutating keeps failing until cleared
        assert!(f.sync(SyncFlags::NORMAL).is_err());

        vfs.clear_faults();
        f.sync(SyncFlags::NORMAL).unwrap();
        // The image froze at the crash point
        let img = vfs.file_contents("crash.db").unwrap();
        assert_eq!(&img[0..3], b"one");
        assert_eq!(&img[8..11], b"two");
        assert_eq!(img.len(), 11);
    }
}
