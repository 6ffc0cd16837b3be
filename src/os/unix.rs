//! Unix file adapter
//!
//! pread/pwrite based file handles with fcntl byte-range advisory locks.
//! The four externally visible lock levels map onto three lock regions near
//! the 1 GiB mark, so the lock bytes never overlap page data in practice
//! and a Reserved holder does not block new readers.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::error::{Error, ErrorCode, IoKind, Result};
use crate::os::vfs::{AccessFlags, DeviceCharacteristics, OpenFlags, SyncFlags, Vfs, VfsFile};
use crate::types::{DbOffset, LockLevel};

// Lock region layout. The pending byte gates new shared locks during an
// exclusive upgrade; the reserved byte marks one writer preparing.
const PENDING_BYTE: i64 = 0x4000_0000;
const RESERVED_BYTE: i64 = PENDING_BYTE + 1;
const SHARED_FIRST: i64 = PENDING_BYTE + 2;
const SHARED_SIZE: i64 = 510;

// ============================================================================
// Platform helpers
// ============================================================================

#[cfg(target_os = "linux")]
fn get_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(not(target_os = "linux"))]
fn get_errno() -> i32 {
    unsafe { *libc::__error() }
}

#[cfg(target_os = "linux")]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fdatasync(fd)
}

#[cfg(not(target_os = "linux"))]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fsync(fd)
}

fn error_from_errno(kind: IoKind) -> Error {
    let errno = get_errno();
    let msg = std::io::Error::from_raw_os_error(errno).to_string();

    match errno {
        libc::ENOENT => Error::with_message(ErrorCode::CantOpen, msg),
        libc::EACCES | libc::EPERM => Error::with_message(ErrorCode::Perm, msg),
        libc::ENOSPC | libc::EDQUOT => Error::with_message(ErrorCode::Full, msg),
        libc::EBUSY | libc::EAGAIN => Error::with_message(ErrorCode::Busy, msg),
        libc::ENOMEM => Error::with_message(ErrorCode::NoMem, msg),
        libc::EROFS => Error::with_message(ErrorCode::ReadOnly, msg),
        _ => Error::io(kind, msg),
    }
}

// ============================================================================
// Unix VFS
// ============================================================================

/// Adapter over the POSIX file API.
pub struct UnixVfs {
    name: String,
}

impl UnixVfs {
    pub fn new() -> Self {
        Self {
            name: "unix".to_string(),
        }
    }

    fn create_temp_file(&self) -> Result<(String, RawFd)> {
        let template = "/tmp/strata_XXXXXX";
        let c_template =
            CString::new(template).map_err(|_| Error::new(ErrorCode::CantOpen))?;

        let mut template_bytes: Vec<libc::c_char> = c_template
            .as_bytes_with_nul()
            .iter()
            .map(|&b| b as libc::c_char)
            .collect();

        let fd = unsafe { libc::mkstemp(template_bytes.as_mut_ptr()) };
        if fd < 0 {
            return Err(error_from_errno(IoKind::Write));
        }

        let path = String::from_utf8_lossy(
            &template_bytes
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| c as u8)
                .collect::<Vec<u8>>(),
        )
        .to_string();

        Ok((path, fd))
    }
}

impl Default for UnixVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for UnixVfs {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let mut oflags: libc::c_int = 0;

        if flags.contains(OpenFlags::READONLY) {
            oflags |= libc::O_RDONLY;
        } else {
            oflags |= libc::O_RDWR;
        }
        if flags.contains(OpenFlags::CREATE) {
            oflags |= libc::O_CREAT;
        }
        if flags.contains(OpenFlags::EXCLUSIVE) {
            oflags |= libc::O_EXCL;
        }

        let (path_str, fd) = match path {
            Some(p) => {
                let c_path = CString::new(p).map_err(|_| Error::new(ErrorCode::CantOpen))?;
                let fd = unsafe { libc::open(c_path.as_ptr(), oflags, 0o644) };
                if fd < 0 {
                    return Err(error_from_errno(IoKind::Read));
                }
                (p.to_string(), fd)
            }
            None => self.create_temp_file()?,
        };

        Ok(Box::new(UnixFile {
            fd,
            path: path_str,
            lock_level: LockLevel::None,
            delete_on_close: flags.contains(OpenFlags::DELETEONCLOSE),
        }))
    }

    fn delete(&self, path: &str, sync_dir: bool) -> Result<()> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;
        let rc = unsafe { libc::unlink(c_path.as_ptr()) };

        if rc != 0 && get_errno() != libc::ENOENT {
            return Err(error_from_errno(IoKind::Delete));
        }

        if sync_dir {
            if let Some(dir_path) = std::path::Path::new(path).parent() {
                let dir_str = dir_path.to_str().unwrap_or(".");
                if let Ok(c_dir) = CString::new(dir_str) {
                    let dir_fd = unsafe { libc::open(c_dir.as_ptr(), libc::O_RDONLY) };
                    if dir_fd >= 0 {
                        unsafe {
                            libc::fsync(dir_fd);
                            libc::close(dir_fd);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;

        let mode = if flags.contains(AccessFlags::READWRITE) {
            libc::R_OK | libc::W_OK
        } else if flags.contains(AccessFlags::READ) {
            libc::R_OK
        } else {
            libc::F_OK
        };

        Ok(unsafe { libc::access(c_path.as_ptr(), mode) } == 0)
    }

    fn full_pathname(&self, path: &str) -> Result<String> {
        if path.starts_with('/') {
            return Ok(path.to_string());
        }
        let cwd = std::env::current_dir().map_err(|_| Error::new(ErrorCode::CantOpen))?;
        Ok(cwd.join(path).to_string_lossy().to_string())
    }

    fn randomness(&self, buf: &mut [u8]) -> usize {
        if let Ok(mut file) = std::fs::File::open("/dev/urandom") {
            use std::io::Read;
            if file.read_exact(buf).is_ok() {
                return buf.len();
            }
        }
        0
    }

    fn sleep(&self, microseconds: u64) -> u64 {
        std::thread::sleep(std::time::Duration::from_micros(microseconds));
        microseconds
    }
}

// ============================================================================
// Unix file handle
// ============================================================================

/// One POSIX file descriptor plus its advisory-lock state.
pub struct UnixFile {
    fd: RawFd,
    path: String,
    lock_level: LockLevel,
    delete_on_close: bool,
}

impl Drop for UnixFile {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
        if self.delete_on_close {
            if let Ok(c_path) = CString::new(self.path.as_str()) {
                unsafe { libc::unlink(c_path.as_ptr()) };
            }
        }
    }
}

impl UnixFile {
    /// Apply one fcntl range lock; `Busy` on conflict, no blocking.
    fn range_lock(&self, l_type: libc::c_short, start: i64, len: i64) -> Result<()> {
        let flock = libc::flock {
            l_type,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };

        loop {
            let rc = unsafe { libc::fcntl(self.fd, libc::F_SETLK, &flock) };
            if rc == 0 {
                return Ok(());
            }
            let errno = get_errno();
            if errno == libc::EINTR {
                continue;
            }
            if errno == libc::EAGAIN || errno == libc::EACCES {
                return Err(Error::new(ErrorCode::Busy));
            }
            return Err(error_from_errno(IoKind::Lock));
        }
    }

    fn rdlck(&self, start: i64, len: i64) -> Result<()> {
        self.range_lock(libc::F_RDLCK as libc::c_short, start, len)
    }

    fn wrlck(&self, start: i64, len: i64) -> Result<()> {
        self.range_lock(libc::F_WRLCK as libc::c_short, start, len)
    }

    fn unlck(&self, start: i64, len: i64) -> Result<()> {
        self.range_lock(libc::F_UNLCK as libc::c_short, start, len)
    }
}

impl VfsFile for UnixFile {
    fn read(&mut self, buf: &mut [u8], offset: DbOffset) -> Result<usize> {
        let n = unsafe {
            libc::pread(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };

        if n < 0 {
            return Err(error_from_errno(IoKind::Read));
        }

        // Zero-fill short reads
        let n = n as usize;
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8], offset: DbOffset) -> Result<()> {
        let n = unsafe {
            libc::pwrite(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };

        if n < 0 {
            return Err(error_from_errno(IoKind::Write));
        }
        if n as usize != buf.len() {
            return Err(Error::new(ErrorCode::Full));
        }
        Ok(())
    }

    fn truncate(&mut self, size: DbOffset) -> Result<()> {
        let rc = unsafe { libc::ftruncate(self.fd, size as libc::off_t) };
        if rc != 0 {
            return Err(error_from_errno(IoKind::Truncate));
        }
        Ok(())
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        let rc = if flags.contains(SyncFlags::DATAONLY) {
            unsafe { platform_fdatasync(self.fd) }
        } else {
            unsafe { libc::fsync(self.fd) }
        };

        if rc != 0 {
            return Err(error_from_errno(IoKind::Fsync));
        }
        Ok(())
    }

    fn file_size(&self) -> Result<DbOffset> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(self.fd, &mut stat) };
        if rc != 0 {
            return Err(error_from_errno(IoKind::Read));
        }
        Ok(stat.st_size as DbOffset)
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        if level <= self.lock_level {
            return Ok(());
        }
        if self.lock_level == LockLevel::None && level != LockLevel::Shared {
            return Err(Error::new(ErrorCode::Misuse));
        }

        match level {
            LockLevel::Shared => {
                // The pending byte gates new readers while a writer drains
                // existing ones.
                self.rdlck(PENDING_BYTE, 1)?;
                let rc = self.rdlck(SHARED_FIRST, SHARED_SIZE);
                let _ = self.unlck(PENDING_BYTE, 1);
                rc?;
            }
            LockLevel::Reserved => {
                self.wrlck(RESERVED_BYTE, 1)?;
            }
            LockLevel::Pending | LockLevel::Exclusive => {
                self.wrlck(PENDING_BYTE, 1)?;
                if level == LockLevel::Exclusive {
                    if let Err(e) = self.wrlck(SHARED_FIRST, SHARED_SIZE) {
                        // Keep Pending so no new readers arrive while the
                        // caller retries.
                        self.lock_level = LockLevel::Pending;
                        return Err(e);
                    }
                }
            }
            LockLevel::None => unreachable!(),
        }

        self.lock_level = level;
        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        if level >= self.lock_level {
            return Ok(());
        }

        match level {
            LockLevel::Shared => {
                self.rdlck(SHARED_FIRST, SHARED_SIZE)?;
                self.unlck(PENDING_BYTE, 2)?;
            }
            LockLevel::None => {
                self.unlck(0, 0)?;
            }
            _ => return Err(Error::new(ErrorCode::Misuse)),
        }

        self.lock_level = level;
        Ok(())
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        if self.lock_level >= LockLevel::Reserved {
            return Ok(true);
        }

        let mut flock = libc::flock {
            l_type: libc::F_WRLCK as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: RESERVED_BYTE as libc::off_t,
            l_len: 1,
            l_pid: 0,
        };

        let rc = unsafe { libc::fcntl(self.fd, libc::F_GETLK, &mut flock) };
        if rc != 0 {
            return Err(error_from_errno(IoKind::Lock));
        }
        Ok(flock.l_type != libc::F_UNLCK as libc::c_short)
    }

    fn sector_size(&self) -> u32 {
        512
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::POWERSAFE_OVERWRITE
    }
}

// ============================================================================
// Tests
// ============================================================================
