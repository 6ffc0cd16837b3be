//! Scoped recursive mutex
//!
//! Mutual exclusion is only ever obtained through `lock()`, which returns a
//! guard; release happens on every exit path when the guard drops. The
//! mutex is recursive: the owning thread may re-enter, and the lock is
//! released when the outermost guard goes away.

use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

#[derive(Debug)]
struct MutexState {
    owner: Option<ThreadId>,
    count: u32,
}

/// Recursive mutex handed out by the shared primitives layer.
#[derive(Debug)]
pub struct DbMutex {
    state: Mutex<MutexState>,
    condvar: Condvar,
}

impl Default for DbMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl DbMutex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MutexState {
                owner: None,
                count: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Block until the mutex is held by the calling thread.
    pub fn lock(&self) -> DbMutexGuard<'_> {
        let tid = std::thread::current().id();
        let mut guard = self.state.lock().unwrap();
        loop {
            match guard.owner {
                None => {
                    guard.owner = Some(tid);
                    guard.count = 1;
                    return DbMutexGuard { mutex: self };
                }
                Some(owner) if owner == tid => {
                    guard.count += 1;
                    return DbMutexGuard { mutex: self };
                }
                _ => {
                    guard = self.condvar.wait(guard).unwrap();
                }
            }
        }
    }

    /// Acquire without blocking; `None` when another thread holds it.
    pub fn try_lock(&self) -> Option<DbMutexGuard<'_>> {
        let tid = std::thread::current().id();
        let mut guard = self.state.lock().unwrap();
        match guard.owner {
            None => {
                guard.owner = Some(tid);
                guard.count = 1;
                Some(DbMutexGuard { mutex: self })
            }
            Some(owner) if owner == tid => {
                guard.count += 1;
                Some(DbMutexGuard { mutex: self })
            }
            _ => None,
        }
    }

    /// True when the calling thread is the current owner.
    pub fn held(&self) -> bool {
        self.state.lock().unwrap().owner == Some(std::thread::current().id())
    }

    fn release(&self) {
        let tid = std::thread::current().id();
        let mut guard = self.state.lock().unwrap();
        if guard.owner == Some(tid) {
            guard.count = guard.count.saturating_sub(1);
            if guard.count == 0 {
                guard.owner = None;
                self.condvar.notify_one();
            }
        }
    }
}

/// RAII guard; dropping releases one level of the recursive hold.
#[derive(Debug)]
pub struct DbMutexGuard<'a> {
    mutex: &'a DbMutex,
}

impl Drop for DbMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_and_release() {
        let m = DbMutex::new();
        {
            let _g = m.lock();
            assert!(m.held());
        }
        assert!(!m.held());
    }

    #[test]
    fn test_recursive_reentry() {
        let m = DbMutex::new();
        let _outer = m.lock();
        {
            let _inner = m.lock();
            assert!(m.held());
        }
        // Still held by the outer guard
        assert!(m.held());
    }

    #[test]
    fn test_try_lock_contended() {
        let m = Arc::new(DbMutex::new());
        let g = m.lock();

        let m2 = Arc::clone(&m);
        let handle = std::thread::spawn(move || m2.try_lock().is_none());
        assert!(handle.join().unwrap());
        drop(g);

        let m3 = Arc::clone(&m);
        let handle = std::thread::spawn(move || m3.try_lock().is_some());
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_cross_thread_blocking() {
        let m = Arc::new(DbMutex::new());
        let g = m.lock();

        let m2 = Arc::clone(&m);
        let handle = std::thread::spawn(move || {
            let _g = m2.lock();
            // Reached only after the main thread releases
            true
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(g);
        assert!(handle.join().unwrap());
    }
}
