//! Advisory whole-file lock over the pool backing file
//!
//! The file lock is the sole cross-process synchronizer: every mutation
//! and every read that needs a consistent frame view acquires it.
//! Acquisition is blocking by default; a configured timeout switches to
//! a non-blocking retry loop that fails with `LockTimeout` on expiry.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::error::{MventError, Result};

/// Sleep between non-blocking acquisition attempts
const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Scoped advisory lock on a backing file descriptor
#[derive(Debug, Clone, Copy)]
pub struct FileLock {
    fd: RawFd,
    timeout: Option<Duration>,
}

impl FileLock {
    /// Create a lock handle for a file descriptor
    ///
    /// `timeout` of `None` means block until the lock is granted.
    pub fn new(fd: RawFd, timeout: Option<Duration>) -> Self {
        Self { fd, timeout }
    }

    /// Acquire the exclusive lock, returning a guard that releases on drop
    pub fn acquire(&self) -> Result<LockGuard> {
        match self.timeout {
            None => self.acquire_blocking(),
            Some(budget) => self.acquire_with_deadline(budget),
        }
    }

    /// Run `op` with the lock held; released on all exit paths
    pub fn with_lock<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.acquire()?;
        op()
    }

    fn acquire_blocking(&self) -> Result<LockGuard> {
        loop {
            let rc = unsafe { libc::flock(self.fd, libc::LOCK_EX) };
            if rc == 0 {
                return Ok(LockGuard { fd: self.fd });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(MventError::from_io(err, "flock failed"));
        }
    }

    fn acquire_with_deadline(&self, budget: Duration) -> Result<LockGuard> {
        let start = Instant::now();
        loop {
            let rc = unsafe { libc::flock(self.fd, libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                return Ok(LockGuard { fd: self.fd });
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {
                    if start.elapsed() >= budget {
                        return Err(MventError::lock_timeout(budget.as_millis() as u64));
                    }
                    std::thread::sleep(RETRY_INTERVAL.min(budget));
                }
                _ => return Err(MventError::from_io(err, "flock failed")),
            }
        }
    }
}

/// Holds the exclusive lock; unlocks the file on drop
#[derive(Debug)]
pub struct LockGuard {
    fd: RawFd,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Unlock cannot be meaningfully handled on failure; the fd is
        // closed with the pool either way.
        unsafe {
            libc::flock(self.fd, libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;
    use tempfile::TempDir;

    fn open_pair(dir: &TempDir) -> (std::fs::File, std::fs::File) {
        let path = dir.path().join("lockfile");
        let a = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        let b = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        (a, b)
    }

    #[test]
    fn test_with_lock_runs_op() {
        let dir = TempDir::new().unwrap();
        let (file, _) = open_pair(&dir);
        let lock = FileLock::new(file.as_raw_fd(), None);
        let out = lock.with_lock(|| Ok(42)).unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn test_lock_released_on_error_path() {
        let dir = TempDir::new().unwrap();
        let (file, _) = open_pair(&dir);
        let lock = FileLock::new(file.as_raw_fd(), None);
        let res: Result<()> = lock.with_lock(|| Err(MventError::Stopped));
        assert!(res.is_err());
        // Reacquirable immediately after the failed op released it
        assert!(lock.with_lock(|| Ok(())).is_ok());
    }

    #[test]
    fn test_timeout_against_contending_descriptor() {
        let dir = TempDir::new().unwrap();
        let (a, b) = open_pair(&dir);
        let held = FileLock::new(a.as_raw_fd(), None).acquire().unwrap();

        // Second open file description contends and times out
        let lock = FileLock::new(b.as_raw_fd(), Some(Duration::from_millis(50)));
        match lock.acquire() {
            Err(MventError::LockTimeout { waited_ms }) => assert_eq!(waited_ms, 50),
            other => panic!("expected LockTimeout, got {:?}", other.map(|_| ())),
        }

        drop(held);
        assert!(lock.acquire().is_ok());
    }
}
