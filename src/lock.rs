//! Host-level lock per instance identity
//!
//! Two runs against the same instance must not interleave. The lock is an
//! advisory `flock(2)` on `<lock_dir>/<version>-<name>.lock`, released when
//! the guard is dropped (or the process exits).

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("instance {0} is being reconciled by another process")]
    Busy(String),

    #[error("Could not lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<LockError> for converge::Error {
    fn from(err: LockError) -> Self {
        Self::execution(err)
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock without waiting.
    pub fn acquire(lock_dir: &Path, qualname: &str) -> Result<Self, LockError> {
        let path = lock_dir.join(format!("{qualname}.lock"));
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(lock_dir).map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        // SAFETY: flock on a file descriptor we own for the guard's lifetime
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(LockError::Busy(qualname.to_string()));
            }
            return Err(io_err(err));
        }

        log::debug!("Locked {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still open; unlocking cannot invalidate it
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        log::debug!("Unlocked {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_busy() {
        let dir = TempDir::new().unwrap();
        let lock = InstanceLock::acquire(dir.path(), "16-main").unwrap();
        assert!(lock.path().ends_with("16-main.lock"));

        // flock locks belong to the open file description, so a second
        // open in the same process conflicts too.
        let err = InstanceLock::acquire(dir.path(), "16-main").unwrap_err();
        assert!(matches!(err, LockError::Busy(_)));

        InstanceLock::acquire(dir.path(), "16-other").unwrap();

        drop(lock);
        InstanceLock::acquire(dir.path(), "16-main").unwrap();
    }

    #[test]
    fn test_creates_lock_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        InstanceLock::acquire(&nested, "16-main").unwrap();
        assert!(nested.join("16-main.lock").exists());
    }
}
