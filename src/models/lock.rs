//! Single-writer lock for the model cache directory.
//!
//! Uses flock() for advisory locking. Held while artifacts are being
//! downloaded so two processes never write the same files concurrently.
//! Readers never take the lock: a final artifact path only ever appears
//! through an atomic rename.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the model directory
const LOCK_FILE_NAME: &str = ".skillsearch.lock";

/// A held lock on a model directory, released on drop
pub struct ModelDirLock {
    #[allow(dead_code)]
    file: File,
}

impl ModelDirLock {
    /// Attempt to lock the model directory without waiting.
    /// Fails with `WouldBlock` when another writer holds it.
    pub fn try_acquire(model_dir: &Path) -> io::Result<Self> {
        let file = Self::open_lock_file(model_dir)?;
        Self::try_lock_exclusive(&file)?;
        Ok(ModelDirLock { file })
    }

    /// Lock the model directory, blocking until the current writer finishes.
    pub fn acquire_blocking(model_dir: &Path) -> io::Result<Self> {
        let file = Self::open_lock_file(model_dir)?;
        Self::lock_exclusive(&file)?;
        Ok(ModelDirLock { file })
    }

    fn open_lock_file(model_dir: &Path) -> io::Result<File> {
        std::fs::create_dir_all(model_dir)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(model_dir.join(LOCK_FILE_NAME))
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "Model directory is locked by another download",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        // No advisory locking off unix; the atomic rename still prevents partial artifacts
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for ModelDirLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // Release the lock - ignore errors on drop
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();

        let lock1 = ModelDirLock::try_acquire(dir.path());
        assert!(lock1.is_ok(), "First lock should succeed");

        let lock2 = ModelDirLock::try_acquire(dir.path());
        assert!(lock2.is_err(), "Second lock should fail");

        drop(lock1);

        let lock3 = ModelDirLock::try_acquire(dir.path());
        assert!(lock3.is_ok(), "Third lock should succeed after release");
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        let lock = ModelDirLock::acquire_blocking(&nested);
        assert!(lock.is_ok());
        assert!(nested.join(LOCK_FILE_NAME).exists());
    }
}
