//! Advisory file locks shared between vmci processes.
//!
//! Uses flock(2) on a dedicated lock file. The lock follows the open file
//! description, so it is released on drop and also when the process dies.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use vmci_shared::errors::{VmciError, VmciResult};

/// Guard holding an exclusive lock on a lock file.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock on `lock_path` is held.
    pub fn acquire(lock_path: &Path) -> VmciResult<Self> {
        let file = open_lock_file(lock_path)?;
        flock(&file, libc::LOCK_EX).map_err(|err| {
            VmciError::Storage(format!(
                "failed to lock {}: {}",
                lock_path.display(),
                err
            ))
        })?;

        tracing::trace!(lock_path = %lock_path.display(), "Acquired file lock");
        Ok(FileLock {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    /// Take the lock only if nobody else holds it.
    ///
    /// Returns `Ok(None)` when another holder has it.
    pub fn try_acquire(lock_path: &Path) -> VmciResult<Option<Self>> {
        let file = open_lock_file(lock_path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {
                tracing::trace!(lock_path = %lock_path.display(), "Acquired file lock");
                Ok(Some(FileLock {
                    file,
                    path: lock_path.to_path_buf(),
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(VmciError::Storage(format!(
                "failed to lock {}: {}",
                lock_path.display(),
                err
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the file would release it too; unlock explicitly anyway.
        let _ = flock(&self.file, libc::LOCK_UN);
        tracing::trace!(lock_path = %self.path.display(), "Released file lock");
    }
}

fn open_lock_file(lock_path: &Path) -> VmciResult<File> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| VmciError::Storage(format!("failed to create lock dir: {}", e)))?;
    }

    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|e| VmciError::Storage(format!("failed to open lock file: {}", e)))
}

#[cfg(unix)]
fn flock(file: &File, operation: libc::c_int) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
compile_error!("vmci file locking requires a unix host");
