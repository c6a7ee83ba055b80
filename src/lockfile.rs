//! Exclusive `flock(2)` locks shared by every mockmox process on the host.
//!
//! Each invocation of the CLI is its own process, so in-process mutexes alone
//! cannot keep two commands off the same instance. The kernel drops the lock
//! when the descriptor closes, including when the holder crashes.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::MoxError;

#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Block until `path` is locked, creating the file if needed.
    pub fn acquire(path: &Path) -> Result<Self, MoxError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| MoxError::io(format!("opening lock file {}", path.display()), e))?;

        loop {
            // SAFETY: the descriptor stays open for as long as `file` lives.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(MoxError::io(format!("locking {}", path.display()), err));
            }
        }
        tracing::trace!(path = %path.display(), "file lock held");
        Ok(Self { _file: file })
    }

    /// `acquire` on the blocking pool, so waiting never stalls the runtime.
    pub async fn acquire_owned(path: PathBuf) -> Result<Self, MoxError> {
        tokio::task::spawn_blocking(move || Self::acquire(&path))
            .await
            .map_err(|e| MoxError::io("waiting for a file lock", std::io::Error::other(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn second_holder_waits_for_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm1.lock");
        let first = FileLock::acquire(&path).unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let path = path.clone();
            let released = released.clone();
            std::thread::spawn(move || {
                let _second = FileLock::acquire(&path).unwrap();
                released.load(Ordering::SeqCst)
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        drop(first);
        assert!(waiter.join().unwrap(), "second lock granted while the first was held");
    }

    #[tokio::test]
    async fn lock_file_is_created_and_reusable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm1.lock");
        drop(FileLock::acquire_owned(path.clone()).await.unwrap());
        assert!(path.is_file());
        drop(FileLock::acquire_owned(path).await.unwrap());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileLock::acquire(&dir.path().join("nope/vm1.lock")).unwrap_err();
        assert!(matches!(err, MoxError::Io { .. }));
    }
}
