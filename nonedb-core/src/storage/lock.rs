//! Cross-process exclusive file locking.
//!
//! Every mutating operation runs inside an OS advisory lock scoped to the
//! file it rewrites. Locks are taken on a `.lock` sibling rather than the
//! data file itself, because atomic temp-file renames replace the data
//! file's inode and would silently detach a lock held on it.
//!
//! The lock is a guard: it is released on every exit path by `Drop`, so a
//! failure while the lock is held still releases it before the error
//! surfaces.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::warn;

use crate::error::{Error, Result};

/// How lock acquisition waits.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Maximum time to wait for the lock; `None` blocks indefinitely on the
    /// OS lock rather than polling.
    pub timeout: Option<Duration>,
    /// Delay between attempts when a timeout is configured.
    pub retry_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(5)),
            retry_delay: Duration::from_millis(10),
        }
    }
}

/// An exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires an exclusive lock guarding `target`.
    ///
    /// Without a timeout this blocks on the OS lock. With a timeout it
    /// retries a non-blocking acquire until the deadline, then fails with
    /// [`Error::LockTimeout`].
    pub fn acquire(target: &Path, opts: &LockOptions) -> Result<Self> {
        let path = lock_path(target);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Io(format!("open lock file {} failed: {e}", path.display())))?;

        match opts.timeout {
            None => {
                file.lock()
                    .map_err(|e| Error::Io(format!("lock {} failed: {e}", path.display())))?;
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    match file.try_lock() {
                        Ok(()) => break,
                        Err(TryLockError::WouldBlock) => {
                            if Instant::now() >= deadline {
                                warn!("lock timeout on {}", path.display());
                                return Err(Error::LockTimeout(path.display().to_string()));
                            }
                            std::thread::sleep(opts.retry_delay);
                        }
                        Err(TryLockError::Error(e)) => {
                            return Err(Error::Io(format!(
                                "lock {} failed: {e}",
                                path.display()
                            )));
                        }
                    }
                }
            }
        }

        Ok(Self { file, path })
    }

    /// The lock file's path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Release failures cannot be surfaced from drop; the OS also releases
        // on close.
        let _ = self.file.unlock();
    }
}

/// The `.lock` sibling guarding a data file.
pub fn lock_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_target() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join("nonedb_test_lock");
        fs::create_dir_all(&dir).unwrap();
        dir.join(format!("target_{}_{}.nonedb", std::process::id(), id))
    }

    #[test]
    fn test_lock_path_is_sibling() {
        let p = lock_path(Path::new("/data/x.nonedb.shard3"));
        assert_eq!(p, Path::new("/data/x.nonedb.shard3.lock"));
    }

    #[test]
    fn test_acquire_and_release() {
        let target = temp_target();
        {
            let guard = FileLock::acquire(&target, &LockOptions::default()).unwrap();
            assert!(guard.path().exists());
        }
        // Released on drop; a second acquire succeeds immediately.
        let _guard = FileLock::acquire(&target, &LockOptions::default()).unwrap();
    }

    #[test]
    fn test_blocking_acquire_without_timeout() {
        let target = temp_target();
        let opts = LockOptions {
            timeout: None,
            retry_delay: Duration::from_millis(1),
        };
        let _guard = FileLock::acquire(&target, &opts).unwrap();
    }

    #[test]
    fn test_release_on_error_path() {
        let target = temp_target();
        let attempt: Result<()> = (|| {
            let _guard = FileLock::acquire(&target, &LockOptions::default())?;
            Err(Error::Validation("forced failure".into()))
        })();
        assert!(attempt.is_err());

        // The guard must have been released despite the error.
        let _guard = FileLock::acquire(&target, &LockOptions::default()).unwrap();
    }
}
