//! File locking and atomic replacement of the task document
//!
//! - Advisory exclusive locks (fs2/flock) on a sibling `<file>.lock`
//! - Lock acquisition with a configurable timeout
//! - Atomic replace: temp file in the target directory, verified, then renamed

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// Default lock timeout in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

/// Default retry interval when waiting for a lock
const LOCK_RETRY_INTERVAL_MS: u64 = 50;

fn is_lock_contended(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }

    // On Windows, fs2/libc can surface lock/sharing violations as "Other".
    #[cfg(windows)]
    {
        matches!(err.raw_os_error(), Some(32) | Some(33))
    }
    #[cfg(not(windows))]
    {
        false
    }
}

/// Lock file guarding `path`
pub fn lock_path_for(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.lock", path.display()))
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

/// A file lock guard that releases the lock when dropped
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock, creating the lock file if needed.
    ///
    /// Fails with `LockFailed` if the lock is still contended after
    /// `timeout_ms`.
    pub fn acquire(path: impl AsRef<Path>, timeout_ms: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = open_lock_file(path)?;

        let start = Instant::now();
        let timeout = Duration::from_millis(timeout_ms);
        let retry_interval = Duration::from_millis(LOCK_RETRY_INTERVAL_MS);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(FileLock {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if is_lock_contended(&e) => {
                    if start.elapsed() >= timeout {
                        return Err(Error::LockFailed(path.to_path_buf()));
                    }
                    std::thread::sleep(retry_interval);
                }
                Err(e) => {
                    return Err(Error::Io(e));
                }
            }
        }
    }

    /// Try to acquire a lock without waiting
    ///
    /// Returns `Ok(Some(lock))` if acquired, `Ok(None)` if would block,
    /// or `Err` for other errors.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file = open_lock_file(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLock {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if is_lock_contended(&e) => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Get the path to the locked file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Unlock the file - ignore errors during drop
        let _ = self.file.unlock();
    }
}

/// Atomically replace `path` with `data`.
///
/// The bytes go to a temp file in the same directory, are read back and
/// passed to `verify`, and only then renamed over the target. A failed
/// verification leaves the target untouched and the temp file is removed.
/// Does not lock; callers hold the [`FileLock`] for `path`.
pub fn write_atomic_verified<F>(path: &Path, data: &[u8], verify: F) -> Result<()>
where
    F: FnOnce(&[u8]) -> Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;

    let written = fs::read(temp.path())?;
    verify(&written)?;

    temp.persist(path).map_err(|err| Error::Io(err.error))?;
    Ok(())
}

/// Atomically replace `path` with `data` without verification
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    write_atomic_verified(path, data, |_| Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_file_lock_acquire_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("tasks.json.lock");

        let lock = FileLock::acquire(&lock_path, 1000).unwrap();
        assert!(lock_path.exists());
        assert_eq!(lock.path(), lock_path.as_path());

        let result = FileLock::try_acquire(&lock_path).unwrap();
        assert!(result.is_none());

        drop(lock);

        let lock2 = FileLock::try_acquire(&lock_path).unwrap();
        assert!(lock2.is_some());
    }

    #[test]
    fn lock_path_is_a_sibling() {
        let path = Path::new("/tmp/project/.taskdb/tasks.json");
        assert_eq!(
            lock_path_for(path),
            PathBuf::from("/tmp/project/.taskdb/tasks.json.lock")
        );
    }

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("tasks.json");

        write_atomic(&file_path, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "{\"a\":1}");

        write_atomic(&file_path, b"{\"a\":2}").unwrap();
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "{\"a\":2}");
    }

    #[test]
    fn failed_verification_keeps_previous_contents() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("tasks.json");
        write_atomic(&file_path, b"old").unwrap();

        let result = write_atomic_verified(&file_path, b"new", |bytes| {
            assert_eq!(bytes, b"new");
            Err(Error::CorruptDocument("rejected".to_string()))
        });
        assert!(matches!(result, Err(Error::CorruptDocument(_))));
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "old");

        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name() != "tasks.json")
            .collect();
        assert!(leftovers.is_empty(), "temp file left behind: {leftovers:?}");
    }

    #[test]
    fn stress_single_lock_holder() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("stress.lock");

        let threads = 12;
        let barrier = Arc::new(Barrier::new(threads));
        let in_lock = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let acquired = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let barrier = Arc::clone(&barrier);
            let in_lock = Arc::clone(&in_lock);
            let max_concurrent = Arc::clone(&max_concurrent);
            let acquired = Arc::clone(&acquired);
            let lock_path = lock_path.clone();

            handles.push(thread::spawn(move || {
                barrier.wait();
                let _lock = FileLock::acquire(&lock_path, 2000).unwrap();

                let current = in_lock.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = max_concurrent.fetch_max(current, Ordering::SeqCst);

                thread::sleep(Duration::from_millis(10));

                in_lock.fetch_sub(1, Ordering::SeqCst);
                acquired.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(acquired.load(Ordering::SeqCst), threads);
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_returns_lock_failed() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("timeout.lock");

        let _lock = FileLock::acquire(&lock_path, 1000).unwrap();
        let result = FileLock::acquire(&lock_path, 50);
        assert!(matches!(result, Err(Error::LockFailed(_))));
    }
}
