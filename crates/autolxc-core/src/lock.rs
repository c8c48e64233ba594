//! Cross-process file locks and atomic writes for shared on-disk state
//!
//! Every bucket on a host shares the LXC path, so the base image download and
//! the clone-index ledger are guarded by sibling `*.lock` files.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Write content to a file atomically using a temp-file-then-rename pattern.
///
/// A crash during the write leaves the old file intact.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Run `f` while holding the lock for `path`.
pub(crate) fn with_path_lock<T, F>(path: &Path, max_wait: Duration, f: F) -> std::io::Result<T>
where
    F: FnOnce() -> std::io::Result<T>,
{
    let _lock = acquire_lock(path, max_wait)?;
    f()
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

/// Held lock; the lock file is removed on drop.
#[derive(Debug)]
pub(crate) struct PathLockGuard {
    lock_path: PathBuf,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

/// Acquire an exclusive lock for `path`, polling until `max_wait` elapses.
///
/// Blocks the calling thread; async callers go through
/// [`acquire_lock_async`].
pub(crate) fn acquire_lock(path: &Path, max_wait: Duration) -> std::io::Result<PathLockGuard> {
    let lock_path = lock_path_for(path);
    let deadline = Instant::now() + max_wait;
    loop {
        match std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                return Ok(PathLockGuard { lock_path });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Instant::now() >= deadline {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("timed out waiting for lock {}", lock_path.display()),
                    ));
                }
                std::thread::sleep(LOCK_POLL_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) async fn acquire_lock_async(
    path: PathBuf,
    max_wait: Duration,
) -> std::io::Result<PathLockGuard> {
    tokio::task::spawn_blocking(move || acquire_lock(&path, max_wait))
        .await
        .map_err(std::io::Error::other)?
}
