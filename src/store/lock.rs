//! Advisory cross-process locks on `<file>.lock` sidecars.
//!
//! Locks live on a sidecar rather than the document itself because atomic
//! replacement swaps the document's inode out from under any lock held on it.
use crate::error::{Result, StoreError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A held advisory lock; released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// Acquire `mode` on the sidecar at `lock_path`, polling until `timeout`.
    pub fn acquire(lock_path: &Path, mode: LockMode, timeout: Duration) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreError::storage(parent, "create lock directory", err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)
            .map_err(|err| StoreError::storage(lock_path, "open lock", err))?;

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut contended = false;
        loop {
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => {
                    if contended {
                        tracing::debug!(
                            lock = %lock_path.display(),
                            waited_ms = started.elapsed().as_millis() as u64,
                            "acquired contended lock"
                        );
                    }
                    return Ok(Self {
                        file,
                        path: lock_path.to_path_buf(),
                        mode,
                    });
                }
                Err(err) if is_contended(&err) => {
                    contended = true;
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        tracing::warn!(
                            lock = %lock_path.display(),
                            ?mode,
                            "lock wait timed out"
                        );
                        return Err(StoreError::LockTimeout {
                            path: lock_path.to_path_buf(),
                            waited_ms: elapsed.as_millis() as u64,
                        });
                    }
                    thread::sleep(backoff.min(timeout - elapsed));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(err) => return Err(StoreError::storage(lock_path, "lock", err)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The sidecar stays on disk; deleting it would let a waiter lock a stale inode.
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
