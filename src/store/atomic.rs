//! Locked read/write/append primitives with crash-safe replacement.
//!
//! Writers stage content in a uniquely named temp file beside the target,
//! force it to disk, and rename it over the target, so readers only ever see
//! the old or the new document.
use super::lock::{FileLock, LockMode};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::paths::lock_path_for;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TEMP_SUFFIX: &str = ".tmp";

/// Entry point for every locked document access.
#[derive(Debug, Clone)]
pub struct AtomicStore {
    lock_timeout: Duration,
}

impl AtomicStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self { lock_timeout }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.lock_timeout())
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Read and parse a document under a shared lock.
    ///
    /// A missing file yields `default()`; unparsable content is a corruption
    /// error, never a silent default.
    pub fn read_json<T, F>(&self, path: &Path, default: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        let _lock = FileLock::acquire(&lock_path_for(path), LockMode::Shared, self.lock_timeout)?;
        read_json_unlocked(path, default)
    }

    /// Shared lock on an explicit sidecar, held while the caller reads one or
    /// more files it protects.
    pub fn lock_shared_at(&self, lock_path: &Path) -> Result<SharedGuard> {
        let lock = FileLock::acquire(lock_path, LockMode::Shared, self.lock_timeout)?;
        Ok(SharedGuard { lock })
    }

    /// Raw bytes under a shared lock; `None` when the file does not exist.
    pub fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let _lock = FileLock::acquire(&lock_path_for(path), LockMode::Shared, self.lock_timeout)?;
        read_bytes_unlocked(path)
    }

    /// Serialize and atomically replace `path` under an exclusive lock.
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let guard = self.lock_exclusive(path)?;
        guard.write_json(path, value)
    }

    /// Atomically replace `path` with `bytes` under an exclusive lock.
    pub fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let guard = self.lock_exclusive(path)?;
        guard.write_bytes(path, bytes)
    }

    /// Append one line under an exclusive lock with a single write call.
    ///
    /// Only sequential logs use this; appended files are never rewritten.
    pub fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        let _lock =
            FileLock::acquire(&lock_path_for(path), LockMode::Exclusive, self.lock_timeout)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreError::storage(parent, "create directory", err))?;
        }
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line.trim_end_matches('\n'));
        record.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| StoreError::storage(path, "open", err))?;
        file.write_all(record.as_bytes())
            .map_err(|err| StoreError::storage(path, "append to", err))?;
        file.flush()
            .map_err(|err| StoreError::storage(path, "flush", err))?;
        file.sync_data()
            .map_err(|err| StoreError::storage(path, "sync", err))?;
        Ok(())
    }

    /// Take the exclusive lock for `path` and hold it for a whole
    /// read-modify-write cycle.
    pub fn lock_exclusive(&self, path: &Path) -> Result<ExclusiveGuard> {
        self.lock_exclusive_at(&lock_path_for(path))
    }

    /// Exclusive lock on an explicit sidecar, for records that move between
    /// directories.
    pub fn lock_exclusive_at(&self, lock_path: &Path) -> Result<ExclusiveGuard> {
        let lock = FileLock::acquire(lock_path, LockMode::Exclusive, self.lock_timeout)?;
        Ok(ExclusiveGuard { lock })
    }

    /// Read, mutate, and write back a document while one exclusive lock is held.
    pub fn update<T, R, D, F>(&self, path: &Path, default: D, mutate: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize,
        D: FnOnce() -> T,
        F: FnOnce(&mut T) -> Result<R>,
    {
        let guard = self.lock_exclusive(path)?;
        let mut doc = guard.read_json(path, default)?;
        let out = mutate(&mut doc)?;
        guard.write_json(path, &doc)?;
        Ok(out)
    }
}

/// Proof that a shared lock is held.
#[derive(Debug)]
pub struct SharedGuard {
    lock: FileLock,
}

impl SharedGuard {
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    pub fn read_json<T, F>(&self, path: &Path, default: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        read_json_unlocked(path, default)
    }

    pub fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        read_bytes_unlocked(path)
    }
}

/// Proof that an exclusive lock is held; exposes the unlocked primitives.
#[derive(Debug)]
pub struct ExclusiveGuard {
    lock: FileLock,
}

impl ExclusiveGuard {
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    pub fn read_json<T, F>(&self, path: &Path, default: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        read_json_unlocked(path, default)
    }

    pub fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        read_bytes_unlocked(path)
    }

    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        write_atomic(path, &to_document_bytes(path, value)?)
    }

    pub fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        write_atomic(path, bytes)
    }
}

/// Pretty JSON with a trailing newline, the on-disk document format.
pub fn to_document_bytes<T: Serialize>(path: &Path, value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|err| {
        StoreError::storage(path, "serialize", std::io::Error::other(err))
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn read_bytes_unlocked(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::storage(path, "read", err)),
    }
}

fn read_json_unlocked<T, F>(path: &Path, default: F) -> Result<T>
where
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    let Some(bytes) = read_bytes_unlocked(path)? else {
        return Ok(default());
    };
    serde_json::from_slice(&bytes).map_err(|err| StoreError::corruption(path, err))
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic_with(path, bytes, |_| Ok(()))
}

/// `before_replace` runs after the temp file is durable and before the
/// rename; an error there behaves like a writer dying at that point.
pub(crate) fn write_atomic_with<F>(path: &Path, bytes: &[u8], before_replace: F) -> Result<()>
where
    F: FnOnce(&Path) -> std::io::Result<()>,
{
    let dir = parent_dir(path);
    fs::create_dir_all(&dir).map_err(|err| StoreError::storage(&dir, "create directory", err))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(&temp_prefix(path))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(&dir)
        .map_err(|err| StoreError::storage(path, "create temp file for", err))?;
    tmp.write_all(bytes)
        .map_err(|err| StoreError::storage(tmp.path(), "write", err))?;
    tmp.flush()
        .map_err(|err| StoreError::storage(tmp.path(), "flush", err))?;
    tmp.as_file()
        .sync_all()
        .map_err(|err| StoreError::storage(tmp.path(), "sync", err))?;
    before_replace(tmp.path()).map_err(|err| StoreError::storage(path, "replace", err))?;
    // A failed persist hands the temp file back inside the error; dropping it deletes it.
    tmp.persist(path)
        .map_err(|err| StoreError::storage(path, "replace", err.error))?;
    sync_dir(&dir);
    Ok(())
}

/// Temp names carry the pid and a nanosecond stamp so two same-second
/// invocations never collide; tempfile adds a random tail on top.
fn temp_prefix(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!(".{file_name}.{}.{nanos}.", std::process::id())
}

/// Whether a file name looks like a temp file left by [`write_atomic`].
pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX) && name.len() > TEMP_SUFFIX.len() + 1
}

/// Temp files in `dir` older than `min_age`, i.e. left behind by dead writers.
pub fn find_orphan_temps(dir: &Path, min_age: Duration) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::storage(dir, "list", err)),
    };
    let now = SystemTime::now();
    let mut orphans = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::storage(dir, "list", err))?;
        let name = entry.file_name();
        if !is_temp_file_name(&name.to_string_lossy()) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age >= min_age {
            orphans.push(entry.path());
        }
    }
    orphans.sort();
    Ok(orphans)
}

/// Delete orphaned temp files; returns what was removed.
pub fn sweep_orphan_temps(dir: &Path, min_age: Duration) -> Result<Vec<PathBuf>> {
    let orphans = find_orphan_temps(dir, min_age)?;
    for orphan in &orphans {
        fs::remove_file(orphan).map_err(|err| StoreError::storage(orphan, "remove", err))?;
        tracing::info!(path = %orphan.display(), "removed orphaned temp file");
    }
    Ok(orphans)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = fs::File::open(dir).and_then(|handle| handle.sync_all()) {
        tracing::debug!(dir = %dir.display(), %err, "directory fsync unsupported");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
#[path = "atomic_tests.rs"]
mod tests;
