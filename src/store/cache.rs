//! Session-owned cache of parsed documents.
//!
//! Entries are keyed by path and validated against the file's modification
//! time (and length) on every lookup; a mismatch reloads the document.
use super::atomic::AtomicStore;
use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: SystemTime,
    len: u64,
}

#[derive(Debug)]
struct Entry<T> {
    stamp: Stamp,
    value: T,
}

/// Explicit document cache; owned by whoever owns the session, never global.
#[derive(Debug)]
pub struct DocumentCache<T> {
    entries: HashMap<PathBuf, Entry<T>>,
    hits: u64,
    loads: u64,
}

impl<T> Default for DocumentCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            loads: 0,
        }
    }
}

impl<T> DocumentCache<T>
where
    T: DeserializeOwned + Serialize + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached document when the file is unchanged, otherwise
    /// reload it through `store`. Missing files are never cached.
    pub fn get_or_load<F>(&mut self, store: &AtomicStore, path: &Path, default: F) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        let Some(stamp) = stamp_of(path)? else {
            self.entries.remove(path);
            return Ok(default());
        };
        if let Some(entry) = self.entries.get(path) {
            if entry.stamp == stamp {
                self.hits += 1;
                return Ok(entry.value.clone());
            }
        }
        self.loads += 1;
        let value: T = store.read_json(path, default)?;
        self.entries.insert(
            path.to_path_buf(),
            Entry {
                stamp,
                value: value.clone(),
            },
        );
        Ok(value)
    }

    /// Write through the store and drop the entry so the next read re-stats.
    pub fn write_through(&mut self, store: &AtomicStore, path: &Path, value: &T) -> Result<()> {
        self.invalidate(path);
        store.write_json(path, value)
    }

    pub fn invalidate(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (cache hits, disk loads) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.loads)
    }
}

fn stamp_of(path: &Path) -> Result<Option<Stamp>> {
    match fs::metadata(path) {
        Ok(meta) => {
            let modified = meta
                .modified()
                .map_err(|err| StoreError::storage(path, "stat", err))?;
            Ok(Some(Stamp {
                modified,
                len: meta.len(),
            }))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::storage(path, "stat", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;

    #[test]
    fn unchanged_file_is_served_from_cache() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("ml.json");
        let store = AtomicStore::new(Duration::from_secs(1));
        store.write_json(&path, &json!({"v": 1})).expect("write");

        let mut cache: DocumentCache<Value> = DocumentCache::new();
        assert_eq!(cache.get_or_load(&store, &path, || json!(null)).expect("load"), json!({"v": 1}));
        assert_eq!(cache.get_or_load(&store, &path, || json!(null)).expect("hit"), json!({"v": 1}));
        assert_eq!(cache.stats(), (1, 1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn changed_file_is_reloaded() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("ml.json");
        let store = AtomicStore::new(Duration::from_secs(1));
        store.write_json(&path, &json!({"v": 1})).expect("write");

        let mut cache: DocumentCache<Value> = DocumentCache::new();
        cache.get_or_load(&store, &path, || json!(null)).expect("load");
        // Different length guarantees a new stamp even on coarse mtime filesystems.
        store
            .write_json(&path, &json!({"v": 1, "extra": "field"}))
            .expect("rewrite");
        let reloaded = cache.get_or_load(&store, &path, || json!(null)).expect("reload");
        assert_eq!(reloaded, json!({"v": 1, "extra": "field"}));
        assert_eq!(cache.stats(), (0, 2));
    }

    #[test]
    fn write_through_and_missing_files_invalidate() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("ml.json");
        let store = AtomicStore::new(Duration::from_secs(1));

        let mut cache: DocumentCache<Value> = DocumentCache::new();
        let missing = cache.get_or_load(&store, &path, || json!({"d": true})).expect("default");
        assert_eq!(missing, json!({"d": true}));
        assert!(cache.is_empty());

        cache.write_through(&store, &path, &json!({"v": 2})).expect("write");
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_load(&store, &path, || json!(null)).expect("load"), json!({"v": 2}));
        cache.clear();
        assert!(cache.is_empty());
    }
}
