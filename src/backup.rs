//! Timestamped backups taken before destructive writes.
//!
//! Graph backups live under `backups/<name>/<name>_<stamp>.json` and
//! workflow record backups under `workflows/backups/<id>/`, keyed by instance
//! id so they survive relocation. Stamps sort lexicographically in
//! chronological order, so listing is a name sort.
//! Pruning only runs after a new backup succeeded, so at least one
//! recoverable copy always exists.
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::paths::{document_name, StorePaths};
use crate::store::{write_atomic, AtomicStore, ExclusiveGuard};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.9fZ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    pub name: String,
    /// File stem, `<name>_<stamp>`; accepted by `restore`.
    pub id: String,
    pub stamp: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSelector {
    Latest,
    /// Either the bare stamp or the full backup id.
    Timestamp(String),
}

impl fmt::Display for BackupSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupSelector::Latest => f.write_str("latest"),
            BackupSelector::Timestamp(stamp) => write!(f, "timestamp {stamp}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub restored_from: BackupEntry,
    /// Copy of the pre-restore file, when there was one.
    pub safety_backup: Option<BackupEntry>,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    store: AtomicStore,
    retention: usize,
}

impl BackupManager {
    /// Backups of graph documents.
    pub fn new(paths: StorePaths, store: AtomicStore, retention: usize) -> Self {
        Self::at(paths.backups_dir(), store, retention)
    }

    pub fn from_config(paths: StorePaths, config: &StoreConfig) -> Self {
        Self::new(paths, AtomicStore::from_config(config), config.backup_retention)
    }

    /// Backups of workflow instance records.
    pub fn for_instances(paths: &StorePaths, store: AtomicStore, retention: usize) -> Self {
        Self::at(paths.instance_backups_dir(), store, retention)
    }

    fn at(root: PathBuf, store: AtomicStore, retention: usize) -> Self {
        Self {
            root,
            store,
            retention: retention.max(1),
        }
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Copy the current file into the backup location. A file that does not
    /// exist yet needs no backup. Callers hold the document's exclusive lock.
    pub fn backup_before_write(&self, path: &Path) -> Result<Option<BackupEntry>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::storage(path, "read for backup", err)),
        };
        let name = document_name(path);
        let dir = self.dir(&name);
        let stamp = free_stamp(&dir, &name, &Utc::now().format(STAMP_FORMAT).to_string());
        let id = format!("{name}_{stamp}");
        let backup_path = dir.join(format!("{id}.json"));
        write_atomic(&backup_path, &bytes)?;
        tracing::debug!(document = %path.display(), backup = %id, "backup taken");
        Ok(Some(BackupEntry {
            name,
            id,
            stamp,
            path: backup_path,
            size: bytes.len() as u64,
        }))
    }

    /// Backup, replace, then prune: the sequence every destructive write uses.
    /// A failed backup aborts the write.
    pub fn protected_write(
        &self,
        guard: &ExclusiveGuard,
        path: &Path,
        bytes: &[u8],
    ) -> Result<Option<BackupEntry>> {
        let backup = self.backup_before_write(path)?;
        guard.write_bytes(path, bytes)?;
        if let Some(entry) = &backup {
            self.prune(&entry.name, self.retention)?;
        }
        Ok(backup)
    }

    /// Backups of `name`, newest first.
    pub fn list(&self, name: &str) -> Result<Vec<BackupEntry>> {
        let dir = self.dir(name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::storage(&dir, "list", err)),
        };
        let prefix = format!("{name}_");
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::storage(&dir, "list", err))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = file_name.strip_suffix(".json") else {
                continue;
            };
            let Some(stamp) = id.strip_prefix(&prefix) else {
                continue;
            };
            let size = entry.metadata().map(|meta| meta.len()).unwrap_or_default();
            backups.push(BackupEntry {
                name: name.to_string(),
                id: id.to_string(),
                stamp: stamp.to_string(),
                path: entry.path(),
                size,
            });
        }
        backups.sort_by(|a, b| b.stamp.cmp(&a.stamp));
        Ok(backups)
    }

    pub fn latest(&self, name: &str) -> Result<Option<BackupEntry>> {
        Ok(self.list(name)?.into_iter().next())
    }

    /// Delete the oldest backups beyond `max_keep`; returns what was removed.
    pub fn prune(&self, name: &str, max_keep: usize) -> Result<Vec<BackupEntry>> {
        let keep = max_keep.max(1);
        let stale: Vec<BackupEntry> = self.list(name)?.into_iter().skip(keep).collect();
        for entry in &stale {
            fs::remove_file(&entry.path)
                .map_err(|err| StoreError::storage(&entry.path, "prune backup", err))?;
            tracing::debug!(backup = %entry.id, "pruned backup");
        }
        Ok(stale)
    }

    /// The backup of `name` the selector picks.
    pub fn find(&self, name: &str, selector: &BackupSelector) -> Result<BackupEntry> {
        let backups = self.list(name)?;
        let found = match selector {
            BackupSelector::Latest => backups.into_iter().next(),
            BackupSelector::Timestamp(wanted) => backups
                .into_iter()
                .find(|entry| &entry.stamp == wanted || &entry.id == wanted),
        };
        found.ok_or_else(|| StoreError::BackupNotFound {
            name: name.to_string(),
            selector: selector.to_string(),
        })
    }

    /// Write a backup's content back over `path`, backing up the current
    /// file first.
    pub fn restore(&self, path: &Path, selector: &BackupSelector) -> Result<RestoreOutcome> {
        let name = document_name(path);
        let guard = self.store.lock_exclusive(path)?;
        let restored_from = self.find(&name, selector)?;
        let bytes = fs::read(&restored_from.path)
            .map_err(|err| StoreError::storage(&restored_from.path, "read backup", err))?;
        serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|err| {
            StoreError::corruption(&restored_from.path, format!("backup is not valid JSON: {err}"))
        })?;
        let safety_backup = self.protected_write(&guard, path, &bytes)?;
        tracing::info!(
            document = %path.display(),
            backup = %restored_from.id,
            "restored document from backup"
        );
        Ok(RestoreOutcome {
            restored_from,
            safety_backup,
        })
    }
}

/// `base`, or `base-NNNN` when backups in the same instant already exist.
/// The suffix is zero-padded so collisions keep sorting chronologically.
fn free_stamp(dir: &Path, name: &str, base: &str) -> String {
    let mut stamp = base.to_string();
    let mut suffix = 1;
    while dir.join(format!("{name}_{stamp}.json")).exists() {
        stamp = format!("{base}-{suffix:04}");
        suffix += 1;
    }
    stamp
}
