//! Storage adapter for workflow instance records.
//!
//! Records live under `workflows/<location>/<id>.json`. Every access
//! coordinates on `workflows/locks/<id>.lock`, which does not move when the
//! record is relocated, so a reader never races a relocation. Every
//! overwrite or removal is preceded by a backup under
//! `workflows/backups/<id>/`.
//!
//! Relocation writes the record into its new location before removing the
//! old copy. A crash in between leaves two copies; the terminal one is
//! authoritative, and the next exclusive read finishes the move.
use super::{WorkflowInstance, WorkflowStatus};
use crate::backup::{BackupEntry, BackupManager};
use crate::error::{Result, StoreError};
use crate::paths::StorePaths;
use crate::store::{is_temp_file_name, to_document_bytes, AtomicStore, ExclusiveGuard};
use std::fs;
use std::path::{Path, PathBuf};

/// Lookup order when several locations hold a copy: a terminal copy is
/// only ever written after the in-progress one, so it wins.
const LOOKUP_ORDER: [WorkflowStatus; 3] = [
    WorkflowStatus::Completed,
    WorkflowStatus::Abandoned,
    WorkflowStatus::InProgress,
];

#[derive(Debug, Clone)]
pub struct InstanceStore {
    paths: StorePaths,
    store: AtomicStore,
    backups: BackupManager,
}

impl InstanceStore {
    pub fn new(paths: StorePaths, store: AtomicStore, retention: usize) -> Self {
        let backups = BackupManager::for_instances(&paths, store.clone(), retention);
        Self {
            paths,
            store,
            backups,
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Exclusive lock for one instance, held across a read-modify-write cycle.
    pub fn lock(&self, instance_id: &str) -> Result<ExclusiveGuard> {
        self.store
            .lock_exclusive_at(&self.paths.instance_lock_path(instance_id))
    }

    /// Find the authoritative copy of the record.
    pub fn locate(&self, instance_id: &str) -> Option<(WorkflowStatus, PathBuf)> {
        self.copies(instance_id).into_iter().next()
    }

    /// Every location holding a copy, authoritative first.
    pub fn copies(&self, instance_id: &str) -> Vec<(WorkflowStatus, PathBuf)> {
        LOOKUP_ORDER
            .iter()
            .map(|status| (*status, self.paths.instance_path(*status, instance_id)))
            .filter(|(_, path)| path.is_file())
            .collect()
    }

    /// Read a record under a shared lock; `None` when no location holds it.
    ///
    /// The returned location is where the record was found, which differs
    /// from its status while a relocation is unfinished.
    pub fn read(
        &self,
        instance_id: &str,
    ) -> Result<Option<(WorkflowStatus, WorkflowInstance)>> {
        let guard = self
            .store
            .lock_shared_at(&self.paths.instance_lock_path(instance_id))?;
        let Some((location, path)) = self.locate(instance_id) else {
            return Ok(None);
        };
        let instance: Option<WorkflowInstance> = guard.read_json(&path, || None)?;
        Ok(instance.map(|instance| (location, instance)))
    }

    /// Read a record while the caller holds the instance's exclusive lock,
    /// finishing any interrupted relocation first. The record is then in
    /// the location matching its status.
    pub fn read_locked(
        &self,
        guard: &ExclusiveGuard,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance>> {
        let Some((location, path)) = self.locate(instance_id) else {
            return Ok(None);
        };
        let instance: Option<WorkflowInstance> = guard.read_json(&path, || None)?;
        let Some(instance) = instance else {
            return Ok(None);
        };
        if location != instance.status || self.copies(instance_id).len() > 1 {
            tracing::warn!(
                instance = instance_id,
                found_in = location.dir_name(),
                status = instance.status.as_str(),
                "finishing interrupted relocation"
            );
            self.relocate(guard, &instance)?;
        }
        Ok(Some(instance))
    }

    /// Atomically write the record into the location for its status,
    /// backing up the copy it replaces.
    pub fn save(
        &self,
        guard: &ExclusiveGuard,
        instance: &WorkflowInstance,
    ) -> Result<Option<BackupEntry>> {
        let path = self.paths.instance_path(instance.status, &instance.instance_id);
        let bytes = to_document_bytes(&path, instance)?;
        self.backups.protected_write(guard, &path, &bytes)
    }

    /// Move the record into the location matching its status: write the
    /// new copy, then back up and remove every other one. Returns the
    /// backups taken, oldest content first.
    pub fn relocate(
        &self,
        guard: &ExclusiveGuard,
        instance: &WorkflowInstance,
    ) -> Result<Vec<BackupEntry>> {
        let instance_id = instance.instance_id.as_str();
        let mut taken = Vec::new();
        let stale: Vec<(WorkflowStatus, PathBuf)> = self
            .copies(instance_id)
            .into_iter()
            .filter(|(location, _)| *location != instance.status)
            .collect();
        for (_, path) in &stale {
            taken.extend(self.backups.backup_before_write(path)?);
        }
        taken.extend(self.save(guard, instance)?);
        for (location, path) in stale {
            fs::remove_file(&path).map_err(|err| StoreError::storage(&path, "relocate", err))?;
            tracing::info!(
                instance = instance_id,
                from = location.dir_name(),
                to = instance.status.dir_name(),
                "relocated workflow instance"
            );
        }
        self.backups.prune(instance_id, self.backups.retention())?;
        Ok(taken)
    }

    /// Record files in every location, sorted by path.
    pub fn record_paths(&self) -> Result<Vec<(WorkflowStatus, PathBuf)>> {
        let mut found = Vec::new();
        for status in WorkflowStatus::ALL {
            let dir = self.paths.workflow_dir(status);
            for path in json_files(&dir)? {
                found.push((status, path));
            }
        }
        Ok(found)
    }

    /// Every readable record, once per instance. Unreadable ones are skipped
    /// with a warning so one bad file does not hide the rest; `kgstate check`
    /// reports them.
    pub fn list(&self) -> Result<Vec<(WorkflowStatus, WorkflowInstance)>> {
        let mut instances = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for (location, path) in self.record_paths()? {
            let Some(instance_id) = path.file_stem().map(|stem| stem.to_string_lossy().to_string())
            else {
                continue;
            };
            if !seen.insert(instance_id.clone()) {
                continue;
            }
            match self.read(&instance_id) {
                Ok(Some(found)) => instances.push(found),
                Ok(None) => {}
                Err(err @ StoreError::Corruption { .. }) => {
                    tracing::warn!(path = %path.display(), location = location.dir_name(), %err, "skipping unreadable instance");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(instances)
    }
}

/// `*.json` files directly inside `dir`; temp files are excluded.
pub(crate) fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::storage(dir, "list", err)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::storage(dir, "list", err))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if is_temp_file_name(&name) || !name.ends_with(".json") {
            continue;
        }
        if entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
