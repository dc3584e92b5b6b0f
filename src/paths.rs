//! Typed paths into a store root.
//!
//! Centralizing path construction keeps file access consistent across the
//! store, backup, integrity, and workflow components.
use crate::workflow::WorkflowStatus;
use std::path::{Path, PathBuf};

/// Convenience wrapper for locating store artifacts.
#[derive(Debug, Clone)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    /// Create a new path helper rooted at the store root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Return the store root used for path derivation.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `config.json` path.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Return the `graphs/` directory path.
    pub fn graphs_dir(&self) -> PathBuf {
        self.root.join("graphs")
    }

    /// Return the `graphs/<topic>.json` path.
    pub fn graph_path(&self, topic: &str) -> PathBuf {
        self.graphs_dir().join(format!("{topic}.json"))
    }

    /// Return the `backups/` directory path.
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// Return the `workflows/` directory path.
    pub fn workflows_dir(&self) -> PathBuf {
        self.root.join("workflows")
    }

    /// Return the storage location for instances in the given status.
    pub fn workflow_dir(&self, status: WorkflowStatus) -> PathBuf {
        self.workflows_dir().join(status.dir_name())
    }

    /// Return the instance record path for a status location.
    pub fn instance_path(&self, status: WorkflowStatus, instance_id: &str) -> PathBuf {
        self.workflow_dir(status).join(format!("{instance_id}.json"))
    }

    /// Return the backup root for workflow records.
    pub fn instance_backups_dir(&self) -> PathBuf {
        self.workflows_dir().join("backups")
    }

    /// Return the lock sidecar for an instance; it stays put across relocation.
    pub fn instance_lock_path(&self, instance_id: &str) -> PathBuf {
        self.workflows_dir()
            .join("locks")
            .join(format!("{instance_id}.lock"))
    }

    /// Return the `audit.jsonl` path.
    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }
}

/// Name used for a document's backups: the file stem.
pub fn document_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string())
}

/// Lock sidecar path for a document (`<file>.lock`).
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}
