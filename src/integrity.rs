//! Corruption detection and repair for stored documents.
//!
//! Unparsable files can only be restored from backup. Parsable graph
//! documents whose problems are all element-level are repaired by removing
//! the offending nodes and edges; nothing is ever invented to fill a gap.
//! A workflow record found outside the location its status names, or
//! shadowed by a terminal copy, is left over from an interrupted relocation
//! and is repaired by finishing the move.
use crate::backup::{BackupEntry, BackupManager};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::graph::schema::{check_edge, check_node, validate_graph};
use crate::paths::{document_name, StorePaths};
use crate::store::{find_orphan_temps, sweep_orphan_temps, to_document_bytes, AtomicStore};
use crate::workflow::{json_files, validate_instance_value, InstanceStore, WorkflowStatus};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Temp files younger than this may belong to a live writer.
pub const ORPHAN_MIN_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Graph,
    WorkflowInstance,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub path: PathBuf,
    pub kind: DocumentKind,
    pub valid: bool,
    pub errors: Vec<String>,
    pub repairable: bool,
    pub latest_backup: Option<String>,
    /// What an operator should do about an invalid document.
    pub next_step: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RepairOutcome {
    AlreadyValid,
    Repaired {
        nodes_removed: usize,
        edges_removed: usize,
        backup: Option<BackupEntry>,
    },
    /// An interrupted relocation was finished; `path` is the record's home.
    Relocated {
        instance_id: String,
        #[serde(rename = "moved_to")]
        status: WorkflowStatus,
        path: PathBuf,
    },
    /// Nothing was written; the document needs a restore or manual fix.
    Refused { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairRecord {
    pub path: PathBuf,
    pub outcome: Option<RepairOutcome>,
    /// Set when the repair itself failed.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegritySummary {
    pub reports: Vec<IntegrityReport>,
    pub repairs: Vec<RepairRecord>,
    pub orphan_temps: Vec<PathBuf>,
    pub swept_temps: Vec<PathBuf>,
    /// Invalid documents left after any repairs.
    pub remaining_invalid: usize,
}

impl IntegritySummary {
    pub fn invalid_count(&self) -> usize {
        self.reports.iter().filter(|report| !report.valid).count()
    }

    pub fn repair_failures(&self) -> usize {
        self.repairs
            .iter()
            .filter(|record| record.error.is_some())
            .count()
    }

    /// 0 clean, 1 corruption found or left unrepaired, 2 a repair failed.
    pub fn exit_code(&self) -> i32 {
        if self.repair_failures() > 0 {
            2
        } else if self.remaining_invalid > 0 {
            1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityChecker {
    paths: StorePaths,
    store: AtomicStore,
    backups: BackupManager,
    instances: InstanceStore,
}

impl IntegrityChecker {
    pub fn new(paths: StorePaths, store: AtomicStore, retention: usize) -> Self {
        Self {
            backups: BackupManager::new(paths.clone(), store.clone(), retention),
            instances: InstanceStore::new(paths.clone(), store.clone(), retention),
            paths,
            store,
        }
    }

    pub fn from_config(paths: StorePaths, config: &StoreConfig) -> Self {
        Self::new(paths, AtomicStore::from_config(config), config.backup_retention)
    }

    /// Classify one document. Workflow records are recognised by living
    /// under `workflows/`.
    pub fn check(&self, path: &Path) -> Result<IntegrityReport> {
        let kind = self.kind_of(path);
        let bytes = match kind {
            DocumentKind::Graph => self.store.read_bytes(path)?,
            DocumentKind::WorkflowInstance => {
                let guard = self
                    .store
                    .lock_shared_at(&self.paths.instance_lock_path(&document_name(path)))?;
                guard.read_bytes(path)?
            }
        };
        let Some(bytes) = bytes else {
            return Ok(self.invalid(path, kind, vec!["file does not exist".to_string()], false));
        };
        let value: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                return Ok(self.invalid(path, kind, vec![format!("unparsable JSON: {err}")], false));
            }
        };
        let report = match kind {
            DocumentKind::Graph => {
                let schema = validate_graph(&value);
                if schema.ok {
                    self.valid(path, kind)
                } else {
                    self.invalid(path, kind, schema.messages(), schema.is_repairable())
                }
            }
            DocumentKind::WorkflowInstance => {
                let errors = validate_instance_value(&value);
                if !errors.is_empty() {
                    self.invalid(path, kind, errors, false)
                } else {
                    match self.misplacement(path, &value) {
                        Some(error) => self.invalid(path, kind, vec![error], true),
                        None => self.valid(path, kind),
                    }
                }
            }
        };
        Ok(report)
    }

    /// Why a schema-valid record is not where its status says it belongs.
    fn misplacement(&self, path: &Path, value: &Value) -> Option<String> {
        let status = value
            .get("status")
            .cloned()
            .and_then(|raw| serde_json::from_value::<WorkflowStatus>(raw).ok())?;
        let instance_id = document_name(path);
        let home = self.paths.instance_path(status, &instance_id);
        if path != home {
            return Some(format!(
                "record with status `{status}` sits outside `{}`; relocation was interrupted",
                status.dir_name()
            ));
        }
        match self.instances.locate(&instance_id) {
            Some((_, authoritative)) if authoritative != path => Some(format!(
                "superseded by `{}`; relocation was interrupted",
                authoritative.display()
            )),
            _ => None,
        }
    }

    /// Finish an interrupted relocation under the instance lock.
    fn settle_instance(&self, path: &Path) -> Result<RepairOutcome> {
        let instance_id = document_name(path);
        let guard = self.instances.lock(&instance_id)?;
        let before = self.instances.copies(&instance_id);
        let instance = match self.instances.read_locked(&guard, &instance_id) {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                return Ok(RepairOutcome::Refused {
                    reason: "file does not exist".to_string(),
                });
            }
            Err(StoreError::Corruption { .. }) => {
                return Ok(RepairOutcome::Refused {
                    reason: self.instance_restore_hint(&instance_id),
                });
            }
            Err(err) => return Err(err),
        };
        let home = self.paths.instance_path(instance.status, &instance_id);
        if before.len() == 1 && before[0].1 == home {
            return Ok(RepairOutcome::AlreadyValid);
        }
        Ok(RepairOutcome::Relocated {
            instance_id,
            status: instance.status,
            path: home,
        })
    }

    /// Remove offending graph elements after taking a fresh backup.
    pub fn repair(&self, path: &Path) -> Result<RepairOutcome> {
        if self.kind_of(path) == DocumentKind::WorkflowInstance {
            return self.settle_instance(path);
        }
        let guard = self.store.lock_exclusive(path)?;
        let Some(bytes) = guard.read_bytes(path)? else {
            return Ok(RepairOutcome::Refused {
                reason: "file does not exist".to_string(),
            });
        };
        let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
            return Ok(RepairOutcome::Refused {
                reason: self.restore_hint(path),
            });
        };
        let schema = validate_graph(&value);
        if schema.ok {
            return Ok(RepairOutcome::AlreadyValid);
        }
        if !schema.is_repairable() {
            return Ok(RepairOutcome::Refused {
                reason: format!(
                    "document shape is invalid ({}); {}",
                    schema.messages().join("; "),
                    self.restore_hint(path)
                ),
            });
        }
        let stripped = strip_invalid_elements(&value);
        let recheck = validate_graph(&stripped.document);
        if !recheck.ok {
            return Err(StoreError::Validation {
                violations: recheck.violations,
            });
        }
        let bytes = to_document_bytes(path, &stripped.document)?;
        let backup = self.backups.protected_write(&guard, path, &bytes)?;
        tracing::info!(
            path = %path.display(),
            nodes_removed = stripped.nodes_removed,
            edges_removed = stripped.edges_removed,
            "repaired graph document"
        );
        Ok(RepairOutcome::Repaired {
            nodes_removed: stripped.nodes_removed,
            edges_removed: stripped.edges_removed,
            backup,
        })
    }

    /// Check every graph document and workflow record under the store root.
    pub fn check_all(&self) -> Result<IntegritySummary> {
        let mut summary = IntegritySummary::default();
        for path in self.document_paths()? {
            summary.reports.push(self.check(&path)?);
        }
        for dir in self.temp_dirs() {
            summary
                .orphan_temps
                .extend(find_orphan_temps(&dir, ORPHAN_MIN_AGE)?);
        }
        summary.remaining_invalid = summary.invalid_count();
        Ok(summary)
    }

    /// Check, repair what is repairable, and sweep orphaned temp files.
    pub fn fix_all(&self) -> Result<IntegritySummary> {
        let mut summary = self.check_all()?;
        let mut remaining = 0;
        for report in summary.reports.iter().filter(|report| !report.valid) {
            if !report.repairable {
                remaining += 1;
                continue;
            }
            let record = match self.repair(&report.path) {
                Ok(outcome) => {
                    if !matches!(
                        outcome,
                        RepairOutcome::Repaired { .. }
                            | RepairOutcome::Relocated { .. }
                            | RepairOutcome::AlreadyValid
                    ) {
                        remaining += 1;
                    }
                    RepairRecord {
                        path: report.path.clone(),
                        outcome: Some(outcome),
                        error: None,
                    }
                }
                Err(err) => {
                    tracing::error!(path = %report.path.display(), %err, "repair failed");
                    remaining += 1;
                    RepairRecord {
                        path: report.path.clone(),
                        outcome: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            summary.repairs.push(record);
        }
        for dir in self.temp_dirs() {
            summary
                .swept_temps
                .extend(sweep_orphan_temps(&dir, ORPHAN_MIN_AGE)?);
        }
        summary.remaining_invalid = remaining;
        Ok(summary)
    }

    fn document_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = json_files(&self.paths.graphs_dir())?;
        for status in WorkflowStatus::ALL {
            paths.extend(json_files(&self.paths.workflow_dir(status))?);
        }
        Ok(paths)
    }

    fn temp_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.paths.graphs_dir()];
        dirs.extend(
            WorkflowStatus::ALL
                .iter()
                .map(|status| self.paths.workflow_dir(*status)),
        );
        dirs
    }

    fn kind_of(&self, path: &Path) -> DocumentKind {
        if path.starts_with(self.paths.workflows_dir()) {
            DocumentKind::WorkflowInstance
        } else {
            DocumentKind::Graph
        }
    }

    fn latest_backup(&self, path: &Path) -> Option<String> {
        match self.backups.latest(&document_name(path)) {
            Ok(entry) => entry.map(|entry| entry.id),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "could not list backups");
                None
            }
        }
    }

    fn restore_hint(&self, path: &Path) -> String {
        let name = document_name(path);
        match self.latest_backup(path) {
            Some(id) => format!("restore from backup `{id}` with `kgstate restore {name}`"),
            None => "no backup exists; recreate the document from its sources".to_string(),
        }
    }

    fn latest_instance_backup(&self, instance_id: &str) -> Option<String> {
        match self.instances.backups().latest(instance_id) {
            Ok(entry) => entry.map(|entry| entry.id),
            Err(err) => {
                tracing::warn!(instance = instance_id, %err, "could not list backups");
                None
            }
        }
    }

    fn instance_restore_hint(&self, instance_id: &str) -> String {
        match self.latest_instance_backup(instance_id) {
            Some(id) => {
                format!("restore from backup `{id}` with `kgstate restore {instance_id} --instance`")
            }
            None => "no backup exists; correct the listed fields by hand".to_string(),
        }
    }

    fn valid(&self, path: &Path, kind: DocumentKind) -> IntegrityReport {
        IntegrityReport {
            path: path.to_path_buf(),
            kind,
            valid: true,
            errors: Vec::new(),
            repairable: false,
            latest_backup: None,
            next_step: None,
        }
    }

    fn invalid(
        &self,
        path: &Path,
        kind: DocumentKind,
        errors: Vec<String>,
        repairable: bool,
    ) -> IntegrityReport {
        let (latest_backup, next_step) = match kind {
            DocumentKind::Graph if repairable => (
                self.latest_backup(path),
                "run `kgstate check --fix` to drop the invalid elements".to_string(),
            ),
            DocumentKind::Graph => (self.latest_backup(path), self.restore_hint(path)),
            DocumentKind::WorkflowInstance if repairable => (
                self.latest_instance_backup(&document_name(path)),
                "run `kgstate check --fix` to finish the relocation".to_string(),
            ),
            DocumentKind::WorkflowInstance => {
                let instance_id = document_name(path);
                (
                    self.latest_instance_backup(&instance_id),
                    self.instance_restore_hint(&instance_id),
                )
            }
        };
        tracing::warn!(path = %path.display(), errors = errors.len(), repairable, "invalid document");
        IntegrityReport {
            path: path.to_path_buf(),
            kind,
            valid: false,
            errors,
            repairable,
            latest_backup,
            next_step: Some(next_step),
        }
    }
}

struct Stripped {
    document: Value,
    nodes_removed: usize,
    edges_removed: usize,
}

/// Drop nodes that fail field checks or repeat an earlier id, then edges
/// with bad fields or endpoints outside the kept nodes. Other top-level keys
/// are preserved.
fn strip_invalid_elements(doc: &Value) -> Stripped {
    let mut root: Map<String, Value> = doc.as_object().cloned().unwrap_or_default();
    let take_list = |root: &mut Map<String, Value>, key: &str| match root.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    let nodes = take_list(&mut root, "nodes");
    let edges = take_list(&mut root, "edges");

    let mut kept_ids = BTreeSet::new();
    let mut kept_nodes = Vec::new();
    let mut nodes_removed = 0;
    for (idx, node) in nodes.into_iter().enumerate() {
        let mut own_id = BTreeSet::new();
        let mut problems = Vec::new();
        check_node(idx, &node, &mut own_id, &mut problems);
        // Only ids of nodes that survive count toward duplicates.
        let keep = problems.is_empty()
            && own_id
                .into_iter()
                .next()
                .is_some_and(|id| kept_ids.insert(id));
        if keep {
            kept_nodes.push(node);
        } else {
            nodes_removed += 1;
        }
    }

    let mut kept_edges = Vec::new();
    let mut edges_removed = 0;
    for (idx, edge) in edges.into_iter().enumerate() {
        let mut problems = Vec::new();
        check_edge(idx, &edge, Some(&kept_ids), &mut problems);
        if problems.is_empty() {
            kept_edges.push(edge);
        } else {
            edges_removed += 1;
        }
    }

    root.insert("nodes".to_string(), Value::Array(kept_nodes));
    root.insert("edges".to_string(), Value::Array(kept_edges));
    Stripped {
        document: Value::Object(root),
        nodes_removed,
        edges_removed,
    }
}

#[cfg(test)]
#[path = "integrity_tests.rs"]
mod tests;
