//! Store configuration helpers.
//!
//! Loads, validates, and normalizes `config.json` so retention, lock timing,
//! and workflow definitions come from one schema-driven place.
use crate::enforcement::{EnforcementMode, SignificanceGate};
use crate::paths::StorePaths;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Current schema version for `config.json`.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;
/// Backups kept per document unless configured otherwise.
pub const DEFAULT_BACKUP_RETENTION: usize = 5;
/// Lock wait before surfacing a retryable timeout.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
/// Workflow used when an instance is created without an explicit type.
pub const DEFAULT_WORKFLOW_TYPE: &str = "feature";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub schema_version: u32,
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_workflow_type")]
    pub default_workflow: String,
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowDefinition>,
}

/// An ordered list of phases plus the enforcement policy applied to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub default_mode: EnforcementMode,
    pub phases: Vec<PhaseDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub id: String,
    /// Per-phase override; `None` inherits the workflow default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<EnforcementMode>,
    /// When set, the phase is only required for significant changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub significance_gate: Option<SignificanceGate>,
}

impl PhaseDefinition {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            mode: None,
            significance_gate: None,
        }
    }
}

impl WorkflowDefinition {
    /// Position of a phase in declared order.
    pub fn phase_index(&self, phase_id: &str) -> Option<usize> {
        self.phases.iter().position(|phase| phase.id == phase_id)
    }

    pub fn first_phase(&self) -> Option<&str> {
        self.phases.first().map(|phase| phase.id.as_str())
    }

    /// Phase declared immediately after `phase_id`, if any.
    pub fn next_phase(&self, phase_id: &str) -> Option<&str> {
        let idx = self.phase_index(phase_id)?;
        self.phases.get(idx + 1).map(|phase| phase.id.as_str())
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Look up a workflow definition by type.
    pub fn workflow(&self, workflow_type: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(workflow_type)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        default_config()
    }
}

fn default_backup_retention() -> usize {
    DEFAULT_BACKUP_RETENTION
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_workflow_type() -> String {
    DEFAULT_WORKFLOW_TYPE.to_string()
}

/// Build the default config used when a store has no `config.json`.
///
/// The built-in workflow requires review only for significant changes.
pub fn default_config() -> StoreConfig {
    let mut review = PhaseDefinition::new("review");
    review.significance_gate = Some(SignificanceGate::default());
    let feature = WorkflowDefinition {
        default_mode: EnforcementMode::Recommended,
        phases: vec![
            PhaseDefinition::new("research"),
            PhaseDefinition::new("plan"),
            PhaseDefinition::new("implement"),
            review,
            PhaseDefinition::new("release"),
        ],
    };
    let mut workflows = BTreeMap::new();
    workflows.insert(DEFAULT_WORKFLOW_TYPE.to_string(), feature);
    StoreConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        backup_retention: DEFAULT_BACKUP_RETENTION,
        lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        default_workflow: DEFAULT_WORKFLOW_TYPE.to_string(),
        workflows,
    }
}

/// Load `config.json` from the store root, falling back to defaults when absent.
pub fn load_config(root: &Path) -> Result<StoreConfig> {
    let path = StorePaths::new(root).config_path();
    if !path.is_file() {
        tracing::debug!(path = %path.display(), "no config.json; using defaults");
        return Ok(default_config());
    }
    let bytes = fs::read(&path).with_context(|| format!("read config {}", path.display()))?;
    let mut config: StoreConfig =
        serde_json::from_slice(&bytes).context("parse store config JSON")?;
    if config.workflows.is_empty() {
        config.workflows = default_config().workflows;
    }
    validate_config(&config)?;
    Ok(config)
}

/// Validate schema version, retention, and workflow definitions.
pub fn validate_config(config: &StoreConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported store config schema_version {}",
            config.schema_version
        ));
    }
    if config.backup_retention == 0 {
        return Err(anyhow!("backup_retention must be at least 1"));
    }
    if !config.workflows.contains_key(&config.default_workflow) {
        return Err(anyhow!(
            "default_workflow {:?} is not defined under workflows",
            config.default_workflow
        ));
    }
    for (name, workflow) in &config.workflows {
        if workflow.phases.is_empty() {
            return Err(anyhow!("workflow {name:?} must declare at least one phase"));
        }
        let mut seen = BTreeSet::new();
        for phase in &workflow.phases {
            if phase.id.trim().is_empty() {
                return Err(anyhow!("workflow {name:?} has a phase with an empty id"));
            }
            if !seen.insert(phase.id.as_str()) {
                return Err(anyhow!(
                    "workflow {name:?} declares phase {:?} more than once",
                    phase.id
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
