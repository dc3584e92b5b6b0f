//! Workflow instance records.
//!
//! An instance tracks which phases of a configured workflow have been
//! completed, where it currently stands, and every out-of-order move. The
//! records are mutated only by [`WorkflowStateManager`], under a lock that
//! spans the whole read-modify-write cycle.
mod instance_store;
mod state;

pub(crate) use instance_store::json_files;
pub use instance_store::InstanceStore;
pub use state::{
    HistoryEvent, InstanceSummary, PhaseStat, StartOutcome, WorkflowAnalysis, WorkflowHistory,
    WorkflowStateManager,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Completed,
    Abandoned,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 3] = [
        WorkflowStatus::InProgress,
        WorkflowStatus::Completed,
        WorkflowStatus::Abandoned,
    ];

    /// Return the stable string identifier used in JSON records.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Abandoned => "abandoned",
        }
    }

    /// Storage location for records in this status.
    pub fn dir_name(&self) -> &'static str {
        match self {
            WorkflowStatus::InProgress => "active",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::InProgress)
    }

    /// `in_progress → completed | abandoned`; terminal states never move.
    pub fn transition(self, to: WorkflowStatus) -> Option<WorkflowStatus> {
        match (self, to) {
            (WorkflowStatus::InProgress, WorkflowStatus::Completed)
            | (WorkflowStatus::InProgress, WorkflowStatus::Abandoned) => Some(to),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationType {
    SkipForward,
    SkipBackward,
    GateSkip,
}

impl DeviationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviationType::SkipForward => "skip_forward",
            DeviationType::SkipBackward => "skip_backward",
            DeviationType::GateSkip => "gate_skip",
        }
    }
}

/// A recorded out-of-order or skipped transition. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deviation {
    #[serde(rename = "type")]
    pub kind: DeviationType,
    pub from_phase: Option<String>,
    pub to_phase: String,
    /// Phases the deviation skipped over.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl Deviation {
    pub fn new(
        kind: DeviationType,
        from_phase: Option<&str>,
        to_phase: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            from_phase: from_phase.map(str::to_string),
            to_phase: to_phase.to_string(),
            phases: Vec::new(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_phases(mut self, phases: Vec<String>) -> Self {
        self.phases = phases;
        self
    }

    pub fn skips(&self, phase_id: &str) -> bool {
        self.phases.iter().any(|phase| phase == phase_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedPhase {
    pub phase_id: String,
    pub completed_at: DateTime<Utc>,
    /// Seconds since the previous completion, or since the instance started.
    #[serde(rename = "duration")]
    pub duration_secs: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metrics: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    #[serde(default)]
    pub title: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub completed_phases: Vec<CompletedPhase>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub deviations: Vec<Deviation>,
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandon_reason: Option<String>,
}

impl WorkflowInstance {
    /// A fresh in-progress instance positioned at `first_phase`.
    pub fn new(instance_id: &str, title: &str, workflow_type: &str, first_phase: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.to_string(),
            title: title.to_string(),
            workflow_type: workflow_type.to_string(),
            status: WorkflowStatus::InProgress,
            current_phase: first_phase.map(str::to_string),
            completed_phases: Vec::new(),
            deviations: Vec::new(),
            started_at: now,
            updated_at: now,
            abandon_reason: None,
        }
    }

    pub fn completed_phase_ids(&self) -> BTreeSet<&str> {
        self.completed_phases
            .iter()
            .map(|phase| phase.phase_id.as_str())
            .collect()
    }

    pub fn has_completed(&self, phase_id: &str) -> bool {
        self.completed_phases
            .iter()
            .any(|phase| phase.phase_id == phase_id)
    }

    /// When the clock for the next phase started.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.completed_phases
            .last()
            .map(|phase| phase.completed_at)
            .unwrap_or(self.started_at)
    }
}

/// `null` is treated like an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Derive an instance id from a work title.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for ch in title.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_end_matches('-').chars().take(64).collect();
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "workflow".to_string()
    } else {
        slug
    }
}

/// Structural problems in a raw instance record, all of them at once.
pub fn validate_instance_value(value: &Value) -> Vec<String> {
    let Some(fields) = value.as_object() else {
        return vec!["instance record must be a JSON object".to_string()];
    };
    let mut errors = Vec::new();
    for key in ["instance_id", "workflow_type"] {
        match fields.get(key) {
            Some(Value::String(text)) if !text.trim().is_empty() => {}
            _ => errors.push(format!("`{key}` must be a non-empty string")),
        }
    }
    match fields.get("status").and_then(Value::as_str) {
        Some(raw) if WorkflowStatus::ALL.iter().any(|status| status.as_str() == raw) => {}
        _ => errors.push("`status` must be one of in_progress, completed, abandoned".to_string()),
    }
    match fields.get("current_phase") {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(_) => errors.push("`current_phase` must be a string or null".to_string()),
    }
    for key in ["completed_phases", "deviations"] {
        match fields.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => {
                for (idx, item) in items.iter().enumerate() {
                    if !item.is_object() {
                        errors.push(format!("{key}[{idx}] must be an object"));
                    }
                }
            }
            Some(_) => errors.push(format!("`{key}` must be a list or null")),
        }
    }
    if errors.is_empty() {
        if let Err(err) = serde_json::from_value::<WorkflowInstance>(value.clone()) {
            errors.push(format!("record does not match the instance schema: {err}"));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_lists_load_as_empty() {
        let instance: WorkflowInstance = serde_json::from_value(json!({
            "instance_id": "add-search",
            "workflow_type": "feature",
            "status": "in_progress",
            "current_phase": "plan",
            "completed_phases": null,
            "deviations": null
        }))
        .expect("tolerant parse");
        assert!(instance.completed_phases.is_empty());
        assert!(instance.deviations.is_empty());
        assert!(validate_instance_value(&json!({
            "instance_id": "add-search",
            "workflow_type": "feature",
            "status": "in_progress",
            "completed_phases": null
        }))
        .is_empty());
    }

    #[test]
    fn status_machine_only_leaves_in_progress() {
        use WorkflowStatus::*;
        assert_eq!(InProgress.transition(Completed), Some(Completed));
        assert_eq!(InProgress.transition(Abandoned), Some(Abandoned));
        assert_eq!(Completed.transition(Abandoned), None);
        assert_eq!(Abandoned.transition(InProgress), None);
        assert_eq!(InProgress.transition(InProgress), None);
        assert!(Completed.is_terminal());
    }

    #[test]
    fn slugify_titles() {
        assert_eq!(slugify("Add Search: v2!"), "add-search-v2");
        assert_eq!(slugify("  --  "), "workflow");
        assert_eq!(slugify(&"x".repeat(100)).len(), 64);
    }

    #[test]
    fn validate_instance_reports_every_problem() {
        let errors = validate_instance_value(&json!({
            "instance_id": "",
            "status": "paused",
            "completed_phases": {}
        }));
        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(validate_instance_value(&json!([])).len() == 1);
    }

    #[test]
    fn deviation_serializes_type_field() {
        let deviation = Deviation::new(DeviationType::GateSkip, Some("implement"), "release", "hotfix");
        let value = serde_json::to_value(&deviation).expect("serialize");
        assert_eq!(value["type"], json!("gate_skip"));
        assert_eq!(value["from_phase"], json!("implement"));
        assert!(value.get("phases").is_none());

        let value = serde_json::to_value(deviation.with_phases(vec!["review".to_string()]))
            .expect("serialize");
        assert_eq!(value["phases"], json!(["review"]));
        let parsed: Deviation = serde_json::from_value(json!({
            "type": "skip_forward",
            "from_phase": null,
            "to_phase": "plan",
            "phases": null,
            "reason": "legacy",
            "timestamp": "2026-01-01T00:00:00Z"
        }))
        .expect("parse record without phases");
        assert!(parsed.phases.is_empty());
    }
}
