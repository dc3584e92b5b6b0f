//! Phase-ordering policy.
//!
//! A transition into a phase is checked against the phases declared before
//! it. What happens to incomplete prerequisites depends on the enforcement
//! mode in effect for the target phase; significance-gated phases only count
//! when the supplied change metrics cross their thresholds.
use crate::bypass::{grant_bypass, AuditEntry, AuditLog};
use crate::config::{PhaseDefinition, WorkflowDefinition};
use crate::error::{Result, StoreError};
use crate::workflow::{Deviation, DeviationType, WorkflowInstance, WorkflowStateManager};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Out-of-order transitions are blocked.
    Strict,
    /// Out-of-order transitions need a non-empty reason.
    #[default]
    Recommended,
    /// Always allowed; skips are only logged.
    Optional,
}

impl EnforcementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementMode::Strict => "strict",
            EnforcementMode::Recommended => "recommended",
            EnforcementMode::Optional => "optional",
        }
    }
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_MIN_LINES_CHANGED: u64 = 200;
pub const DEFAULT_MIN_FILES_CHANGED: u64 = 10;

/// Makes a phase mandatory only for significant changes.
///
/// A zero threshold disables that criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignificanceGate {
    #[serde(default = "default_min_lines")]
    pub min_lines_changed: u64,
    #[serde(default = "default_min_files")]
    pub min_files_changed: u64,
    #[serde(default = "default_on_new_features")]
    pub on_new_features: bool,
}

impl Default for SignificanceGate {
    fn default() -> Self {
        Self {
            min_lines_changed: DEFAULT_MIN_LINES_CHANGED,
            min_files_changed: DEFAULT_MIN_FILES_CHANGED,
            on_new_features: true,
        }
    }
}

fn default_min_lines() -> u64 {
    DEFAULT_MIN_LINES_CHANGED
}

fn default_min_files() -> u64 {
    DEFAULT_MIN_FILES_CHANGED
}

fn default_on_new_features() -> bool {
    true
}

impl SignificanceGate {
    pub fn is_significant(&self, metrics: &ChangeMetrics) -> bool {
        (self.min_lines_changed > 0 && metrics.lines_changed >= self.min_lines_changed)
            || (self.min_files_changed > 0 && metrics.files_changed >= self.min_files_changed)
            || (self.on_new_features && metrics.has_new_features)
    }
}

/// Change size supplied by an external diff tool. When unavailable every
/// field stays zero, so gated phases never trigger spuriously.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetrics {
    #[serde(default)]
    pub lines_changed: u64,
    #[serde(default)]
    pub files_changed: u64,
    #[serde(default)]
    pub has_new_features: bool,
}

/// Outcome of [`evaluate_transition`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub allow: bool,
    pub mode: EnforcementMode,
    pub target_phase: String,
    /// Incomplete prerequisites, in workflow-declared order.
    pub required_phases: Vec<String>,
    /// Incomplete gated phases whose threshold was not crossed.
    pub skippable_phases: Vec<String>,
    pub reason: String,
}

/// Mode for a phase: its own override, else the workflow default.
pub fn effective_mode(definition: &WorkflowDefinition, phase: &PhaseDefinition) -> EnforcementMode {
    phase.mode.unwrap_or(definition.default_mode)
}

/// Decide whether `instance` may enter `target_phase`.
pub fn evaluate_transition(
    definition: &WorkflowDefinition,
    instance: &WorkflowInstance,
    target_phase: &str,
    metrics: &ChangeMetrics,
    reason: Option<&str>,
) -> Result<Decision> {
    if instance.status.is_terminal() {
        return Err(StoreError::InvalidTransition {
            instance_id: instance.instance_id.clone(),
            from: instance.status.to_string(),
            to: target_phase.to_string(),
        });
    }
    let Some(target_idx) = definition.phase_index(target_phase) else {
        return Err(StoreError::UnknownPhase {
            workflow_type: instance.workflow_type.clone(),
            phase: target_phase.to_string(),
        });
    };
    let target = &definition.phases[target_idx];
    let mode = effective_mode(definition, target);
    let completed = instance.completed_phase_ids();
    let pending: Vec<&PhaseDefinition> = definition.phases[..target_idx]
        .iter()
        .filter(|phase| !completed.contains(phase.id.as_str()))
        .collect();

    // Unconditional prerequisites are found first, gated ones after; the
    // report is re-sorted into declared order below.
    let mut required: Vec<&str> = pending
        .iter()
        .filter(|phase| phase.significance_gate.is_none())
        .map(|phase| phase.id.as_str())
        .collect();
    let mut skippable = Vec::new();
    for phase in pending.iter().copied() {
        if let Some(gate) = &phase.significance_gate {
            if gate.is_significant(metrics) {
                required.push(&phase.id);
            } else {
                skippable.push(phase.id.clone());
            }
        }
    }
    required.sort_by_key(|id| definition.phase_index(id));
    let required_phases: Vec<String> = required.into_iter().map(str::to_string).collect();

    let supplied = reason.map(str::trim).filter(|text| !text.is_empty());
    let (allow, reason) = if required_phases.is_empty() {
        (true, format!("all prerequisites of {target_phase} are complete"))
    } else {
        let missing = required_phases.join(", ");
        match mode {
            EnforcementMode::Strict => (
                false,
                format!(
                    "complete {missing} before {target_phase}; strict mode blocks out-of-order transitions unless a bypass is granted"
                ),
            ),
            EnforcementMode::Recommended => match supplied {
                Some(text) => (true, format!("skipping {missing}: {text}")),
                None => (
                    false,
                    format!("{missing} should be completed before {target_phase}; supply `--reason` to proceed"),
                ),
            },
            EnforcementMode::Optional => {
                tracing::debug!(phase = target_phase, missing = %missing, "optional mode allows skipping phases");
                (true, format!("skipping {missing} (optional)"))
            }
        }
    };
    if !allow {
        tracing::warn!(
            instance = %instance.instance_id,
            phase = target_phase,
            mode = mode.as_str(),
            "transition blocked"
        );
    }
    Ok(Decision {
        allow,
        mode,
        target_phase: target_phase.to_string(),
        required_phases,
        skippable_phases: skippable,
        reason,
    })
}

/// Human override for a denied transition.
#[derive(Debug, Clone)]
pub struct BypassRequest<'a> {
    pub user: &'a str,
    pub justification: &'a str,
}

#[derive(Debug, Clone)]
pub struct TransitionRequest<'a> {
    pub instance_id: &'a str,
    pub target_phase: &'a str,
    pub metrics: ChangeMetrics,
    pub reason: Option<&'a str>,
    pub bypass: Option<BypassRequest<'a>>,
}

/// Result of [`authorize`]; `instance` is set only when the phase was entered.
#[derive(Debug, Clone, Serialize)]
pub struct Authorization {
    pub decision: Decision,
    pub bypass: Option<AuditEntry>,
    pub instance: Option<WorkflowInstance>,
}

impl Authorization {
    pub fn permitted(&self) -> bool {
        self.instance.is_some()
    }
}

/// Evaluate a transition and, when permitted, enter the phase.
///
/// The decision, the bypass, and the phase change all happen under the
/// instance's exclusive lock, so the decision always reflects the record it
/// changes. A denied decision proceeds only through an accepted bypass,
/// which is written to the audit log before the phase changes. Skipped
/// required phases are recorded as one `skip_forward` deviation and each
/// skipped gated phase as a `gate_skip` deviation, once per instance.
pub fn authorize(
    manager: &WorkflowStateManager,
    audit: &AuditLog,
    request: &TransitionRequest<'_>,
) -> Result<Authorization> {
    let ((decision, bypass), instance) =
        manager.enter_phase_if(request.instance_id, request.target_phase, |instance, definition| {
            let decision = evaluate_transition(
                definition,
                instance,
                request.target_phase,
                &request.metrics,
                request.reason,
            )?;
            let (skip_reason, bypass) = if decision.allow {
                let supplied = request.reason.map(str::trim).filter(|text| !text.is_empty());
                (supplied.unwrap_or(decision.reason.as_str()).to_string(), None)
            } else {
                let Some(override_request) = &request.bypass else {
                    return Ok(((decision, None), None));
                };
                let entry = grant_bypass(
                    audit,
                    override_request.user,
                    override_request.justification,
                    bypass_metadata(request, &decision),
                )?;
                (format!("bypass: {}", entry.justification), Some(entry))
            };
            let deviations = skip_deviations(instance, request, &decision, &skip_reason);
            Ok(((decision, bypass), Some(deviations)))
        })?;
    Ok(Authorization {
        decision,
        bypass,
        instance,
    })
}

fn bypass_metadata(request: &TransitionRequest<'_>, decision: &Decision) -> BTreeMap<String, Value> {
    let mut metadata = BTreeMap::new();
    metadata.insert("instance_id".to_string(), json!(request.instance_id));
    metadata.insert("target_phase".to_string(), json!(request.target_phase));
    metadata.insert("mode".to_string(), json!(decision.mode));
    metadata.insert("skipped_phases".to_string(), json!(decision.required_phases));
    metadata.insert(
        "metrics".to_string(),
        serde_json::to_value(request.metrics).unwrap_or(Value::Null),
    );
    metadata
}

/// Deviations for entering the target past incomplete phases. A gated phase
/// already recorded as skipped is not recorded again.
fn skip_deviations(
    instance: &WorkflowInstance,
    request: &TransitionRequest<'_>,
    decision: &Decision,
    skip_reason: &str,
) -> Vec<Deviation> {
    let from = instance.current_phase.as_deref();
    let mut deviations = Vec::new();
    if !decision.required_phases.is_empty() {
        deviations.push(
            Deviation::new(
                DeviationType::SkipForward,
                from,
                request.target_phase,
                format!("skipped {}: {skip_reason}", decision.required_phases.join(", ")),
            )
            .with_phases(decision.required_phases.clone()),
        );
    }
    for phase in &decision.skippable_phases {
        let recorded = instance
            .deviations
            .iter()
            .any(|deviation| deviation.kind == DeviationType::GateSkip && deviation.skips(phase));
        if recorded {
            continue;
        }
        deviations.push(
            Deviation::new(
                DeviationType::GateSkip,
                from,
                request.target_phase,
                format!("{phase} skipped below significance threshold"),
            )
            .with_phases(vec![phase.clone()]),
        );
    }
    deviations
}

#[cfg(test)]
#[path = "enforcement_tests.rs"]
mod tests;
