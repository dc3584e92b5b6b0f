//! Workflow state manager.
//!
//! Every mutation takes the instance lock first and holds it until the
//! record is back on disk, so concurrent callers never lose updates.
use super::instance_store::InstanceStore;
use crate::backup::{BackupSelector, RestoreOutcome};
use super::{
    slugify, CompletedPhase, Deviation, DeviationType, WorkflowInstance, WorkflowStatus,
};
use crate::config::{StoreConfig, WorkflowDefinition};
use crate::error::{Result, StoreError};
use crate::paths::StorePaths;
use crate::store::{AtomicStore, ExclusiveGuard};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;

/// Result of [`WorkflowStateManager::start`].
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub instance: WorkflowInstance,
    /// True when an active instance with the same id already existed.
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub title: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub current_phase: Option<String>,
    pub completed: usize,
    pub deviations: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowInstance> for InstanceSummary {
    fn from(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            title: instance.title.clone(),
            workflow_type: instance.workflow_type.clone(),
            status: instance.status,
            current_phase: instance.current_phase.clone(),
            completed: instance.completed_phases.len(),
            deviations: instance.deviations.len(),
            updated_at: instance.updated_at,
        }
    }
}

/// One event in an instance's timeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    PhaseCompleted {
        phase_id: String,
        at: DateTime<Utc>,
        duration_secs: f64,
    },
    Deviation {
        #[serde(rename = "type")]
        kind: DeviationType,
        from_phase: Option<String>,
        to_phase: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl HistoryEvent {
    fn at(&self) -> DateTime<Utc> {
        match self {
            HistoryEvent::PhaseCompleted { at, .. } | HistoryEvent::Deviation { at, .. } => *at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowHistory {
    pub instance_id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub events: Vec<HistoryEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseStat {
    pub phase_id: String,
    pub completions: usize,
    pub total_duration_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowAnalysis {
    pub instance_id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub phases: Vec<PhaseStat>,
    pub total_duration_secs: f64,
    pub deviation_counts: BTreeMap<String, usize>,
    pub remaining_phases: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkflowStateManager {
    config: StoreConfig,
    instances: InstanceStore,
}

impl WorkflowStateManager {
    pub fn new(paths: StorePaths, config: StoreConfig) -> Self {
        let store = AtomicStore::from_config(&config);
        Self {
            instances: InstanceStore::new(paths, store, config.backup_retention),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn instances(&self) -> &InstanceStore {
        &self.instances
    }

    pub fn definition(&self, workflow_type: &str) -> Result<&WorkflowDefinition> {
        self.config
            .workflow(workflow_type)
            .ok_or_else(|| StoreError::UnknownWorkflow {
                workflow_type: workflow_type.to_string(),
            })
    }

    /// Begin work under `title`, or resume the active instance with the same id.
    ///
    /// Ids held by completed or abandoned instances get a numeric suffix.
    pub fn start(&self, title: &str, workflow_type: Option<&str>) -> Result<StartOutcome> {
        let workflow_type = workflow_type.unwrap_or(&self.config.default_workflow);
        let definition = self.definition(workflow_type)?;
        let base = slugify(title);
        let mut attempt = 1usize;
        loop {
            let instance_id = if attempt == 1 {
                base.clone()
            } else {
                format!("{base}-{attempt}")
            };
            let guard = self.instances.lock(&instance_id)?;
            match self.instances.read_locked(&guard, &instance_id)? {
                Some(instance) if instance.status == WorkflowStatus::InProgress => {
                    tracing::info!(instance = %instance_id, "resuming active workflow instance");
                    return Ok(StartOutcome {
                        instance,
                        resumed: true,
                    });
                }
                Some(_) => attempt += 1,
                None => {
                    let instance = WorkflowInstance::new(
                        &instance_id,
                        title.trim(),
                        workflow_type,
                        definition.first_phase(),
                    );
                    self.instances.save(&guard, &instance)?;
                    tracing::info!(instance = %instance_id, workflow = workflow_type, "started workflow instance");
                    return Ok(StartOutcome {
                        instance,
                        resumed: false,
                    });
                }
            }
        }
    }

    /// Current record, or a fresh default when it is missing or unreadable.
    ///
    /// Only lock and storage failures propagate.
    pub fn load(&self, instance_id: &str) -> Result<WorkflowInstance> {
        match self.instances.read(instance_id) {
            Ok(Some((_, instance))) => Ok(instance),
            Ok(None) => {
                tracing::debug!(instance = instance_id, "no record; using a fresh default");
                Ok(self.default_instance(instance_id))
            }
            Err(err @ StoreError::Corruption { .. }) => {
                tracing::warn!(instance = instance_id, %err, "unreadable record; using a fresh default");
                Ok(self.default_instance(instance_id))
            }
            Err(err) => Err(err),
        }
    }

    fn default_instance(&self, instance_id: &str) -> WorkflowInstance {
        let workflow_type = &self.config.default_workflow;
        let first = self
            .config
            .workflow(workflow_type)
            .and_then(WorkflowDefinition::first_phase);
        WorkflowInstance::new(instance_id, "", workflow_type, first)
    }

    /// Append a completion for `phase_id` and advance `current_phase`.
    ///
    /// Completing anything other than the current phase is allowed but
    /// recorded as a skip deviation.
    pub fn mark_completed(
        &self,
        instance_id: &str,
        phase_id: &str,
        metrics: BTreeMap<String, Value>,
    ) -> Result<WorkflowInstance> {
        self.mutate(instance_id, |instance, definition| {
            let target = phase_position(definition, instance, phase_id)?;
            let now = Utc::now();
            if instance.current_phase.as_deref() != Some(phase_id) {
                let kind = skip_kind(definition, instance.current_phase.as_deref(), target);
                instance.deviations.push(Deviation::new(
                    kind,
                    instance.current_phase.as_deref(),
                    phase_id,
                    "phase completed out of order",
                ));
            }
            let elapsed = now.signed_duration_since(instance.last_activity());
            instance.completed_phases.push(CompletedPhase {
                phase_id: phase_id.to_string(),
                completed_at: now,
                duration_secs: (elapsed.num_milliseconds().max(0) as f64) / 1000.0,
                metrics,
            });
            instance.current_phase = definition.next_phase(phase_id).map(str::to_string);
            Ok(())
        })
    }

    /// Move `current_phase` to `phase_id`, appending `deviations` in the
    /// same locked update.
    pub fn enter_phase(
        &self,
        instance_id: &str,
        phase_id: &str,
        deviations: Vec<Deviation>,
    ) -> Result<WorkflowInstance> {
        self.mutate(instance_id, |instance, definition| {
            enter(instance, definition, phase_id, deviations)
        })
    }

    /// Decide and enter under one lock: `plan` sees the current record and
    /// returns the deviations to append, or `None` to leave it untouched.
    pub fn enter_phase_if<R, F>(
        &self,
        instance_id: &str,
        phase_id: &str,
        plan: F,
    ) -> Result<(R, Option<WorkflowInstance>)>
    where
        F: FnOnce(&WorkflowInstance, &WorkflowDefinition) -> Result<(R, Option<Vec<Deviation>>)>,
    {
        let guard = self.instances.lock(instance_id)?;
        let mut instance = self.read_active(&guard, instance_id)?;
        let definition = self.definition(&instance.workflow_type)?;
        let (outcome, deviations) = plan(&instance, definition)?;
        let Some(deviations) = deviations else {
            return Ok((outcome, None));
        };
        enter(&mut instance, definition, phase_id, deviations)?;
        instance.updated_at = Utc::now();
        self.instances.save(&guard, &instance)?;
        Ok((outcome, Some(instance)))
    }

    pub fn complete(&self, instance_id: &str) -> Result<WorkflowInstance> {
        self.finish(instance_id, WorkflowStatus::Completed, None)
    }

    pub fn abandon(&self, instance_id: &str, reason: &str) -> Result<WorkflowInstance> {
        self.finish(instance_id, WorkflowStatus::Abandoned, Some(reason))
    }

    /// Terminal transition: write the record into its terminal location,
    /// then drop the in-progress copy.
    ///
    /// Repeating a transition that already happened returns the stored
    /// record; reading it also finishes a relocation a crash interrupted.
    fn finish(
        &self,
        instance_id: &str,
        to: WorkflowStatus,
        reason: Option<&str>,
    ) -> Result<WorkflowInstance> {
        let guard = self.instances.lock(instance_id)?;
        let mut instance = self.read_existing(&guard, instance_id)?;
        if instance.status == to {
            tracing::debug!(instance = instance_id, status = to.as_str(), "already finished");
            return Ok(instance);
        }
        let Some(next) = instance.status.transition(to) else {
            return Err(StoreError::InvalidTransition {
                instance_id: instance_id.to_string(),
                from: instance.status.to_string(),
                to: to.to_string(),
            });
        };
        instance.status = next;
        instance.updated_at = Utc::now();
        instance.abandon_reason = reason.map(str::to_string);
        self.instances.relocate(&guard, &instance)?;
        Ok(instance)
    }

    /// Put a backed-up record back, in the location its status names.
    /// Every copy it replaces is backed up first.
    pub fn restore(&self, instance_id: &str, selector: &BackupSelector) -> Result<RestoreOutcome> {
        let guard = self.instances.lock(instance_id)?;
        let restored_from = self.instances.backups().find(instance_id, selector)?;
        let bytes = fs::read(&restored_from.path)
            .map_err(|err| StoreError::storage(&restored_from.path, "read backup", err))?;
        let instance: WorkflowInstance = serde_json::from_slice(&bytes).map_err(|err| {
            StoreError::corruption(
                &restored_from.path,
                format!("backup is not a workflow record: {err}"),
            )
        })?;
        if instance.instance_id != instance_id {
            return Err(StoreError::corruption(
                &restored_from.path,
                format!("backup belongs to `{}`", instance.instance_id),
            ));
        }
        let safety_backup = self.instances.relocate(&guard, &instance)?.into_iter().next();
        tracing::info!(instance = instance_id, backup = %restored_from.id, "restored workflow record");
        Ok(RestoreOutcome {
            restored_from,
            safety_backup,
        })
    }

    /// Instances, optionally filtered by status, most recently updated first.
    pub fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<InstanceSummary>> {
        let mut summaries: Vec<InstanceSummary> = self
            .instances
            .list()?
            .iter()
            .filter(|(_, instance)| status.is_none() || status == Some(instance.status))
            .map(|(_, instance)| InstanceSummary::from(instance))
            .collect();
        summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(summaries)
    }

    /// Completions and deviations in time order.
    pub fn history(&self, instance_id: &str) -> Result<WorkflowHistory> {
        let instance = self.load(instance_id)?;
        let mut events: Vec<HistoryEvent> = instance
            .completed_phases
            .iter()
            .map(|phase| HistoryEvent::PhaseCompleted {
                phase_id: phase.phase_id.clone(),
                at: phase.completed_at,
                duration_secs: phase.duration_secs,
            })
            .chain(instance.deviations.iter().map(|deviation| HistoryEvent::Deviation {
                kind: deviation.kind,
                from_phase: deviation.from_phase.clone(),
                to_phase: deviation.to_phase.clone(),
                reason: deviation.reason.clone(),
                at: deviation.timestamp,
            }))
            .collect();
        events.sort_by_key(HistoryEvent::at);
        Ok(WorkflowHistory {
            instance_id: instance.instance_id,
            workflow_type: instance.workflow_type,
            status: instance.status,
            started_at: instance.started_at,
            events,
        })
    }

    /// Per-phase durations, deviation counts, and what is left to do.
    pub fn analyze(&self, instance_id: &str) -> Result<WorkflowAnalysis> {
        let instance = self.load(instance_id)?;
        let declared: Vec<String> = self
            .config
            .workflow(&instance.workflow_type)
            .map(|definition| definition.phases.iter().map(|phase| phase.id.clone()).collect())
            .unwrap_or_default();

        let mut phases: Vec<PhaseStat> = declared
            .iter()
            .map(|id| PhaseStat {
                phase_id: id.clone(),
                completions: 0,
                total_duration_secs: 0.0,
            })
            .collect();
        for completed in &instance.completed_phases {
            let stat = match phases.iter().position(|stat| stat.phase_id == completed.phase_id) {
                Some(idx) => &mut phases[idx],
                None => {
                    phases.push(PhaseStat {
                        phase_id: completed.phase_id.clone(),
                        completions: 0,
                        total_duration_secs: 0.0,
                    });
                    let last = phases.len() - 1;
                    &mut phases[last]
                }
            };
            stat.completions += 1;
            stat.total_duration_secs += completed.duration_secs;
        }

        let mut deviation_counts = BTreeMap::new();
        for deviation in &instance.deviations {
            *deviation_counts
                .entry(deviation.kind.as_str().to_string())
                .or_insert(0) += 1;
        }
        let remaining_phases = declared
            .into_iter()
            .filter(|id| !instance.has_completed(id))
            .collect();
        Ok(WorkflowAnalysis {
            total_duration_secs: phases.iter().map(|stat| stat.total_duration_secs).sum(),
            instance_id: instance.instance_id,
            workflow_type: instance.workflow_type,
            status: instance.status,
            phases,
            deviation_counts,
            remaining_phases,
        })
    }

    /// Lock, read an existing in-progress record, apply `change`, save.
    fn mutate<F>(&self, instance_id: &str, change: F) -> Result<WorkflowInstance>
    where
        F: FnOnce(&mut WorkflowInstance, &WorkflowDefinition) -> Result<()>,
    {
        let guard = self.instances.lock(instance_id)?;
        let mut instance = self.read_active(&guard, instance_id)?;
        let definition = self.definition(&instance.workflow_type)?;
        change(&mut instance, definition)?;
        instance.updated_at = Utc::now();
        self.instances.save(&guard, &instance)?;
        Ok(instance)
    }

    fn read_active(&self, guard: &ExclusiveGuard, instance_id: &str) -> Result<WorkflowInstance> {
        let instance = self.read_existing(guard, instance_id)?;
        if instance.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                instance_id: instance_id.to_string(),
                from: instance.status.to_string(),
                to: WorkflowStatus::InProgress.to_string(),
            });
        }
        Ok(instance)
    }

    fn read_existing(&self, guard: &ExclusiveGuard, instance_id: &str) -> Result<WorkflowInstance> {
        self.instances
            .read_locked(guard, instance_id)?
            .ok_or_else(|| StoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }
}

fn enter(
    instance: &mut WorkflowInstance,
    definition: &WorkflowDefinition,
    phase_id: &str,
    deviations: Vec<Deviation>,
) -> Result<()> {
    phase_position(definition, instance, phase_id)?;
    instance.current_phase = Some(phase_id.to_string());
    instance.deviations.extend(deviations);
    Ok(())
}

fn phase_position(
    definition: &WorkflowDefinition,
    instance: &WorkflowInstance,
    phase_id: &str,
) -> Result<usize> {
    definition
        .phase_index(phase_id)
        .ok_or_else(|| StoreError::UnknownPhase {
            workflow_type: instance.workflow_type.clone(),
            phase: phase_id.to_string(),
        })
}

/// Ahead of the current phase is a forward skip; anything else goes back.
fn skip_kind(definition: &WorkflowDefinition, current: Option<&str>, target: usize) -> DeviationType {
    match current.and_then(|phase| definition.phase_index(phase)) {
        Some(current) if target > current => DeviationType::SkipForward,
        _ => DeviationType::SkipBackward,
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
