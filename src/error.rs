//! Error taxonomy shared by every persistence and policy component.
//!
//! Each variant renders a concrete next step so callers can surface the
//! message as-is to an operator.
use crate::graph::schema::Violation;
use std::fmt;
use std::path::{Path, PathBuf};

/// Result alias for store operations.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Schema or semantic violation; nothing was written.
    #[error("validation failed with {} violation(s): {}; fix the listed fields and resubmit", .violations.len(), ViolationList(.violations))]
    Validation { violations: Vec<Violation> },

    /// Document content could not be parsed.
    #[error("{} is corrupted ({detail}); {}", .path.display(), restore_hint(.backup.as_deref()))]
    Corruption {
        path: PathBuf,
        detail: String,
        backup: Option<String>,
    },

    /// Lock acquisition exceeded the configured timeout.
    #[error("timed out after {waited_ms}ms waiting for lock on {}; retry once the other writer finishes", .path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    /// Disk or permission failure.
    #[error("failed to {action} {}: {source}; check permissions and free space, then retry", .path.display())]
    Storage {
        path: PathBuf,
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Bypass justification failed validation.
    #[error("bypass rejected: {reason}; supply a justification of at least 10 plain-text characters")]
    BypassRejected { reason: String },

    /// Workflow status change not permitted by the state machine.
    #[error("instance {instance_id} cannot move from {from} to {to}; start a new instance instead")]
    InvalidTransition {
        instance_id: String,
        from: String,
        to: String,
    },

    /// Phase id not declared by the workflow definition.
    #[error("phase {phase:?} is not declared by workflow {workflow_type:?}; use one of the configured phases")]
    UnknownPhase {
        workflow_type: String,
        phase: String,
    },

    /// Workflow type missing from the configuration.
    #[error("workflow type {workflow_type:?} is not configured; add it under `workflows` in config.json")]
    UnknownWorkflow { workflow_type: String },

    /// No record exists for the instance id in any storage location.
    #[error("no workflow instance {instance_id:?}; run `kgstate list` to see known instances")]
    InstanceNotFound { instance_id: String },

    /// No backup matched the requested selector.
    #[error("no backup of {name} matches {selector}; run `kgstate restore {name} --list` to see what exists")]
    BackupNotFound { name: String, selector: String },
}

impl StoreError {
    /// Only lock timeouts are worth retrying without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }

    pub(crate) fn storage(path: &Path, action: &'static str, source: std::io::Error) -> Self {
        StoreError::Storage {
            path: path.to_path_buf(),
            action,
            source,
        }
    }

    pub(crate) fn corruption(path: &Path, detail: impl fmt::Display) -> Self {
        StoreError::Corruption {
            path: path.to_path_buf(),
            detail: detail.to_string(),
            backup: None,
        }
    }

    /// Attach the newest backup id to a corruption error so the message names it.
    pub(crate) fn with_backup_hint(self, backup: Option<String>) -> Self {
        match self {
            StoreError::Corruption { path, detail, .. } => StoreError::Corruption {
                path,
                detail,
                backup,
            },
            other => other,
        }
    }
}

fn restore_hint(backup: Option<&str>) -> String {
    match backup {
        Some(id) => format!("restore from backup `{id}`"),
        None => "restore from backup with `kgstate restore`".to_string(),
    }
}

struct ViolationList<'a>(&'a [Violation]);

impl fmt::Display for ViolationList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, violation) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::schema::ViolationKind;

    #[test]
    fn corruption_message_names_backup_to_restore() {
        let err = StoreError::corruption(Path::new("graphs/ml.json"), "expected value")
            .with_backup_hint(Some("ml_20260101T000000.000000000Z".to_string()));
        let message = err.to_string();
        assert!(message.contains("restore from backup `ml_20260101T000000.000000000Z`"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn validation_message_lists_every_violation() {
        let err = StoreError::Validation {
            violations: vec![
                Violation::new(ViolationKind::NodeField, "nodes[0].type", "invalid"),
                Violation::new(ViolationKind::DanglingEdge, "edges[1].target", "missing"),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("2 violation(s)"));
        assert!(message.contains("nodes[0].type"));
        assert!(message.contains("edges[1].target"));
    }

    #[test]
    fn lock_timeout_is_retryable() {
        let err = StoreError::LockTimeout {
            path: PathBuf::from("graphs/a.json"),
            waited_ms: 10,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("retry"));
    }
}
