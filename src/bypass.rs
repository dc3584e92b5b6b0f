//! Bypass justification checks and the append-only audit log.
//!
//! A bypass is granted only after its audit record is durably appended; a
//! failed append refuses the bypass.
use crate::error::{Result, StoreError};
use crate::paths::StorePaths;
use crate::store::AtomicStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Minimum justification length, in characters after trimming.
pub const MIN_JUSTIFICATION_CHARS: usize = 10;

/// Shell metacharacters refused in justifications. ASCII control characters
/// are refused as well.
pub const FORBIDDEN_CHARS: [char; 8] = [';', '&', '|', '`', '$', '<', '>', '\\'];

/// Whether a justification would be accepted.
pub fn validate_justification(text: &str) -> bool {
    check_justification(text).is_ok()
}

/// Validate a justification and return it trimmed.
pub fn check_justification(text: &str) -> Result<&str> {
    let trimmed = text.trim();
    if let Some(ch) = trimmed
        .chars()
        .find(|ch| FORBIDDEN_CHARS.contains(ch) || ch.is_ascii_control())
    {
        return Err(StoreError::BypassRejected {
            reason: format!("justification contains forbidden character {ch:?}"),
        });
    }
    let length = trimmed.chars().count();
    if length < MIN_JUSTIFICATION_CHARS {
        return Err(StoreError::BypassRejected {
            reason: format!(
                "justification is {length} character(s), at least {MIN_JUSTIFICATION_CHARS} required"
            ),
        });
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub justification: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// One JSON record per line. Records are only ever appended.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    store: AtomicStore,
}

impl AuditLog {
    pub fn new(path: PathBuf, store: AtomicStore) -> Self {
        Self { path, store }
    }

    pub fn for_store(paths: &StorePaths, store: AtomicStore) -> Self {
        Self::new(paths.audit_log_path(), store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        let line = serde_json::to_string(entry).map_err(|err| {
            StoreError::storage(&self.path, "serialize", std::io::Error::other(err))
        })?;
        self.store.append_line(&self.path, &line)
    }

    /// All records in append order. A malformed line is corruption.
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        let Some(bytes) = self.store.read_bytes(&self.path)? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut entries = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(line).map_err(|err| {
                StoreError::corruption(&self.path, format!("line {}: {err}", idx + 1))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Validate, then append the audit record. The returned entry is the
/// permission; nothing is granted if either step fails.
pub fn grant_bypass(
    log: &AuditLog,
    user: &str,
    justification: &str,
    metadata: BTreeMap<String, Value>,
) -> Result<AuditEntry> {
    let user = user.trim();
    if user.is_empty() {
        return Err(StoreError::BypassRejected {
            reason: "no user named for the bypass".to_string(),
        });
    }
    let justification = check_justification(justification)?;
    let entry = AuditEntry {
        timestamp: Utc::now(),
        user: user.to_string(),
        justification: justification.to_string(),
        metadata,
    };
    if let Err(err) = log.append(&entry) {
        tracing::error!(path = %log.path().display(), %err, "audit append failed; bypass refused");
        return Err(err);
    }
    tracing::info!(user = %entry.user, "bypass granted");
    Ok(entry)
}
