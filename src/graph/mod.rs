//! Entity/relationship graph documents.
//!
//! One document per topic under `graphs/`. Documents only grow: validated
//! deltas are merged in and the result is schema-checked before the atomic
//! replace, with a backup of the previous version taken first.
pub mod schema;
pub mod update_block;

use crate::backup::{BackupEntry, BackupManager};
use crate::error::{Result, StoreError};
use crate::paths::StorePaths;
use crate::store::{to_document_bytes, AtomicStore, DocumentCache};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use schema::{validate_graph, Violation, ViolationKind};
use update_block::{parse_blocks, validate_block, BlockError, ParseWarning};

/// Relation recorded when an edge block names none.
pub const DEFAULT_RELATION: &str = "related_to";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Concept,
    Entity,
    Person,
    Organization,
    Event,
    Technology,
    Document,
}

impl NodeType {
    pub const ALL: [NodeType; 7] = [
        NodeType::Concept,
        NodeType::Entity,
        NodeType::Person,
        NodeType::Organization,
        NodeType::Event,
        NodeType::Technology,
        NodeType::Document,
    ];

    /// Return the stable string identifier used in JSON documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Concept => "concept",
            NodeType::Entity => "entity",
            NodeType::Person => "person",
            NodeType::Organization => "organization",
            NodeType::Event => "event",
            NodeType::Technology => "technology",
            NodeType::Document => "document",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    /// Exact variant names only, compared case-insensitively.
    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = raw.trim();
        NodeType::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| schema::invalid_type_message(raw))
    }
}

/// Accepts the same spellings the validator does.
impl<'de> Deserialize<'de> for NodeType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_relation() -> String {
    DEFAULT_RELATION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default = "default_relation")]
    pub relation: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphDocument {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Parse a raw document, rejecting anything the schema validator flags.
    pub fn from_value(path: &Path, value: Value) -> Result<Self> {
        let report = validate_graph(&value);
        if !report.ok {
            return Err(StoreError::Validation {
                violations: report.violations,
            });
        }
        serde_json::from_value(value).map_err(|err| StoreError::corruption(path, err))
    }
}

/// A validated change to merge into a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Node(Node),
    Edge(Edge),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub nodes_added: usize,
    pub nodes_updated: usize,
    pub edges_added: usize,
    pub edges_unchanged: usize,
}

impl MergeSummary {
    pub fn changed(&self) -> bool {
        self.nodes_added + self.nodes_updated + self.edges_added > 0
    }
}

/// Merge deltas in order. Existing nodes are updated field by field (no
/// field is ever dropped); an edge with the same source, target, and
/// relation as an existing one only contributes its extra fields.
pub fn merge_deltas(doc: &mut GraphDocument, deltas: Vec<Delta>) -> MergeSummary {
    let mut summary = MergeSummary::default();
    for delta in deltas {
        match delta {
            Delta::Node(node) => match doc.nodes.iter_mut().find(|existing| existing.id == node.id) {
                Some(existing) => {
                    existing.label = node.label;
                    existing.node_type = node.node_type;
                    if node.confidence.is_some() {
                        existing.confidence = node.confidence;
                    }
                    existing.extra.extend(node.extra);
                    summary.nodes_updated += 1;
                }
                None => {
                    doc.nodes.push(node);
                    summary.nodes_added += 1;
                }
            },
            Delta::Edge(edge) => {
                let existing = doc.edges.iter_mut().find(|existing| {
                    existing.source == edge.source
                        && existing.target == edge.target
                        && existing.relation == edge.relation
                });
                match existing {
                    Some(existing) => {
                        existing.extra.extend(edge.extra);
                        summary.edges_unchanged += 1;
                    }
                    None => {
                        doc.edges.push(edge);
                        summary.edges_added += 1;
                    }
                }
            }
        }
    }
    summary
}

/// What happened when producer text was applied to a topic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub topic: String,
    pub blocks_found: usize,
    pub warnings: Vec<ParseWarning>,
    pub rejected: Vec<BlockError>,
    pub merge: MergeSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupEntry>,
}

/// Graph documents rooted at `graphs/`.
#[derive(Debug, Clone)]
pub struct GraphStore {
    paths: StorePaths,
    store: AtomicStore,
    backups: BackupManager,
}

impl GraphStore {
    pub fn new(paths: StorePaths, store: AtomicStore, backups: BackupManager) -> Self {
        Self {
            paths,
            store,
            backups,
        }
    }

    /// Resolve a topic to its document path; topics are plain file stems.
    pub fn topic_path(&self, topic: &str) -> Result<PathBuf> {
        let valid = !topic.is_empty()
            && topic
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !valid {
            return Err(StoreError::Validation {
                violations: vec![Violation::new(
                    ViolationKind::TopLevel,
                    "topic",
                    format!("topic {topic:?} must be non-empty and use only letters, digits, `_` or `-`"),
                )],
            });
        }
        Ok(self.paths.graph_path(topic))
    }

    /// Load a topic; a topic never written is an empty document.
    pub fn load(&self, topic: &str) -> Result<GraphDocument> {
        let path = self.topic_path(topic)?;
        let value = self
            .store
            .read_json(&path, empty_document)
            .map_err(|err| self.with_backup_hint(&path, err))?;
        GraphDocument::from_value(&path, value)
    }

    /// Load through a caller-owned cache.
    pub fn load_cached(&self, cache: &mut DocumentCache<Value>, topic: &str) -> Result<GraphDocument> {
        let path = self.topic_path(topic)?;
        let value = cache
            .get_or_load(&self.store, &path, empty_document)
            .map_err(|err| self.with_backup_hint(&path, err))?;
        GraphDocument::from_value(&path, value)
    }

    /// Parse producer text, validate its blocks, and merge the valid ones.
    ///
    /// Invalid blocks are rejected individually and reported; if the merged
    /// document fails schema validation nothing is written.
    pub fn apply_update(&self, topic: &str, text: &str) -> Result<ApplyReport> {
        let parsed = parse_blocks(text);
        let mut deltas = Vec::new();
        let mut rejected = Vec::new();
        for block in &parsed.blocks {
            match validate_block(block) {
                Ok(delta) => deltas.push(delta),
                Err(err) => {
                    tracing::warn!(topic, line = err.line, "update block rejected: {err}");
                    rejected.push(err);
                }
            }
        }
        let mut report = ApplyReport {
            topic: topic.to_string(),
            blocks_found: parsed.blocks.len(),
            warnings: parsed.warnings,
            rejected,
            ..ApplyReport::default()
        };
        if deltas.is_empty() {
            return Ok(report);
        }
        let (merge, backup) = self.apply_deltas(topic, deltas)?;
        report.merge = merge;
        report.backup = backup;
        Ok(report)
    }

    /// Merge deltas under one exclusive lock spanning read, merge, backup,
    /// and write.
    pub fn apply_deltas(
        &self,
        topic: &str,
        deltas: Vec<Delta>,
    ) -> Result<(MergeSummary, Option<BackupEntry>)> {
        let path = self.topic_path(topic)?;
        let guard = self.store.lock_exclusive(&path)?;
        let current = guard
            .read_json(&path, empty_document)
            .map_err(|err| self.with_backup_hint(&path, err))?;
        let mut doc = GraphDocument::from_value(&path, current)?;
        let merge = merge_deltas(&mut doc, deltas);
        if !merge.changed() {
            return Ok((merge, None));
        }
        let merged = serde_json::to_value(&doc).map_err(|err| StoreError::corruption(&path, err))?;
        let report = validate_graph(&merged);
        if !report.ok {
            return Err(StoreError::Validation {
                violations: report.violations,
            });
        }
        let bytes = to_document_bytes(&path, &doc)?;
        let backup = self.backups.protected_write(&guard, &path, &bytes)?;
        tracing::info!(
            topic,
            nodes_added = merge.nodes_added,
            nodes_updated = merge.nodes_updated,
            edges_added = merge.edges_added,
            "merged graph update"
        );
        Ok((merge, backup))
    }

    /// Topics with a document on disk, sorted.
    pub fn topics(&self) -> Result<Vec<String>> {
        let dir = self.paths.graphs_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::storage(&dir, "list", err)),
        };
        let mut topics = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::storage(&dir, "list", err))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(topic) = name.strip_suffix(".json") {
                topics.push(topic.to_string());
            }
        }
        topics.sort();
        Ok(topics)
    }

    fn with_backup_hint(&self, path: &Path, err: StoreError) -> StoreError {
        if !matches!(err, StoreError::Corruption { .. }) {
            return err;
        }
        let latest = self
            .backups
            .latest(&crate::paths::document_name(path))
            .ok()
            .flatten()
            .map(|entry| entry.id);
        err.with_backup_hint(latest)
    }
}

fn empty_document() -> Value {
    serde_json::json!({"nodes": [], "edges": []})
}

#[cfg(test)]
#[path = "graph_tests.rs"]
mod tests;
