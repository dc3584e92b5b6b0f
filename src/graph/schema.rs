//! Structural and semantic validation of graph documents.
//!
//! Validation walks the raw JSON rather than the typed model so that every
//! violation can be located and reported in a single pass.
use super::NodeType;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// The document shape itself is wrong; removal cannot fix it.
    TopLevel,
    NodeField,
    DuplicateId,
    EdgeField,
    DanglingEdge,
}

impl ViolationKind {
    /// Whether removing the offending element resolves the violation.
    pub fn is_element_level(self) -> bool {
        !matches!(self, ViolationKind::TopLevel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// JSON-path-like location such as `nodes[2].type`.
    pub location: String,
    pub message: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            location: location.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaReport {
    pub ok: bool,
    pub violations: Vec<Violation>,
}

impl SchemaReport {
    /// True when the document has violations and all of them are element-level.
    pub fn is_repairable(&self) -> bool {
        !self.ok
            && self
                .violations
                .iter()
                .all(|violation| violation.kind.is_element_level())
    }

    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

/// Validate a graph document, collecting every violation.
pub fn validate_graph(doc: &Value) -> SchemaReport {
    let mut violations = Vec::new();
    let Some(root) = doc.as_object() else {
        violations.push(Violation::new(
            ViolationKind::TopLevel,
            "$",
            "document must be a JSON object with `nodes` and `edges`",
        ));
        return finish(violations);
    };
    let nodes = list_field(root, "nodes", &mut violations);
    let edges = list_field(root, "edges", &mut violations);

    let mut known_ids = BTreeSet::new();
    if let Some(nodes) = nodes {
        for (idx, node) in nodes.iter().enumerate() {
            check_node(idx, node, &mut known_ids, &mut violations);
        }
    }
    if let Some(edges) = edges {
        // Endpoints can only be resolved against a readable node list.
        let resolve = nodes.is_some().then_some(&known_ids);
        for (idx, edge) in edges.iter().enumerate() {
            check_edge(idx, edge, resolve, &mut violations);
        }
    }
    finish(violations)
}

fn finish(violations: Vec<Violation>) -> SchemaReport {
    SchemaReport {
        ok: violations.is_empty(),
        violations,
    }
}

fn list_field<'a>(
    root: &'a Map<String, Value>,
    key: &str,
    violations: &mut Vec<Violation>,
) -> Option<&'a Vec<Value>> {
    match root.get(key) {
        Some(Value::Array(items)) => Some(items),
        Some(_) => {
            violations.push(Violation::new(
                ViolationKind::TopLevel,
                key,
                format!("`{key}` must be a list"),
            ));
            None
        }
        None => {
            violations.push(Violation::new(
                ViolationKind::TopLevel,
                key,
                format!("missing `{key}` list"),
            ));
            None
        }
    }
}

pub(crate) fn check_node(
    idx: usize,
    node: &Value,
    known_ids: &mut BTreeSet<String>,
    violations: &mut Vec<Violation>,
) {
    let at = |field: &str| format!("nodes[{idx}].{field}");
    let Some(fields) = node.as_object() else {
        violations.push(Violation::new(
            ViolationKind::NodeField,
            format!("nodes[{idx}]"),
            "node must be an object",
        ));
        return;
    };
    match non_empty_str(fields, "id") {
        Ok(id) => {
            if !known_ids.insert(id.to_string()) {
                violations.push(Violation::new(
                    ViolationKind::DuplicateId,
                    at("id"),
                    format!("duplicate node id {id:?}"),
                ));
            }
        }
        Err(message) => violations.push(Violation::new(ViolationKind::NodeField, at("id"), message)),
    }
    if let Err(message) = non_empty_str(fields, "label") {
        violations.push(Violation::new(ViolationKind::NodeField, at("label"), message));
    }
    match non_empty_str(fields, "type") {
        Ok(raw) => {
            if raw.parse::<NodeType>().is_err() {
                violations.push(Violation::new(
                    ViolationKind::NodeField,
                    at("type"),
                    invalid_type_message(raw),
                ));
            }
        }
        Err(message) => violations.push(Violation::new(ViolationKind::NodeField, at("type"), message)),
    }
    match fields.get("confidence") {
        None | Some(Value::Null) => {}
        Some(Value::Number(number)) => {
            let in_range = number
                .as_f64()
                .is_some_and(|value| (0.0..=1.0).contains(&value));
            if !in_range {
                violations.push(Violation::new(
                    ViolationKind::NodeField,
                    at("confidence"),
                    format!("confidence {number} is outside [0, 1]"),
                ));
            }
        }
        Some(other) => violations.push(Violation::new(
            ViolationKind::NodeField,
            at("confidence"),
            format!("confidence must be a number, got {other}"),
        )),
    }
}

pub(crate) fn check_edge(
    idx: usize,
    edge: &Value,
    known_ids: Option<&BTreeSet<String>>,
    violations: &mut Vec<Violation>,
) {
    let Some(fields) = edge.as_object() else {
        violations.push(Violation::new(
            ViolationKind::EdgeField,
            format!("edges[{idx}]"),
            "edge must be an object",
        ));
        return;
    };
    for endpoint in ["source", "target"] {
        let location = format!("edges[{idx}].{endpoint}");
        match non_empty_str(fields, endpoint) {
            Ok(id) => {
                if let Some(known) = known_ids {
                    if !known.contains(id) {
                        violations.push(Violation::new(
                            ViolationKind::DanglingEdge,
                            location,
                            format!("{endpoint} {id:?} does not reference an existing node"),
                        ));
                    }
                }
            }
            Err(message) => violations.push(Violation::new(ViolationKind::EdgeField, location, message)),
        }
    }
    match fields.get("relation") {
        None | Some(Value::String(_)) => {}
        Some(other) => violations.push(Violation::new(
            ViolationKind::EdgeField,
            format!("edges[{idx}].relation"),
            format!("relation must be a string, got {other}"),
        )),
    }
}

fn non_empty_str<'a>(fields: &'a Map<String, Value>, key: &str) -> Result<&'a str, String> {
    match fields.get(key) {
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.as_str()),
        Some(Value::String(_)) => Err(format!("`{key}` must not be empty")),
        Some(other) => Err(format!("`{key}` must be a string, got {other}")),
        None => Err(format!("missing `{key}`")),
    }
}

pub(crate) fn invalid_type_message(raw: &str) -> String {
    let expected = NodeType::ALL
        .iter()
        .map(|kind| kind.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!("invalid type {raw:?}; expected one of {expected}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_doc() -> Value {
        json!({
            "nodes": [
                {"id": "bert", "label": "BERT", "type": "technology", "confidence": 0.9},
                {"id": "google", "label": "Google", "type": "organization", "founded": 1998}
            ],
            "edges": [{"source": "google", "target": "bert", "relation": "created"}]
        })
    }

    #[test]
    fn valid_document_passes() {
        let report = validate_graph(&valid_doc());
        assert!(report.ok, "{:?}", report.violations);
        assert!(!report.is_repairable());
    }

    #[test]
    fn reports_all_independent_violations_in_one_pass() {
        let doc = json!({
            "nodes": [
                {"id": "bert", "label": "BERT", "type": "gadget"},
                {"id": "google", "label": "Google", "type": "organization", "confidence": 1.5}
            ],
            "edges": [{"source": "google", "target": "gpt"}]
        });
        let report = validate_graph(&doc);
        assert!(!report.ok);
        let locations: Vec<&str> = report
            .violations
            .iter()
            .map(|violation| violation.location.as_str())
            .collect();
        assert_eq!(
            locations,
            vec!["nodes[0].type", "nodes[1].confidence", "edges[0].target"]
        );
        assert!(report.is_repairable());
    }

    #[test]
    fn duplicate_ids_and_missing_fields_are_element_level() {
        let doc = json!({
            "nodes": [
                {"id": "a", "label": "A", "type": "concept"},
                {"id": "a", "label": "Again", "type": "concept"},
                {"id": "b", "type": "event"}
            ],
            "edges": [{"source": "a"}]
        });
        let report = validate_graph(&doc);
        let kinds: Vec<ViolationKind> = report.violations.iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ViolationKind::DuplicateId,
                ViolationKind::NodeField,
                ViolationKind::EdgeField
            ]
        );
        assert!(report.is_repairable());
    }

    #[test]
    fn wrong_top_level_shape_is_not_repairable() {
        let report = validate_graph(&json!({"nodes": {}, "edges": []}));
        assert!(!report.ok);
        assert!(!report.is_repairable());
        assert_eq!(report.violations[0].location, "nodes");

        let report = validate_graph(&json!([1, 2]));
        assert_eq!(report.violations.len(), 1);
        assert!(!report.is_repairable());

        let report = validate_graph(&json!({"nodes": []}));
        assert_eq!(report.messages(), vec!["edges: missing `edges` list"]);
    }

    #[test]
    fn type_message_lists_valid_choices() {
        let message = invalid_type_message("gadget");
        assert!(message.starts_with("invalid type \"gadget\""));
        assert!(message.contains("concept"));
        assert!(message.contains("document"));
    }
}
