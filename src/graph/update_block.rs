//! Update blocks embedded in free-text producer output.
//!
//! Syntax is handled leniently: unterminated or malformed blocks are skipped
//! with a warning and parsing continues. Semantics are strict: a block with
//! an invalid node type or non-numeric score is rejected, never coerced.
//!
//! ```text
//! <<<UPDATE add_node
//! id: transformer
//! type: concept
//! label: Transformer
//! confidence: 0.9
//! >>>
//! ```
use super::schema::{invalid_type_message, Violation, ViolationKind};
use super::{Delta, Edge, Node, NodeType, DEFAULT_RELATION};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Opening delimiter; the block tag follows on the same line.
pub const BLOCK_OPEN: &str = "<<<UPDATE";
/// Closing delimiter, alone on its line.
pub const BLOCK_CLOSE: &str = ">>>";

const NUMERIC_FIELDS: [&str; 2] = ["confidence", "weight"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockTag {
    AddNode,
    AddEdge,
}

impl BlockTag {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "add_node" => Some(BlockTag::AddNode),
            "add_edge" => Some(BlockTag::AddEdge),
            _ => None,
        }
    }
}

/// A syntactically complete block with its raw fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub tag: BlockTag,
    /// 1-based line of the opening delimiter.
    pub line: usize,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseWarning {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub blocks: Vec<RawBlock>,
    pub warnings: Vec<ParseWarning>,
}

/// A block that parsed but failed semantic validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockError {
    pub line: usize,
    pub violations: Vec<Violation>,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block at line {} rejected: ", self.line)?;
        for (idx, violation) in self.violations.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Open { tag: &'a str },
    Close,
    Line(&'a str),
}

fn tokenize(line: &str) -> Token<'_> {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix(BLOCK_OPEN) {
        return Token::Open { tag: rest.trim() };
    }
    if trimmed == BLOCK_CLOSE {
        return Token::Close;
    }
    Token::Line(trimmed)
}

struct OpenBlock {
    line: usize,
    tag: Option<BlockTag>,
    raw_tag: String,
    fields: BTreeMap<String, String>,
}

/// Scan producer text for update blocks. Never fails; problems become warnings.
pub fn parse_blocks(text: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let mut current: Option<OpenBlock> = None;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        match tokenize(line) {
            Token::Open { tag } => {
                if let Some(unterminated) = current.take() {
                    warn(
                        &mut outcome,
                        unterminated.line,
                        format!("block not closed before new block at line {line_no}; skipped"),
                    );
                }
                current = Some(OpenBlock {
                    line: line_no,
                    tag: BlockTag::parse(tag),
                    raw_tag: tag.to_string(),
                    fields: BTreeMap::new(),
                });
            }
            Token::Close => match current.take() {
                Some(OpenBlock {
                    line,
                    tag: Some(tag),
                    fields,
                    ..
                }) => outcome.blocks.push(RawBlock { tag, line, fields }),
                Some(OpenBlock { line, raw_tag, .. }) => {
                    let message = if raw_tag.is_empty() {
                        "block has no tag; expected add_node or add_edge; skipped".to_string()
                    } else {
                        format!("unknown block tag {raw_tag:?}; expected add_node or add_edge; skipped")
                    };
                    warn(&mut outcome, line, message);
                }
                None => warn(
                    &mut outcome,
                    line_no,
                    format!("stray `{BLOCK_CLOSE}` outside a block ignored"),
                ),
            },
            Token::Line(content) => {
                let Some(block) = current.as_mut() else {
                    continue;
                };
                if content.is_empty() {
                    continue;
                }
                match split_field(content) {
                    Some((key, value)) => {
                        if block.fields.insert(key.clone(), value).is_some() {
                            warn(
                                &mut outcome,
                                line_no,
                                format!("field `{key}` repeated; last value wins"),
                            );
                        }
                    }
                    None => warn(
                        &mut outcome,
                        line_no,
                        "expected `key: value`; line ignored".to_string(),
                    ),
                }
            }
        }
    }
    if let Some(unterminated) = current {
        warn(
            &mut outcome,
            unterminated.line,
            format!("block never closed with `{BLOCK_CLOSE}`; skipped"),
        );
    }
    outcome
}

fn warn(outcome: &mut ParseOutcome, line: usize, message: String) {
    tracing::warn!(line, %message, "malformed update block");
    outcome.warnings.push(ParseWarning { line, message });
}

fn split_field(content: &str) -> Option<(String, String)> {
    let (key, value) = content.split_once(':')?;
    let key = key.trim().trim_start_matches('-').trim();
    let valid_key = !key.is_empty()
        && key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
    if !valid_key {
        return None;
    }
    Some((key.to_ascii_lowercase(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Lenient numeric coercion: surrounding whitespace is fine, non-numeric
/// text and non-finite values are not.
pub fn coerce_number(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Convert a raw block into a delta, reporting every problem at once.
pub fn validate_block(block: &RawBlock) -> Result<Delta, BlockError> {
    let mut violations = Vec::new();
    let at = |field: &str| format!("block@{}.{field}", block.line);
    let required = |field: &str, kind: ViolationKind, violations: &mut Vec<Violation>| {
        match block.fields.get(field).map(|value| value.trim()) {
            Some(value) if !value.is_empty() => Some(value.to_string()),
            _ => {
                violations.push(Violation::new(kind, at(field), format!("missing `{field}`")));
                None
            }
        }
    };

    let mut numbers = BTreeMap::new();
    for field in NUMERIC_FIELDS {
        let Some(raw) = block.fields.get(field) else {
            continue;
        };
        match coerce_number(raw) {
            Some(value) => {
                numbers.insert(field, value);
            }
            None => violations.push(Violation::new(
                numeric_kind(block.tag),
                at(field),
                format!("`{field}` must be numeric, got {raw:?}"),
            )),
        }
    }

    let extra = extra_fields(block, &numbers);
    let delta = match block.tag {
        BlockTag::AddNode => {
            let id = required("id", ViolationKind::NodeField, &mut violations);
            let label = required("label", ViolationKind::NodeField, &mut violations);
            let node_type = required("type", ViolationKind::NodeField, &mut violations)
                .and_then(|raw| match raw.parse::<NodeType>() {
                    Ok(node_type) => Some(node_type),
                    Err(_) => {
                        violations.push(Violation::new(
                            ViolationKind::NodeField,
                            at("type"),
                            invalid_type_message(&raw),
                        ));
                        None
                    }
                });
            let confidence = numbers.get("confidence").copied();
            if let Some(value) = confidence {
                if !(0.0..=1.0).contains(&value) {
                    violations.push(Violation::new(
                        ViolationKind::NodeField,
                        at("confidence"),
                        format!("confidence {value} is outside [0, 1]"),
                    ));
                }
            }
            match (id, label, node_type) {
                (Some(id), Some(label), Some(node_type)) => Some(Delta::Node(Node {
                    id,
                    label,
                    node_type,
                    confidence,
                    extra,
                })),
                _ => None,
            }
        }
        BlockTag::AddEdge => {
            let source = required("source", ViolationKind::EdgeField, &mut violations);
            let target = required("target", ViolationKind::EdgeField, &mut violations);
            let relation = block
                .fields
                .get("relation")
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_RELATION)
                .to_string();
            match (source, target) {
                (Some(source), Some(target)) => Some(Delta::Edge(Edge {
                    source,
                    target,
                    relation,
                    extra,
                })),
                _ => None,
            }
        }
    };

    match delta {
        Some(delta) if violations.is_empty() => Ok(delta),
        _ => Err(BlockError {
            line: block.line,
            violations,
        }),
    }
}

fn numeric_kind(tag: BlockTag) -> ViolationKind {
    match tag {
        BlockTag::AddNode => ViolationKind::NodeField,
        BlockTag::AddEdge => ViolationKind::EdgeField,
    }
}

fn extra_fields(block: &RawBlock, numbers: &BTreeMap<&str, f64>) -> BTreeMap<String, Value> {
    let reserved: &[&str] = match block.tag {
        BlockTag::AddNode => &["id", "label", "type", "confidence"],
        BlockTag::AddEdge => &["source", "target", "relation"],
    };
    block
        .fields
        .iter()
        .filter(|(key, _)| !reserved.contains(&key.as_str()))
        .map(|(key, value)| {
            let value = match numbers.get(key.as_str()) {
                Some(number) => Value::from(*number),
                None => Value::String(value.clone()),
            };
            (key.clone(), value)
        })
        .collect()
}

#[cfg(test)]
#[path = "update_block_tests.rs"]
mod tests;
