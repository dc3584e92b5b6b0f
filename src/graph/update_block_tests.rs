use super::*;

const PRODUCER_TEXT: &str = "\
Here is what I found about attention models.

<<<UPDATE add_node
id: transformer
type: concept
label: Transformer
confidence: 0.9
source_url: https://arxiv.org/abs/1706.03762
>>>

Some prose in between.

<<<UPDATE add_edge
source: google
target: transformer
relation: created
weight: \" 2 \"
>>>
";

#[test]
fn parses_blocks_out_of_surrounding_prose() {
    let outcome = parse_blocks(PRODUCER_TEXT);
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
    assert_eq!(outcome.blocks.len(), 2);
    assert_eq!(outcome.blocks[0].tag, BlockTag::AddNode);
    assert_eq!(outcome.blocks[0].line, 3);
    assert_eq!(
        outcome.blocks[0].fields.get("source_url").map(String::as_str),
        Some("https://arxiv.org/abs/1706.03762")
    );
    assert_eq!(outcome.blocks[1].tag, BlockTag::AddEdge);
}

#[test]
fn unterminated_and_nested_looking_blocks_are_skipped_not_fatal() {
    let text = "\
<<<UPDATE add_node
id: a
type: concept
<<<UPDATE add_node
id: b
type: concept
label: B
>>>
<<<UPDATE add_edge
source: b
";
    let outcome = parse_blocks(text);
    assert_eq!(outcome.blocks.len(), 1);
    assert_eq!(outcome.blocks[0].fields.get("id").map(String::as_str), Some("b"));
    let lines: Vec<usize> = outcome.warnings.iter().map(|warning| warning.line).collect();
    assert_eq!(lines, vec![1, 9]);
    assert!(outcome.warnings[1].message.contains("never closed"));
}

#[test]
fn unknown_tags_bad_lines_and_stray_closers_warn() {
    let text = "\
>>>
<<<UPDATE delete_node
id: a
>>>
<<<UPDATE add_node
this line has no separator
id: a
id: a2
label: A
type: event
>>>
";
    let outcome = parse_blocks(text);
    assert_eq!(outcome.blocks.len(), 1);
    assert_eq!(outcome.blocks[0].fields.get("id").map(String::as_str), Some("a2"));
    let messages: Vec<String> = outcome.warnings.iter().map(ToString::to_string).collect();
    assert_eq!(messages.len(), 4, "{messages:?}");
    assert!(messages[0].starts_with("line 1: stray"));
    assert!(messages[1].contains("unknown block tag \"delete_node\""));
    assert!(messages[2].starts_with("line 6: expected `key: value`"));
    assert!(messages[3].contains("repeated"));
}

#[test]
fn valid_blocks_become_deltas_with_coerced_numbers() {
    let outcome = parse_blocks(PRODUCER_TEXT);
    let node = validate_block(&outcome.blocks[0]).expect("node block");
    let Delta::Node(node) = node else {
        panic!("expected node delta");
    };
    assert_eq!(node.node_type, NodeType::Concept);
    assert_eq!(node.confidence, Some(0.9));
    assert_eq!(
        node.extra.get("source_url"),
        Some(&Value::String("https://arxiv.org/abs/1706.03762".to_string()))
    );

    let edge = validate_block(&outcome.blocks[1]).expect("edge block");
    let Delta::Edge(edge) = edge else {
        panic!("expected edge delta");
    };
    assert_eq!(edge.relation, "created");
    assert_eq!(edge.extra.get("weight"), Some(&Value::from(2.0)));
}

#[test]
fn invalid_type_is_rejected_never_defaulted() {
    let outcome = parse_blocks("<<<UPDATE add_node\nid: x\nlabel: X\ntype: widget\n>>>\n");
    let err = validate_block(&outcome.blocks[0]).expect_err("invalid type");
    assert_eq!(err.violations.len(), 1);
    assert_eq!(err.violations[0].location, "block@1.type");
    assert!(err.to_string().contains("invalid type \"widget\""));
}

#[test]
fn type_spelling_is_case_insensitive() {
    let outcome = parse_blocks("<<<UPDATE add_node\nid: x\nlabel: X\ntype: Person\n>>>\n");
    let Ok(Delta::Node(node)) = validate_block(&outcome.blocks[0]) else {
        panic!("expected node delta");
    };
    assert_eq!(node.node_type, NodeType::Person);
}

#[test]
fn every_problem_in_a_block_is_reported_together() {
    let outcome = parse_blocks("<<<UPDATE add_node\ntype: concept\nconfidence: high\n>>>\n");
    let err = validate_block(&outcome.blocks[0]).expect_err("invalid block");
    let locations: Vec<&str> = err.violations.iter().map(|v| v.location.as_str()).collect();
    assert_eq!(
        locations,
        vec!["block@1.confidence", "block@1.id", "block@1.label"]
    );
}

#[test]
fn out_of_range_confidence_and_missing_edge_endpoints_are_rejected() {
    let outcome = parse_blocks(
        "<<<UPDATE add_node\nid: x\nlabel: X\ntype: event\nconfidence: 1.2\n>>>\n\
         <<<UPDATE add_edge\nsource: x\n>>>\n",
    );
    let err = validate_block(&outcome.blocks[0]).expect_err("range");
    assert!(err.violations[0].message.contains("outside [0, 1]"));
    let err = validate_block(&outcome.blocks[1]).expect_err("missing target");
    assert_eq!(err.violations[0].location, "block@7.target");
}

#[test]
fn edge_relation_defaults_when_absent() {
    let outcome = parse_blocks("<<<UPDATE add_edge\nsource: a\ntarget: b\n>>>");
    let Ok(Delta::Edge(edge)) = validate_block(&outcome.blocks[0]) else {
        panic!("expected edge delta");
    };
    assert_eq!(edge.relation, DEFAULT_RELATION);
}

#[test]
fn numeric_coercion_is_lenient_about_whitespace_only() {
    assert_eq!(coerce_number(" 0.25 "), Some(0.25));
    assert_eq!(coerce_number("1"), Some(1.0));
    assert_eq!(coerce_number("NaN"), None);
    assert_eq!(coerce_number("inf"), None);
    assert_eq!(coerce_number("0.5abc"), None);
    assert_eq!(coerce_number(""), None);
}
