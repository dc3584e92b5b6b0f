//! `kgstate check` exit codes.

mod common;

use common::TestStore;

const VALID: &str = r#"{"nodes": [{"id": "a", "label": "A", "type": "concept"}], "edges": []}"#;
const DANGLING: &str =
    r#"{"nodes": [{"id": "a", "label": "A", "type": "concept"}], "edges": [{"source": "a", "target": "gone"}]}"#;

#[test]
fn clean_store_exits_zero() {
    let store = TestStore::new();
    store.write("graphs/ml.json", VALID);
    let summary = store.run(&["check", "--json"]).assert_success().json();
    assert_eq!(summary["remaining_invalid"], 0);
}

#[test]
fn corruption_exits_one_until_fixed() {
    let store = TestStore::new();
    store.write("graphs/ml.json", DANGLING);
    assert_eq!(store.run(&["check"]).code, Some(1));

    let fixed = store.run(&["check", "--fix", "--json"]).assert_success().json();
    assert_eq!(fixed["repairs"][0]["outcome"]["status"], "repaired");
    assert_eq!(store.read_json("graphs/ml.json")["edges"], serde_json::json!([]));
    store.run(&["check"]).assert_success();
}

#[test]
fn failed_repair_exits_two() {
    let store = TestStore::new();
    store.write("graphs/ml.json", DANGLING);
    store.write("backups/ml", "not a directory");
    assert_eq!(store.run(&["check", "--fix"]).code, Some(2));
}

#[test]
fn unparsable_document_is_left_for_restore() {
    let store = TestStore::new();
    store.write("graphs/ml.json", "{\"nodes\": [");
    let result = store.run(&["check", "--fix"]);
    assert_eq!(result.code, Some(1));
    assert_eq!(
        std::fs::read_to_string(store.path("graphs/ml.json")).expect("read"),
        "{\"nodes\": ["
    );
}
