use super::*;
use serde_json::{json, Value};
use std::sync::{Arc, Barrier};
use std::thread;

fn store() -> AtomicStore {
    AtomicStore::new(Duration::from_secs(5))
}

fn temp_files(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| is_temp_file_name(name))
        .collect()
}

#[test]
fn write_then_read_returns_identical_document() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("graphs").join("ml.json");
    let doc = json!({
        "nodes": [{"id": "a", "label": "A", "type": "concept", "confidence": 0.5, "note": "x"}],
        "edges": []
    });
    store().write_json(&path, &doc).expect("write");
    let read: Value = store().read_json(&path, || json!(null)).expect("read");
    assert_eq!(read, doc);
    assert!(temp_files(path.parent().expect("parent")).is_empty());
}

#[test]
fn missing_file_returns_caller_default() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let read: Value = store()
        .read_json(&dir.path().join("absent.json"), || json!({"nodes": [], "edges": []}))
        .expect("read default");
    assert_eq!(read, json!({"nodes": [], "edges": []}));
}

#[test]
fn unparsable_content_is_corruption_not_default() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("broken.json");
    fs::write(&path, b"{\"nodes\": [").expect("write broken");
    let err = store()
        .read_json::<Value, _>(&path, || json!({}))
        .expect_err("corruption");
    assert!(matches!(err, StoreError::Corruption { .. }));
}

#[test]
fn crash_before_replace_leaves_original_untouched() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("ml.json");
    store()
        .write_json(&path, &json!({"nodes": [], "edges": []}))
        .expect("seed");
    let original = fs::read(&path).expect("read original");

    let mut staged = None;
    let err = write_atomic_with(&path, b"{\"nodes\": [1,2,3]}", |tmp| {
        staged = Some(fs::read(tmp)?);
        Err(std::io::Error::other("writer killed"))
    })
    .expect_err("simulated crash");
    assert!(matches!(err, StoreError::Storage { .. }));
    assert_eq!(staged.as_deref(), Some(&b"{\"nodes\": [1,2,3]}"[..]));
    assert_eq!(fs::read(&path).expect("read after crash"), original);
    assert!(temp_files(dir.path()).is_empty());
}

#[test]
fn leftover_temp_file_does_not_affect_reads_and_is_swept() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("ml.json");
    store()
        .write_json(&path, &json!({"nodes": [], "edges": []}))
        .expect("seed");
    let orphan = dir.path().join(".ml.json.4242.1700000000000000000.abc123.tmp");
    fs::write(&orphan, b"{\"nodes\": [").expect("write orphan");

    let read: Value = store().read_json(&path, || json!(null)).expect("read");
    assert_eq!(read, json!({"nodes": [], "edges": []}));

    assert_eq!(
        find_orphan_temps(dir.path(), Duration::ZERO).expect("find"),
        vec![orphan.clone()]
    );
    let removed = sweep_orphan_temps(dir.path(), Duration::ZERO).expect("sweep");
    assert_eq!(removed, vec![orphan.clone()]);
    assert!(!orphan.exists());
    assert!(path.exists());
}

#[test]
fn temp_names_carry_pid_and_subsecond_stamp() {
    let prefix = temp_prefix(Path::new("/srv/kg/graphs/ml.json"));
    let pid = std::process::id().to_string();
    let parts: Vec<&str> = prefix.trim_end_matches('.').split('.').collect();
    assert_eq!(parts[1..3], ["ml", "json"]);
    assert_eq!(parts[3], pid);
    assert!(parts[4].len() > 10, "nanosecond stamp expected in {prefix}");
    assert!(is_temp_file_name(&format!("{prefix}x1y2z3{TEMP_SUFFIX}")));
    assert!(!is_temp_file_name("ml.json"));
}

#[test]
fn append_line_keeps_one_record_per_line() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("audit.jsonl");
    store().append_line(&path, "{\"n\":1}").expect("append");
    store().append_line(&path, "{\"n\":2}\n").expect("append");
    let text = fs::read_to_string(&path).expect("read log");
    assert_eq!(text, "{\"n\":1}\n{\"n\":2}\n");
}

#[test]
fn update_holds_lock_across_read_modify_write() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = Arc::new(dir.path().join("counter.json"));
    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let path = Arc::clone(&path);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store()
                    .update(&path, || json!({"count": 0}), |doc: &mut Value| {
                        let next = doc["count"].as_u64().unwrap_or(0) + 1;
                        doc["count"] = json!(next);
                        Ok(())
                    })
                    .expect("update");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }
    let doc: Value = store().read_json(&path, || json!(null)).expect("read");
    assert_eq!(doc["count"], json!(workers));
}

#[test]
fn concurrent_writers_leave_exactly_one_complete_document() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = Arc::new(dir.path().join("ml.json"));
    let big = |tag: &str| {
        let nodes: Vec<Value> = (0..400)
            .map(|idx| json!({"id": format!("{tag}-{idx}"), "label": tag, "type": "concept"}))
            .collect();
        json!({"nodes": nodes, "edges": []})
    };
    let first = big("first");
    let second = big("second");
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [first.clone(), second.clone()]
        .into_iter()
        .map(|doc| {
            let path = Arc::clone(&path);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..5 {
                    store().write_json(&path, &doc).expect("write");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }
    let read: Value = store().read_json(&path, || json!(null)).expect("read");
    assert!(read == first || read == second, "interleaved write observed");
}
