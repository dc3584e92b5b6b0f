use super::*;
use crate::config::default_config;
use std::fs;
use std::sync::Arc;
use std::thread;

fn manager(root: &std::path::Path) -> WorkflowStateManager {
    WorkflowStateManager::new(StorePaths::new(root), default_config())
}

#[test]
fn start_creates_then_resumes_active_instance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());

    let first = manager.start("Add Search", None).expect("start");
    assert!(!first.resumed);
    assert_eq!(first.instance.instance_id, "add-search");
    assert_eq!(first.instance.current_phase.as_deref(), Some("research"));
    assert!(dir.path().join("workflows/active/add-search.json").is_file());

    let again = manager.start("add search", None).expect("resume");
    assert!(again.resumed);
    assert_eq!(again.instance.instance_id, "add-search");
}

#[test]
fn start_suffixes_ids_of_finished_instances() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Add Search", None).expect("start");
    manager.complete("add-search").expect("complete");

    let next = manager.start("Add Search", None).expect("start again");
    assert!(!next.resumed);
    assert_eq!(next.instance.instance_id, "add-search-2");
}

#[test]
fn start_rejects_unknown_workflow_type() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = manager(dir.path())
        .start("Add Search", Some("bugfix"))
        .expect_err("unknown type");
    assert!(matches!(err, StoreError::UnknownWorkflow { .. }));
}

#[test]
fn concurrent_mark_completed_keeps_every_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = Arc::new(manager(dir.path()));
    manager.start("Parallel", None).expect("start");

    let callers = 8;
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager
                    .mark_completed("parallel", "research", BTreeMap::new())
                    .expect("mark completed");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }

    let instance = manager.load("parallel").expect("load");
    assert_eq!(instance.completed_phases.len(), callers);
}

#[test]
fn mark_completed_advances_and_records_durations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Flow", None).expect("start");

    let mut metrics = BTreeMap::new();
    metrics.insert("sources".to_string(), serde_json::json!(3));
    let instance = manager
        .mark_completed("flow", "research", metrics)
        .expect("complete research");
    assert_eq!(instance.current_phase.as_deref(), Some("plan"));
    assert!(instance.deviations.is_empty());
    assert_eq!(instance.completed_phases[0].metrics["sources"], 3);
    assert!(instance.completed_phases[0].duration_secs >= 0.0);
}

#[test]
fn out_of_order_completion_records_skip_deviations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Flow", None).expect("start");

    let instance = manager
        .mark_completed("flow", "implement", BTreeMap::new())
        .expect("skip ahead");
    assert_eq!(instance.deviations.len(), 1);
    assert_eq!(instance.deviations[0].kind, DeviationType::SkipForward);
    assert_eq!(instance.deviations[0].from_phase.as_deref(), Some("research"));
    assert_eq!(instance.current_phase.as_deref(), Some("review"));

    let instance = manager
        .mark_completed("flow", "research", BTreeMap::new())
        .expect("go back");
    assert_eq!(instance.deviations[1].kind, DeviationType::SkipBackward);
}

#[test]
fn unknown_phase_is_rejected_without_writing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Flow", None).expect("start");
    let err = manager
        .mark_completed("flow", "deploy", BTreeMap::new())
        .expect_err("unknown phase");
    assert!(matches!(err, StoreError::UnknownPhase { .. }));
    assert!(manager.load("flow").expect("load").completed_phases.is_empty());
}

#[test]
fn null_lists_on_disk_load_as_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    let path = dir.path().join("workflows/active/legacy.json");
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(
        &path,
        r#"{"instance_id":"legacy","workflow_type":"feature","status":"in_progress",
            "current_phase":"plan","completed_phases":null,"deviations":null}"#,
    )
    .expect("write");

    let instance = manager.load("legacy").expect("load");
    assert!(instance.completed_phases.is_empty());
    let instance = manager
        .mark_completed("legacy", "plan", BTreeMap::new())
        .expect("mark completed");
    assert_eq!(instance.completed_phases.len(), 1);
}

#[test]
fn corrupt_or_missing_record_loads_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    let path = dir.path().join("workflows/active/broken.json");
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(&path, b"{\"instance_id\": ").expect("write");

    let instance = manager.load("broken").expect("load falls back");
    assert_eq!(instance.instance_id, "broken");
    assert_eq!(instance.status, WorkflowStatus::InProgress);
    assert!(instance.completed_phases.is_empty());

    let missing = manager.load("never-started").expect("load missing");
    assert_eq!(missing.current_phase.as_deref(), Some("research"));
}

#[test]
fn terminal_transition_relocates_the_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Dead End", None).expect("start");

    let instance = manager
        .abandon("dead-end", "superseded by new design")
        .expect("abandon");
    assert_eq!(instance.status, WorkflowStatus::Abandoned);
    assert!(!dir.path().join("workflows/active/dead-end.json").exists());
    assert!(dir.path().join("workflows/abandoned/dead-end.json").is_file());

    let loaded = manager.load("dead-end").expect("load");
    assert_eq!(loaded.abandon_reason.as_deref(), Some("superseded by new design"));
}

#[test]
fn terminal_instances_refuse_further_changes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Shipped", None).expect("start");
    manager.complete("shipped").expect("complete");

    let err = manager.abandon("shipped", "too late").expect_err("terminal");
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
    let err = manager
        .mark_completed("shipped", "release", BTreeMap::new())
        .expect_err("terminal");
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
    assert!(dir.path().join("workflows/completed/shipped.json").is_file());
}

#[test]
fn mutating_a_missing_instance_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = manager(dir.path())
        .complete("ghost")
        .expect_err("missing instance");
    assert!(matches!(err, StoreError::InstanceNotFound { .. }));
}

#[test]
fn list_filters_by_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("One", None).expect("start");
    manager.start("Two", None).expect("start");
    manager.complete("two").expect("complete");

    let all = manager.list(None).expect("list");
    assert_eq!(all.len(), 2);
    let active = manager.list(Some(WorkflowStatus::InProgress)).expect("list");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].instance_id, "one");
}

#[test]
fn history_and_analysis_summarize_progress() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Flow", None).expect("start");
    manager
        .mark_completed("flow", "research", BTreeMap::new())
        .expect("research");
    manager
        .mark_completed("flow", "implement", BTreeMap::new())
        .expect("implement");

    let history = manager.history("flow").expect("history");
    assert_eq!(history.events.len(), 3);
    assert!(matches!(
        history.events[0],
        HistoryEvent::PhaseCompleted { ref phase_id, .. } if phase_id == "research"
    ));

    let analysis = manager.analyze("flow").expect("analyze");
    assert_eq!(analysis.deviation_counts.get("skip_forward"), Some(&1));
    assert_eq!(analysis.remaining_phases, vec!["plan", "review", "release"]);
    assert_eq!(analysis.phases.len(), 5);
    assert_eq!(analysis.phases[0].completions, 1);
}

fn record(dir: &std::path::Path, location: &str, instance_id: &str) -> std::path::PathBuf {
    dir.join("workflows").join(location).join(format!("{instance_id}.json"))
}

#[test]
fn finish_after_crash_before_source_removal_completes_the_move() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Crash", None).expect("start");

    // Terminal copy written, in-progress copy not yet removed.
    let mut finished = manager.load("crash").expect("load");
    finished.status = WorkflowStatus::Completed;
    {
        let guard = manager.instances().lock("crash").expect("lock");
        manager.instances().save(&guard, &finished).expect("save terminal copy");
    }
    assert!(record(dir.path(), "active", "crash").is_file());
    assert_eq!(manager.load("crash").expect("load").status, WorkflowStatus::Completed);

    let retried = manager.complete("crash").expect("retry is idempotent");
    assert_eq!(retried.status, WorkflowStatus::Completed);
    assert!(!record(dir.path(), "active", "crash").exists());
    assert!(record(dir.path(), "completed", "crash").is_file());
}

#[test]
fn terminal_record_left_in_active_location_is_settled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Crash", None).expect("start");

    let mut finished = manager.load("crash").expect("load");
    finished.status = WorkflowStatus::Completed;
    fs::write(
        record(dir.path(), "active", "crash"),
        serde_json::to_vec_pretty(&finished).expect("serialize"),
    )
    .expect("write misplaced record");

    let next = manager.start("Crash", None).expect("start again");
    assert!(!next.resumed);
    assert_eq!(next.instance.instance_id, "crash-2");
    assert!(!record(dir.path(), "active", "crash").exists());
    assert!(record(dir.path(), "completed", "crash").is_file());

    manager.complete("crash").expect("already complete");
    let err = manager.abandon("crash", "late").expect_err("terminal");
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[test]
fn every_write_backs_up_the_previous_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Tracked", None).expect("start");
    assert!(manager.instances().backups().list("tracked").expect("list").is_empty());

    manager
        .mark_completed("tracked", "research", BTreeMap::new())
        .expect("research");
    manager.complete("tracked").expect("complete");

    let backups = manager.instances().backups().list("tracked").expect("list");
    assert_eq!(backups.len(), 2);
    assert!(backups
        .iter()
        .all(|entry| entry.path.starts_with(dir.path().join("workflows/backups/tracked"))));
    let newest: WorkflowInstance =
        serde_json::from_slice(&fs::read(&backups[0].path).expect("read")).expect("parse");
    assert_eq!(newest.status, WorkflowStatus::InProgress);
    assert_eq!(newest.completed_phases.len(), 1);
}

#[test]
fn restore_replaces_a_corrupt_record_from_its_backup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Fragile", None).expect("start");
    manager
        .mark_completed("fragile", "research", BTreeMap::new())
        .expect("research");
    fs::write(record(dir.path(), "active", "fragile"), b"{\"instance_id\": ").expect("corrupt");

    let outcome = manager
        .restore("fragile", &BackupSelector::Latest)
        .expect("restore");
    let safety = outcome.safety_backup.expect("corrupt record backed up first");
    assert_eq!(fs::read(&safety.path).expect("read"), b"{\"instance_id\": ");

    let restored = manager.load("fragile").expect("load");
    assert_eq!(restored.title, "Fragile");
    assert!(restored.completed_phases.is_empty());
}

#[test]
fn restore_moves_the_record_to_the_backup_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Reopen", None).expect("start");
    manager.abandon("reopen", "wrong call").expect("abandon");

    manager
        .restore("reopen", &BackupSelector::Latest)
        .expect("restore");
    assert!(record(dir.path(), "active", "reopen").is_file());
    assert!(!record(dir.path(), "abandoned", "reopen").exists());
    assert_eq!(manager.load("reopen").expect("load").status, WorkflowStatus::InProgress);

    let err = manager
        .restore("never-started", &BackupSelector::Latest)
        .expect_err("no backups");
    assert!(matches!(err, StoreError::BackupNotFound { .. }));
}

#[test]
fn declined_plan_leaves_the_record_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(dir.path());
    manager.start("Careful", None).expect("start");

    let (seen, entered) = manager
        .enter_phase_if("careful", "release", |instance, _| {
            Ok((instance.current_phase.clone(), None))
        })
        .expect("plan");
    assert_eq!(seen.as_deref(), Some("research"));
    assert!(entered.is_none());
    assert!(manager.instances().backups().list("careful").expect("list").is_empty());
    assert_eq!(
        manager.load("careful").expect("load").current_phase.as_deref(),
        Some("research")
    );
}
