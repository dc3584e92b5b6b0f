//! Command handlers: open the store, call one library operation, print.
use crate::cli::{
    AbandonArgs, AdvanceArgs, ApplyArgs, AuditArgs, CheckArgs, CompletePhaseArgs, GraphArgs,
    InstanceArgs, ListArgs, RestoreArgs, StartArgs,
};
use anyhow::{anyhow, Context, Result};
use kgstate::backup::{BackupManager, BackupSelector};
use kgstate::bypass::AuditLog;
use kgstate::config::{load_config, StoreConfig};
use kgstate::enforcement::{
    authorize, evaluate_transition, BypassRequest, ChangeMetrics, TransitionRequest,
};
use kgstate::graph::GraphStore;
use kgstate::integrity::IntegrityChecker;
use kgstate::paths::StorePaths;
use kgstate::store::AtomicStore;
use kgstate::workflow::{slugify, HistoryEvent, WorkflowStateManager, WorkflowStatus};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

/// Everything a command needs, built once per invocation.
pub struct StoreContext {
    paths: StorePaths,
    config: StoreConfig,
}

impl StoreContext {
    pub fn open(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(root) => root,
            None => dirs::data_dir()
                .map(|dir| dir.join("kgstate"))
                .ok_or_else(|| anyhow!("no data directory for this user; pass --root <DIR>"))?,
        };
        let config = load_config(&root)
            .with_context(|| format!("load config from {}", root.display()))?;
        tracing::debug!(root = %root.display(), "opened store");
        Ok(Self {
            paths: StorePaths::new(root),
            config,
        })
    }

    fn store(&self) -> AtomicStore {
        AtomicStore::from_config(&self.config)
    }

    fn backups(&self) -> BackupManager {
        BackupManager::from_config(self.paths.clone(), &self.config)
    }

    fn graphs(&self) -> GraphStore {
        GraphStore::new(self.paths.clone(), self.store(), self.backups())
    }

    fn workflows(&self) -> WorkflowStateManager {
        WorkflowStateManager::new(self.paths.clone(), self.config.clone())
    }

    fn audit(&self) -> AuditLog {
        AuditLog::for_store(&self.paths, self.store())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{text}");
    Ok(())
}

/// Returns the process exit code.
pub fn run_check(ctx: &StoreContext, args: CheckArgs) -> Result<i32> {
    let checker = IntegrityChecker::from_config(ctx.paths.clone(), &ctx.config);
    let summary = if args.fix {
        checker.fix_all()?
    } else {
        checker.check_all()?
    };
    let code = summary.exit_code();
    if args.json {
        print_json(&summary)?;
        return Ok(code);
    }
    for report in &summary.reports {
        if report.valid {
            println!("ok       {}", report.path.display());
            continue;
        }
        let label = if report.repairable { "repair" } else { "corrupt" };
        println!("{label:<8} {}", report.path.display());
        for error in &report.errors {
            println!("         - {error}");
        }
        if let Some(step) = &report.next_step {
            println!("         next: {step}");
        }
    }
    for record in &summary.repairs {
        match (&record.outcome, &record.error) {
            (_, Some(error)) => println!("failed   {}: {error}", record.path.display()),
            (Some(outcome), None) => {
                let text = serde_json::to_string(outcome).context("serialize repair")?;
                println!("fixed    {}: {text}", record.path.display());
            }
            (None, None) => {}
        }
    }
    for orphan in &summary.orphan_temps {
        println!("orphan   {}", orphan.display());
    }
    for swept in &summary.swept_temps {
        println!("swept    {}", swept.display());
    }
    println!(
        "{} document(s), {} invalid, {} still invalid",
        summary.reports.len(),
        summary.invalid_count(),
        summary.remaining_invalid
    );
    Ok(code)
}

pub fn run_list(ctx: &StoreContext, args: ListArgs) -> Result<()> {
    let summaries = ctx
        .workflows()
        .list(args.status.map(WorkflowStatus::from))?;
    if args.json {
        return print_json(&summaries);
    }
    if summaries.is_empty() {
        println!("no workflow instances");
    }
    for summary in summaries {
        println!(
            "{:<32} {:<12} {:<10} phase={} completed={} deviations={}",
            summary.instance_id,
            summary.status.as_str(),
            summary.workflow_type,
            summary.current_phase.as_deref().unwrap_or("-"),
            summary.completed,
            summary.deviations
        );
    }
    Ok(())
}

pub fn run_show(ctx: &StoreContext, args: InstanceArgs) -> Result<()> {
    let instance = ctx.workflows().load(&args.id)?;
    if args.json {
        return print_json(&instance);
    }
    println!("instance: {}", instance.instance_id);
    if !instance.title.is_empty() {
        println!("title:    {}", instance.title);
    }
    println!("workflow: {}", instance.workflow_type);
    println!("status:   {}", instance.status);
    println!(
        "phase:    {}",
        instance.current_phase.as_deref().unwrap_or("-")
    );
    for phase in &instance.completed_phases {
        println!(
            "  done {} at {} ({:.1}s)",
            phase.phase_id,
            phase.completed_at.to_rfc3339(),
            phase.duration_secs
        );
    }
    for deviation in &instance.deviations {
        println!(
            "  {} -> {} [{}] {}",
            deviation.from_phase.as_deref().unwrap_or("-"),
            deviation.to_phase,
            deviation.kind.as_str(),
            deviation.reason
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct ResumeView {
    instance_id: String,
    current_phase: Option<String>,
    remaining_phases: Vec<String>,
    required_phases: Vec<String>,
    next_step: String,
}

pub fn run_resume(ctx: &StoreContext, args: InstanceArgs) -> Result<()> {
    let manager = ctx.workflows();
    let instance = manager.load(&args.id)?;
    if instance.status.is_terminal() {
        return Err(anyhow!(
            "instance {} is {}; start a new instance to continue the work",
            instance.instance_id,
            instance.status
        ));
    }
    let analysis = manager.analyze(&args.id)?;
    let definition = manager.definition(&instance.workflow_type)?;
    let (required_phases, next_step) = match instance.current_phase.as_deref() {
        Some(phase) => {
            let decision = evaluate_transition(
                definition,
                &instance,
                phase,
                &ChangeMetrics::default(),
                None,
            )?;
            let step = if decision.required_phases.is_empty() {
                format!("work on {phase}, then run `kgstate complete-phase {} {phase}`", instance.instance_id)
            } else {
                decision.reason.clone()
            };
            (decision.required_phases, step)
        }
        None => (
            Vec::new(),
            format!("all phases done; run `kgstate complete {}`", instance.instance_id),
        ),
    };
    let view = ResumeView {
        instance_id: instance.instance_id,
        current_phase: instance.current_phase,
        remaining_phases: analysis.remaining_phases,
        required_phases,
        next_step,
    };
    if args.json {
        return print_json(&view);
    }
    println!("instance:  {}", view.instance_id);
    println!("phase:     {}", view.current_phase.as_deref().unwrap_or("-"));
    println!("remaining: {}", view.remaining_phases.join(", "));
    println!("next:      {}", view.next_step);
    Ok(())
}

pub fn run_abandon(ctx: &StoreContext, args: AbandonArgs) -> Result<()> {
    let reason = args.reason.trim();
    if reason.is_empty() {
        return Err(anyhow!("supply a non-empty `--reason` to abandon {}", args.id));
    }
    let instance = ctx.workflows().abandon(&args.id, reason)?;
    println!("abandoned {}", instance.instance_id);
    Ok(())
}

pub fn run_complete(ctx: &StoreContext, args: InstanceArgs) -> Result<()> {
    let instance = ctx.workflows().complete(&args.id)?;
    if args.json {
        return print_json(&instance);
    }
    println!("completed {}", instance.instance_id);
    Ok(())
}

pub fn run_history(ctx: &StoreContext, args: InstanceArgs) -> Result<()> {
    let history = ctx.workflows().history(&args.id)?;
    if args.json {
        return print_json(&history);
    }
    println!("{} ({}, {})", history.instance_id, history.workflow_type, history.status);
    println!("{}  started", history.started_at.to_rfc3339());
    for event in &history.events {
        match event {
            HistoryEvent::PhaseCompleted {
                phase_id,
                at,
                duration_secs,
            } => println!("{}  completed {phase_id} ({duration_secs:.1}s)", at.to_rfc3339()),
            HistoryEvent::Deviation {
                kind,
                from_phase,
                to_phase,
                reason,
                at,
            } => println!(
                "{}  {} {} -> {to_phase}: {reason}",
                at.to_rfc3339(),
                kind.as_str(),
                from_phase.as_deref().unwrap_or("-")
            ),
        }
    }
    Ok(())
}

pub fn run_analyze(ctx: &StoreContext, args: InstanceArgs) -> Result<()> {
    let analysis = ctx.workflows().analyze(&args.id)?;
    if args.json {
        return print_json(&analysis);
    }
    println!("{} ({})", analysis.instance_id, analysis.status);
    for stat in &analysis.phases {
        println!(
            "  {:<16} completions={} time={:.1}s",
            stat.phase_id, stat.completions, stat.total_duration_secs
        );
    }
    println!("total time: {:.1}s", analysis.total_duration_secs);
    for (kind, count) in &analysis.deviation_counts {
        println!("deviations {kind}: {count}");
    }
    println!("remaining: {}", analysis.remaining_phases.join(", "));
    Ok(())
}

pub fn run_restore(ctx: &StoreContext, args: RestoreArgs) -> Result<()> {
    let workflows = ctx.workflows();
    let (backups, graph_path) = if args.instance {
        if slugify(&args.topic) != args.topic {
            return Err(anyhow!(
                "`{}` is not an instance id; run `kgstate list` to see instance ids",
                args.topic
            ));
        }
        (workflows.instances().backups().clone(), None)
    } else {
        (ctx.backups(), Some(ctx.graphs().topic_path(&args.topic)?))
    };
    if args.list {
        let entries = backups.list(&args.topic)?;
        if args.json {
            return print_json(&entries);
        }
        if entries.is_empty() {
            println!("no backups of {}", args.topic);
        }
        for entry in entries {
            println!("{}  {} bytes", entry.id, entry.size);
        }
        return Ok(());
    }
    let selector = match args.timestamp {
        Some(stamp) => BackupSelector::Timestamp(stamp),
        None => BackupSelector::Latest,
    };
    let outcome = match graph_path {
        Some(path) => backups.restore(&path, &selector)?,
        None => workflows.restore(&args.topic, &selector)?,
    };
    if args.json {
        return print_json(&outcome);
    }
    println!("restored {} from {}", args.topic, outcome.restored_from.id);
    if let Some(safety) = &outcome.safety_backup {
        println!("previous content saved as {}", safety.id);
    }
    Ok(())
}

pub fn run_apply(ctx: &StoreContext, args: ApplyArgs) -> Result<()> {
    let text = if args.file.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("read producer text from stdin")?;
        text
    } else {
        std::fs::read_to_string(&args.file)
            .with_context(|| format!("read {}", args.file.display()))?
    };
    let report = ctx.graphs().apply_update(&args.topic, &text)?;
    if args.json {
        return print_json(&report);
    }
    println!(
        "{}: {} block(s); +{} node(s), ~{} node(s), +{} edge(s)",
        report.topic,
        report.blocks_found,
        report.merge.nodes_added,
        report.merge.nodes_updated,
        report.merge.edges_added
    );
    for warning in &report.warnings {
        eprintln!("warning: line {}: {}", warning.line, warning.message);
    }
    for rejected in &report.rejected {
        eprintln!("rejected: {rejected}");
    }
    if let Some(backup) = &report.backup {
        println!("previous version saved as {}", backup.id);
    }
    Ok(())
}

pub fn run_graph(ctx: &StoreContext, args: GraphArgs) -> Result<()> {
    let graphs = ctx.graphs();
    let Some(topic) = args.topic else {
        let topics = graphs.topics()?;
        if args.json {
            return print_json(&topics);
        }
        for topic in topics {
            println!("{topic}");
        }
        return Ok(());
    };
    let doc = graphs.load(&topic)?;
    if args.json {
        return print_json(&doc);
    }
    println!("{topic}: {} node(s), {} edge(s)", doc.nodes.len(), doc.edges.len());
    for node in &doc.nodes {
        println!("  {} [{}] {}", node.id, node.node_type, node.label);
    }
    for edge in &doc.edges {
        println!("  {} -{}-> {}", edge.source, edge.relation, edge.target);
    }
    Ok(())
}

pub fn run_start(ctx: &StoreContext, args: StartArgs) -> Result<()> {
    let outcome = ctx.workflows().start(&args.title, args.workflow.as_deref())?;
    if args.json {
        return print_json(&outcome);
    }
    let verb = if outcome.resumed { "resumed" } else { "started" };
    println!(
        "{verb} {} at phase {}",
        outcome.instance.instance_id,
        outcome.instance.current_phase.as_deref().unwrap_or("-")
    );
    Ok(())
}

/// `KEY=VALUE`; values that parse as JSON keep their type.
fn parse_metric(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("metric {raw:?} must look like KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("metric {raw:?} has an empty key"));
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}

pub fn run_complete_phase(ctx: &StoreContext, args: CompletePhaseArgs) -> Result<()> {
    let metrics = args
        .metrics
        .iter()
        .map(String::as_str)
        .map(parse_metric)
        .collect::<Result<BTreeMap<_, _>>>()?;
    let instance = ctx
        .workflows()
        .mark_completed(&args.id, &args.phase, metrics)?;
    if args.json {
        return print_json(&instance);
    }
    println!(
        "completed {} for {}; now at {}",
        args.phase,
        instance.instance_id,
        instance.current_phase.as_deref().unwrap_or("-")
    );
    Ok(())
}

pub fn run_advance(ctx: &StoreContext, args: AdvanceArgs) -> Result<()> {
    let manager = ctx.workflows();
    let audit = ctx.audit();
    let bypass = match (&args.bypass, &args.user) {
        (Some(justification), Some(user)) => Some(BypassRequest {
            user: user.as_str(),
            justification: justification.as_str(),
        }),
        _ => None,
    };
    let request = TransitionRequest {
        instance_id: &args.id,
        target_phase: &args.phase,
        metrics: ChangeMetrics {
            lines_changed: args.lines,
            files_changed: args.files,
            has_new_features: args.new_features,
        },
        reason: args.reason.as_deref(),
        bypass,
    };
    let outcome = authorize(&manager, &audit, &request)?;
    if args.json {
        print_json(&outcome)?;
    }
    if !outcome.permitted() {
        return Err(anyhow!(
            "{} mode: {}",
            outcome.decision.mode,
            outcome.decision.reason
        ));
    }
    if !args.json {
        if let Some(entry) = &outcome.bypass {
            println!("bypass recorded for {} at {}", entry.user, entry.timestamp.to_rfc3339());
        }
        println!("{} entered {}: {}", args.id, args.phase, outcome.decision.reason);
    }
    Ok(())
}

pub fn run_audit(ctx: &StoreContext, args: AuditArgs) -> Result<()> {
    let entries = ctx.audit().entries()?;
    if args.json {
        return print_json(&entries);
    }
    for entry in entries {
        println!(
            "{}  {}  {}",
            entry.timestamp.to_rfc3339(),
            entry.user,
            entry.justification
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_metric;
    use serde_json::json;

    #[test]
    fn metrics_keep_json_types() {
        assert_eq!(parse_metric("tests=12").expect("number"), ("tests".to_string(), json!(12)));
        assert_eq!(
            parse_metric("note = needs docs").expect("string"),
            ("note".to_string(), json!("needs docs"))
        );
        assert!(parse_metric("=3").is_err());
        assert!(parse_metric("novalue").is_err());
    }
}
