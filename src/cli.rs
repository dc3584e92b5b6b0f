//! CLI argument parsing for the store administration commands.
//!
//! The CLI is thin: each subcommand maps onto one library operation and
//! prints its result as text or, with `--json`, as machine-readable JSON.
use clap::{Args, Parser, Subcommand, ValueEnum};
use kgstate::workflow::WorkflowStatus;
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "kgstate",
    version,
    about = "Crash-safe topic graphs and phase-enforced workflow state",
    after_help = "Examples:\n  kgstate check --fix\n  kgstate apply ml notes.txt\n  kgstate start \"Add search\"\n  kgstate complete-phase add-search research\n  kgstate advance add-search implement --reason \"plan reviewed offline\"\n  kgstate restore ml --list\n  kgstate restore add-search --instance",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Store root (defaults to the per-user data directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Check(CheckArgs),
    List(ListArgs),
    /// Show one workflow instance record
    Show(InstanceArgs),
    /// Show where an in-progress instance stands and what it needs next
    Resume(InstanceArgs),
    Abandon(AbandonArgs),
    /// Completions and deviations in time order
    History(InstanceArgs),
    /// Per-phase durations, deviation counts, and remaining phases
    Analyze(InstanceArgs),
    Restore(RestoreArgs),
    Apply(ApplyArgs),
    Graph(GraphArgs),
    Start(StartArgs),
    CompletePhase(CompletePhaseArgs),
    Advance(AdvanceArgs),
    /// Mark an in-progress instance completed
    Complete(InstanceArgs),
    Audit(AuditArgs),
}

/// Check command inputs.
#[derive(Args, Debug)]
#[command(about = "Check every document; exit 0 clean, 1 corrupt, 2 repair failed")]
pub struct CheckArgs {
    /// Repair what is repairable and sweep orphaned temp files
    #[arg(long)]
    pub fix: bool,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum StatusFilter {
    Active,
    Completed,
    Abandoned,
}

impl From<StatusFilter> for WorkflowStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Active => WorkflowStatus::InProgress,
            StatusFilter::Completed => WorkflowStatus::Completed,
            StatusFilter::Abandoned => WorkflowStatus::Abandoned,
        }
    }
}

#[derive(Args, Debug)]
#[command(about = "List workflow instances")]
pub struct ListArgs {
    /// Only instances in this location
    #[arg(long, value_enum)]
    pub status: Option<StatusFilter>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

/// Inputs for commands that address a single instance.
#[derive(Args, Debug)]
pub struct InstanceArgs {
    /// Workflow instance id
    pub id: String,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[command(about = "Abandon an in-progress workflow instance")]
pub struct AbandonArgs {
    /// Workflow instance id
    pub id: String,

    /// Why the work was abandoned
    #[arg(long)]
    pub reason: String,
}

#[derive(Args, Debug)]
#[command(about = "Restore a topic or workflow instance from backup, or list its backups")]
pub struct RestoreArgs {
    /// Graph topic, or instance id with `--instance`
    pub topic: String,

    /// Treat the name as a workflow instance id
    #[arg(long)]
    pub instance: bool,

    /// Backup stamp or id to restore (defaults to the newest)
    #[arg(long, value_name = "STAMP", conflicts_with = "list")]
    pub timestamp: Option<String>,

    /// List available backups instead of restoring
    #[arg(long)]
    pub list: bool,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[command(about = "Merge update blocks from producer text into a topic")]
pub struct ApplyArgs {
    /// Graph topic
    pub topic: String,

    /// File containing producer text (`-` for stdin)
    #[arg(value_name = "PATH")]
    pub file: PathBuf,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[command(about = "Show a topic graph, or list topics")]
pub struct GraphArgs {
    /// Graph topic; omit to list topics
    pub topic: Option<String>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[command(about = "Start (or resume) work under a title")]
pub struct StartArgs {
    /// Work title; the instance id is derived from it
    pub title: String,

    /// Workflow type from config.json
    #[arg(long, value_name = "TYPE")]
    pub workflow: Option<String>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[command(about = "Record a completed phase")]
pub struct CompletePhaseArgs {
    /// Workflow instance id
    pub id: String,

    /// Phase id
    pub phase: String,

    /// Metric to store with the completion (KEY=VALUE, repeatable)
    #[arg(long = "metric", value_name = "KEY=VALUE")]
    pub metrics: Vec<String>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[command(about = "Enter a phase, subject to enforcement")]
pub struct AdvanceArgs {
    /// Workflow instance id
    pub id: String,

    /// Target phase id
    pub phase: String,

    /// Reason for skipping recommended phases
    #[arg(long)]
    pub reason: Option<String>,

    /// Lines changed, as reported by the diff tool
    #[arg(long, default_value_t = 0)]
    pub lines: u64,

    /// Files changed, as reported by the diff tool
    #[arg(long, default_value_t = 0)]
    pub files: u64,

    /// The change introduces new features
    #[arg(long)]
    pub new_features: bool,

    /// Override a blocked transition with this justification
    #[arg(long, value_name = "JUSTIFICATION", requires = "user")]
    pub bypass: Option<String>,

    /// Who is overriding
    #[arg(long)]
    pub user: Option<String>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[command(about = "Show the bypass audit log")]
pub struct AuditArgs {
    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}
