use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Command, RootArgs};
use commands::StoreContext;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = RootArgs::parse();
    let ctx = StoreContext::open(args.root)?;

    match args.command {
        Command::Check(args) => {
            let code = commands::run_check(&ctx, args)?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::List(args) => commands::run_list(&ctx, args),
        Command::Show(args) => commands::run_show(&ctx, args),
        Command::Resume(args) => commands::run_resume(&ctx, args),
        Command::Abandon(args) => commands::run_abandon(&ctx, args),
        Command::History(args) => commands::run_history(&ctx, args),
        Command::Analyze(args) => commands::run_analyze(&ctx, args),
        Command::Restore(args) => commands::run_restore(&ctx, args),
        Command::Apply(args) => commands::run_apply(&ctx, args),
        Command::Graph(args) => commands::run_graph(&ctx, args),
        Command::Start(args) => commands::run_start(&ctx, args),
        Command::CompletePhase(args) => commands::run_complete_phase(&ctx, args),
        Command::Advance(args) => commands::run_advance(&ctx, args),
        Command::Complete(args) => commands::run_complete(&ctx, args),
        Command::Audit(args) => commands::run_audit(&ctx, args),
    }
}
