//! `polybuild`: the workspace-facing CLI. Loads a workspace, dispatches to
//! one subcommand, and maps the result to a process exit code per the
//! documented contract (0 success, 1 build failure, 2 config/parse error,
//! 3 cycle detected, 4 internal error, 130 interrupted). Build-running
//! subcommands (`build`, `test`, `resume`) produce their own exit code
//! directly via `cmd::run_to_completion`, which distinguishes a clean
//! Ctrl+C cancellation from a real failure; `exit_code_for` below only
//! classifies the remaining subcommands' uncaught errors.

mod cmd;
mod log;

use clap::Parser;
use color_eyre::Result;

use crate::log::WhenColor;

#[derive(Debug, Parser)]
#[command(name = "polybuild", version, about = "Polyglot monorepo build orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: cmd::Command,

    /// When to colorize output.
    #[arg(long, global = true, default_value = "auto")]
    color: WhenColor,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let subscriber = log::make_logger(std::io::stderr, cli.color)?;
    tracing::subscriber::set_global_default(subscriber)?;

    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(?err, "polybuild failed");
            eprintln!("error: {err:?}");
            exit_code_for(&err)
        }
    };

    std::process::exit(code.into());
}

async fn run(command: cmd::Command) -> Result<u8> {
    match command {
        cmd::Command::Build(options) => cmd::build::exec(options).await,
        cmd::Command::Test(options) => cmd::test::exec(options).await,
        cmd::Command::Clean(options) => cmd::clean::exec(options).await,
        cmd::Command::Graph(options) => cmd::graph::exec(options).await,
        cmd::Command::Query(options) => cmd::query::exec(options).await,
        cmd::Command::Resume(options) => cmd::resume::exec(options).await,
        cmd::Command::Debug(command) => cmd::debug::exec(command).await,
    }
}

/// Best-effort classification of an otherwise-uncaught error into the
/// documented exit code space; anything we can't place lands on the
/// catch-all internal-error code.
fn exit_code_for(err: &color_eyre::Report) -> u8 {
    let message = err.to_string();
    if message.contains("cycle") {
        3
    } else if message.contains("parse") || message.contains("config") {
        2
    } else {
        4
    }
}
