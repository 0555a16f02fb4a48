use clap::Args;
use color_eyre::Result;
use polybuild::path::{AbsFilePath, SomeDirPath};
use tracing::instrument;

use super::WorkspaceHandle;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Target to build; builds every target in the workspace if omitted.
    target: Option<String>,

    /// Workspace root; defaults to the current directory.
    #[arg(long, default_value = ".")]
    workspace: SomeDirPath,

    /// Write a resumable checkpoint to this path after every completed
    /// target.
    #[arg(long)]
    checkpoint: Option<AbsFilePath>,
}

/// Exit codes per the external interface contract: 0 success, 1 build
/// failure, 2 config/parse error, 3 cycle detected, 4 internal error, 130
/// interrupted.
#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<u8> {
    let root = options.workspace.try_as_abs_dir_using_cwd()?;
    let mut workspace = WorkspaceHandle::load(root).await?;

    if let Some(target) = &options.target {
        let id = workspace.resolve_target(target)?;
        workspace.scope_to(id);
    }

    let mut graph = workspace.graph;
    let executor = workspace.new_executor();
    let (summary, code) = super::run_to_completion(
        &executor,
        &mut graph,
        &workspace.interner,
        options.checkpoint.as_ref(),
    )
    .await?;

    if summary.is_cancelled() {
        println!("build cancelled ({duration_ms}ms)", duration_ms = summary.duration_ms);
    } else {
        println!(
            "built {built}, cached {cached}, failed {failed}, skipped {skipped} ({duration_ms}ms)",
            built = summary.built,
            cached = summary.cached,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms,
        );
    }

    Ok(code)
}
