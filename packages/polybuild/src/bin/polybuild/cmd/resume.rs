use clap::Args;
use color_eyre::{Result, eyre::bail};
use polybuild::path::{AbsFilePath, SomeDirPath};
use tracing::instrument;

use super::WorkspaceHandle;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Checkpoint file written by a previous `build --checkpoint` run.
    checkpoint: AbsFilePath,

    #[arg(long, default_value = ".")]
    workspace: SomeDirPath,
}

#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<u8> {
    let root = options.workspace.try_as_abs_dir_using_cwd()?;
    let workspace = WorkspaceHandle::load(root).await?;

    let mut graph = workspace.graph;
    let executor = workspace.new_executor();

    if !executor
        .resume(&mut graph, &workspace.interner, &options.checkpoint)
        .await?
    {
        bail!("no checkpoint found at {:?}", options.checkpoint);
    }

    let (summary, code) = super::run_to_completion(
        &executor,
        &mut graph,
        &workspace.interner,
        Some(&options.checkpoint),
    )
    .await?;

    if summary.is_cancelled() {
        println!("resumed build cancelled ({duration_ms}ms)", duration_ms = summary.duration_ms);
    } else {
        println!(
            "resumed: built {built}, cached {cached}, failed {failed}, skipped {skipped} ({duration_ms}ms)",
            built = summary.built,
            cached = summary.cached,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms,
        );
    }

    Ok(code)
}
