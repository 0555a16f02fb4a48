use clap::Args;
use color_eyre::Result;
use polybuild::path::SomeDirPath;
use polybuild::query::{self, OutputFormat, TargetSet};
use tracing::instrument;

use super::WorkspaceHandle;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Restrict to one target's transitive dependency closure; prints the
    /// whole workspace graph if omitted.
    target: Option<String>,

    #[arg(long, default_value = ".")]
    workspace: SomeDirPath,

    /// Output format: pretty, list, json, or dot.
    #[arg(long, default_value = "dot")]
    format: OutputFormat,
}

#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<u8> {
    let root = options.workspace.try_as_abs_dir_using_cwd()?;
    let workspace = WorkspaceHandle::load(root).await?;

    let result = match &options.target {
        Some(name) => {
            let id = workspace.resolve_target(name)?;
            TargetSet::from_ids(super::transitive_deps(&workspace.graph, id))
        }
        None => TargetSet::from_ids(workspace.graph.all_ids()),
    };

    let rendered = query::format_result(&workspace.graph, &workspace.interner, options.format, &result)?;
    println!("{rendered}");

    Ok(0)
}
