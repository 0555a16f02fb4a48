use clap::Args;
use color_eyre::Result;
use polybuild::path::SomeDirPath;
use polybuild::query::{self, OutputFormat};
use tracing::instrument;

use super::WorkspaceHandle;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Query expression, e.g. `deps(//app:main)` or `kind(test, //...)`.
    expression: String,

    #[arg(long, default_value = ".")]
    workspace: SomeDirPath,

    /// Output format: pretty, list, json, or dot.
    #[arg(long, default_value = "pretty")]
    format: OutputFormat,
}

#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<u8> {
    let root = options.workspace.try_as_abs_dir_using_cwd()?;
    let workspace = WorkspaceHandle::load(root).await?;

    let result = query::evaluate(&workspace.graph, &workspace.interner, &options.expression)?;
    let rendered = query::format_result(&workspace.graph, &workspace.interner, options.format, &result)?;
    println!("{rendered}");

    Ok(0)
}
