use clap::Args;
use color_eyre::Result;
use polybuild::{
    fs,
    path::{SomeDirPath, TryJoinWith as _},
};
use tracing::instrument;

use super::WorkspaceHandle;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Target whose handler-level build outputs to clean; cleans every
    /// target and wipes the local cache directory if omitted.
    target: Option<String>,

    #[arg(long, default_value = ".")]
    workspace: SomeDirPath,
}

#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<u8> {
    let root = options.workspace.try_as_abs_dir_using_cwd()?;
    let workspace = WorkspaceHandle::load(root).await?;
    let handlers = workspace.handlers();

    match &options.target {
        Some(name) => {
            let id = workspace.resolve_target(name)?;
            let node = workspace
                .graph
                .node(id)
                .ok_or_else(|| color_eyre::eyre::eyre!("no such target: {name}"))?;
            handlers.resolve(&node.target).clean(&node.target).await?;
        }
        None => {
            for id in workspace.graph.all_ids().collect::<Vec<_>>() {
                if let Some(node) = workspace.graph.node(id) {
                    handlers.resolve(&node.target).clean(&node.target).await?;
                }
            }
            let cache_dir = workspace.root.try_join_dir(".polybuild-cache")?;
            if fs::exists(cache_dir.as_std_path()).await {
                fs::remove_dir_all(&cache_dir).await?;
            }
        }
    }

    Ok(0)
}
