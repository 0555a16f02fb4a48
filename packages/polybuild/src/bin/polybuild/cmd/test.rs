use clap::Args;
use color_eyre::Result;
use polybuild::{graph::TargetKind, path::SomeDirPath};
use tracing::instrument;

use super::WorkspaceHandle;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Test target to run; runs every `test` target in the workspace if
    /// omitted.
    target: Option<String>,

    #[arg(long, default_value = ".")]
    workspace: SomeDirPath,
}

#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<u8> {
    let root = options.workspace.try_as_abs_dir_using_cwd()?;
    let mut workspace = WorkspaceHandle::load(root).await?;

    if let Some(target) = &options.target {
        let id = workspace.resolve_target(target)?;
        workspace.scope_to(id);
    } else {
        // No explicit target: restrict the build to `test`-kind targets and
        // whatever they transitively depend on.
        let test_ids: Vec<_> = workspace
            .graph
            .all_ids()
            .filter(|id| {
                workspace
                    .graph
                    .node(*id)
                    .map(|n| n.target.kind == TargetKind::Test)
                    .unwrap_or(false)
            })
            .collect();
        let required = test_ids
            .iter()
            .flat_map(|id| super::transitive_deps(&workspace.graph, *id))
            .collect::<std::collections::BTreeSet<_>>();
        for id in workspace.graph.all_ids().collect::<Vec<_>>() {
            if !required.contains(&id) {
                if let Some(node) = workspace.graph.node_mut(id) {
                    node.state = polybuild::graph::NodeState::Skipped;
                }
            }
        }
    }

    let mut graph = workspace.graph;
    let executor = workspace.new_executor();
    let (summary, code) =
        super::run_to_completion(&executor, &mut graph, &workspace.interner, None).await?;

    if summary.is_cancelled() {
        println!("test run cancelled");
    } else {
        println!(
            "ran {built} test target(s), {cached} cached, {failed} failed",
            built = summary.built,
            cached = summary.cached,
            failed = summary.failed,
        );
    }

    Ok(code)
}
