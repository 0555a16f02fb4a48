use std::sync::Arc;

use clap::Subcommand;
use color_eyre::{Result, eyre::Context};
use polybuild::{
    artifact::ArtifactStore,
    cache::{Cache, EvictionPolicy},
    executor::{Executor, ExecutorConfig, HandlerRegistry},
    graph::{Graph, Interner},
    handler::ShellHandler,
    ignore::IgnoreSet,
    path::{AbsDirPath, TryJoinWith as _},
    workspace_file::{self, WorkspaceFile},
};

pub mod build;
pub mod clean;
pub mod debug;
pub mod graph;
pub mod query;
pub mod resume;
pub mod test;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Build one target, or the whole workspace if none is given.
    Build(build::Options),
    /// Build and run one target's tests.
    Test(test::Options),
    /// Remove cached build state for the workspace.
    Clean(clean::Options),
    /// Print the dependency graph for one target, or the whole workspace.
    Graph(graph::Options),
    /// Evaluate a graph query expression.
    Query(query::Options),
    /// Resume an interrupted build from its last checkpoint.
    Resume(resume::Options),
    /// Debugging helpers with no stability guarantees.
    #[command(hide = true, subcommand)]
    Debug(debug::Command),
}

/// Everything a command needs to load and act on one workspace, assembled
/// once at the top of `main` and threaded through to whichever subcommand
/// ran.
pub struct WorkspaceHandle {
    pub root: AbsDirPath,
    pub file: WorkspaceFile,
    pub ignore: IgnoreSet,
    pub interner: Interner,
    pub graph: Graph,
    pub cache: Cache,
    pub artifacts: ArtifactStore,
}

impl WorkspaceHandle {
    pub async fn load(root: AbsDirPath) -> Result<Self> {
        let workspace_path = root.try_join_file(workspace_file::WORKSPACE_FILE_NAME)?;
        let file = workspace_file::load_workspace_file(&workspace_path)
            .await
            .with_context(|| format!("load {workspace_path:?}"))?;
        let ignore = file.ignore_set()?;
        let interner = Interner::new();
        let graph = workspace_file::load_graph(&root, &interner, &ignore)
            .await
            .context("load target declarations")?;

        let policy = EvictionPolicy::builder()
            .max_size(file.cache.max_size)
            .max_entries(file.cache.max_entries)
            .max_age_secs(file.cache.max_age_days as i64 * 86_400)
            .build();
        let cache_dir = root.try_join_dir(".polybuild-cache")?;
        let cache = Cache::open(cache_dir.as_std_path(), policy)
            .context("open local cache")?;

        let artifacts_dir = root.try_join_dir(".polybuild-cache/artifacts")?;
        let artifacts = ArtifactStore::open(artifacts_dir.as_std_path(), policy)
            .await
            .context("open artifact store")?;

        Ok(Self {
            root,
            file,
            ignore,
            interner,
            graph,
            cache,
            artifacts,
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let mut builder = ExecutorConfig::builder();
        if let Some(workers) = self.file.parallelism {
            builder = builder.workers(workers);
        }
        builder.build()
    }

    /// The default handler dispatch: every target runs through
    /// `handler_config["command"]` as a shell invocation. Real per-language
    /// backends are out of scope here (see `handler.rs`).
    pub fn handlers(&self) -> HandlerRegistry {
        HandlerRegistry::new(Arc::new(ShellHandler))
    }

    pub fn new_executor(&self) -> Executor {
        Executor::new(
            self.executor_config(),
            self.cache.clone(),
            self.artifacts.clone(),
            self.handlers(),
            self.root.as_str_lossy().into_owned(),
        )
    }

    /// Resolve a user-supplied target name to its id, erroring if unknown.
    pub fn resolve_target(&self, name: &str) -> Result<polybuild::graph::TargetId> {
        self.interner
            .lookup(name)
            .ok_or_else(|| color_eyre::eyre::eyre!("no such target: {name}"))
    }

    /// Mark every node outside `root`'s transitive dependency closure as
    /// [`polybuild::graph::NodeState::Skipped`], scoping a build/test/graph
    /// invocation to just the targets it actually needs.
    pub fn scope_to(&mut self, root: polybuild::graph::TargetId) {
        let required = transitive_deps(&self.graph, root);
        for id in self.graph.all_ids().collect::<Vec<_>>() {
            if !required.contains(&id) {
                if let Some(node) = self.graph.node_mut(id) {
                    node.state = polybuild::graph::NodeState::Skipped;
                }
            }
        }
    }
}

/// Run `executor` to completion with SIGINT wired to its cancel token, so a
/// Ctrl+C during a build asks in-flight handlers to wind down instead of
/// killing the process outright. Returns the summary alongside the exit
/// code the CLI contract assigns it: 0 success, 1 failure, 130 if the build
/// was cut short by the cancel signal rather than a real failure.
pub async fn run_to_completion(
    executor: &polybuild::executor::Executor,
    graph: &mut Graph,
    interner: &Interner,
    checkpoint_path: Option<&polybuild::path::AbsFilePath>,
) -> Result<(polybuild::executor::BuildSummary, u8)> {
    let cancel = executor.cancel_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let summary = executor.run(graph, interner, checkpoint_path).await?;
    watcher.abort();

    let code = if summary.is_cancelled() {
        130
    } else if summary.is_success() {
        0
    } else {
        1
    };
    Ok((summary, code))
}

/// Breadth-first transitive dependency closure of `root`, `root` included.
pub fn transitive_deps(
    graph: &Graph,
    root: polybuild::graph::TargetId,
) -> std::collections::BTreeSet<polybuild::graph::TargetId> {
    let mut seen = std::collections::BTreeSet::from([root]);
    let mut frontier = vec![root];
    while let Some(id) = frontier.pop() {
        let Some(node) = graph.node(id) else { continue };
        for dep in node.resolved_deps.clone() {
            if seen.insert(dep) {
                frontier.push(dep);
            }
        }
    }
    seen
}
