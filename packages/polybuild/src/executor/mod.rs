//! Wave-based parallel executor (Component F).
//!
//! Drives a [`Graph`] to completion: marks nodes `Ready` as their
//! dependencies finish, hands each to its [`Handler`], and folds the result
//! back into graph state. Concurrency is bounded by a [`tokio::sync::Semaphore`]
//! rather than a dedicated thread pool — `Handler::build` is already async,
//! so the same `tokio::spawn` + bounded-permit pattern the rest of this crate
//! uses for blocking work (see `fs.rs`/`fingerprint.rs`'s `spawn_blocking`
//! calls) applies here without needing a second runtime.

mod checkpoint;
mod events;

use std::{collections::VecDeque, sync::Arc, time::Instant};

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use tokio::sync::{Semaphore, mpsc};
use tracing::{instrument, warn};

pub use checkpoint::{Checkpoint, graph_fingerprint};
pub use events::{Event, EventBus, MessageLevel};

use crate::{
    artifact::ArtifactStore,
    cache::{Cache, CacheEntry},
    fingerprint::{self, Fingerprint, QuickFingerprint},
    graph::{Graph, Interner, Language, NodeState, Target, TargetId, TargetKind},
    handler::{BuildStatus, CancelToken, Handler},
    path::AbsFilePath,
};

/// How the executor reacts to a target build failure.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum FaultPolicy {
    /// Stop scheduling new work once any target fails; in-flight targets
    /// are allowed to finish. Transitive dependents of the failure are
    /// marked `Skipped`.
    #[default]
    FailFast,
    /// Keep scheduling every target whose dependencies succeeded, even
    /// after an unrelated failure elsewhere in the graph.
    KeepGoing,
}

#[derive(Copy, Clone, Debug, Builder)]
#[non_exhaustive]
pub struct ExecutorConfig {
    /// Maximum number of `Handler::build` invocations in flight at once.
    #[builder(default = num_cpus::get())]
    pub workers: usize,
    #[builder(default)]
    pub fault_policy: FaultPolicy,
    /// Per-target build timeout before the executor cancels it.
    #[builder(default = 3600)]
    pub action_timeout_secs: u64,
    /// Grace period after requesting cancellation before the executor gives
    /// up waiting for a handler to notice and escalates (the handler is
    /// expected to fall back to a process-group kill of its own children).
    #[builder(default = 5)]
    pub cancel_grace_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Maps a target's `(language, kind)` to the [`Handler`] that builds it,
/// falling back to a default when no specific pairing is registered.
pub struct HandlerRegistry {
    handlers: std::collections::HashMap<(Language, TargetKind), Arc<dyn Handler>>,
    default: Arc<dyn Handler>,
}

impl HandlerRegistry {
    pub fn new(default: Arc<dyn Handler>) -> Self {
        Self {
            handlers: std::collections::HashMap::new(),
            default,
        }
    }

    pub fn register(&mut self, language: Language, kind: TargetKind, handler: Arc<dyn Handler>) {
        self.handlers.insert((language, kind), handler);
    }

    pub fn resolve(&self, target: &Target) -> Arc<dyn Handler> {
        self.handlers
            .get(&(target.language, target.kind))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Outcome of one complete `Executor::run` invocation.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct BuildSummary {
    pub built: usize,
    pub cached: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub duration_ms: u64,
}

impl BuildSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    /// True when the build was cut short by a cancel signal rather than a
    /// real build failure: at least one target was cancelled, and nothing
    /// failed outright.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled > 0 && self.failed == 0
    }
}

/// Message a worker task reports back to the scheduler loop.
enum WorkerMessage {
    Finished {
        id: TargetId,
        outcome: Result<crate::handler::BuildOutcome>,
        duration_ms: u64,
    },
}

/// Drives one [`Graph`] to completion using a fixed set of collaborators:
/// caches, artifact storage, and a handler per `(language, kind)` pair.
pub struct Executor {
    config: ExecutorConfig,
    cache: Cache,
    artifacts: ArtifactStore,
    handlers: HandlerRegistry,
    events: EventBus,
    cancel: CancelToken,
    workspace_root: String,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        cache: Cache,
        artifacts: ArtifactStore,
        handlers: HandlerRegistry,
        workspace_root: impl Into<String>,
    ) -> Self {
        Self {
            config,
            cache,
            artifacts,
            handlers,
            events: EventBus::new(),
            cancel: CancelToken::new(),
            workspace_root: workspace_root.into(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request the build stop scheduling new work and ask in-flight
    /// handlers to wind down at their next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run the graph to completion, writing a checkpoint after every
    /// completed node when `checkpoint_path` is given.
    #[instrument(skip(self, graph, interner))]
    pub async fn run(
        &self,
        graph: &mut Graph,
        interner: &Interner,
        checkpoint_path: Option<&AbsFilePath>,
    ) -> Result<BuildSummary> {
        let start = Instant::now();
        let total_targets = graph.len();
        self.events.publish(Event::BuildStarted {
            total_targets,
            parallelism: self.config.workers,
            t: events::now_millis(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let (tx, mut rx) = mpsc::channel::<WorkerMessage>(self.config.workers.max(1) * 2);

        let mut summary = BuildSummary::default();
        let mut in_flight: usize = 0;
        let mut failed_fast = false;

        let mut queue: VecDeque<TargetId> = mark_ready(graph, interner).into();
        if !self.cancel.is_cancelled() {
            for id in queue.drain(..).collect::<Vec<_>>() {
                self.spawn_build(graph, id, semaphore.clone(), tx.clone());
                in_flight += 1;
            }
        }

        while in_flight > 0 {
            let Some(message) = rx.recv().await else {
                warn!("executor worker channel closed with workers still in flight");
                break;
            };

            let WorkerMessage::Finished {
                id,
                outcome,
                duration_ms,
            } = message;
            in_flight -= 1;

            let newly_ready = self
                .apply_result(graph, interner, id, outcome, duration_ms, &mut summary)
                .await?;

            if let Some(path) = checkpoint_path {
                self.save_checkpoint(graph, interner, path).await?;
            }

            if self.config.fault_policy == FaultPolicy::FailFast && summary.failed > 0 {
                failed_fast = true;
            }

            // A cancel signal stops new work the same way fail-fast does:
            // in-flight targets finish (and report Cancelled), but nothing
            // newly-ready gets spawned, so no TargetStarted event follows a
            // cancel signal.
            if failed_fast || self.cancel.is_cancelled() {
                continue;
            }

            for ready_id in newly_ready {
                self.spawn_build(graph, ready_id, semaphore.clone(), tx.clone());
                in_flight += 1;
            }
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        self.events.publish(Event::BuildCompleted {
            built: summary.built,
            cached: summary.cached,
            failed: summary.failed,
            duration_ms: summary.duration_ms,
            t: events::now_millis(),
        });
        Ok(summary)
    }

    fn spawn_build(
        &self,
        graph: &mut Graph,
        id: TargetId,
        semaphore: Arc<Semaphore>,
        tx: mpsc::Sender<WorkerMessage>,
    ) {
        let Some(node) = graph.node_mut(id) else {
            return;
        };
        node.state = NodeState::Building;
        let target = node.target.clone();

        let handler = self.handlers.resolve(&target);
        let workspace_root = self.workspace_root.clone();
        let cancel = self.cancel.clone();
        let timeout = std::time::Duration::from_secs(self.config.action_timeout_secs);
        let events = self.events.clone();

        events.publish(Event::TargetStarted {
            id,
            t: events::now_millis(),
        });

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let start = Instant::now();

            let outcome = build_one(handler.as_ref(), &target, &workspace_root, &cancel, timeout).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let _ = tx
                .send(WorkerMessage::Finished {
                    id,
                    outcome,
                    duration_ms,
                })
                .await;
        });
    }

    async fn apply_result(
        &self,
        graph: &mut Graph,
        interner: &Interner,
        id: TargetId,
        outcome: Result<crate::handler::BuildOutcome>,
        duration_ms: u64,
        summary: &mut BuildSummary,
    ) -> Result<Vec<TargetId>> {
        match outcome {
            Ok(outcome) if outcome.status == BuildStatus::Success || outcome.status == BuildStatus::Cached => {
                let output_size = self.persist_success(graph, id, &outcome).await?;

                if outcome.status == BuildStatus::Cached {
                    summary.cached += 1;
                    self.events.publish(Event::TargetCached {
                        id,
                        t: events::now_millis(),
                    });
                } else {
                    summary.built += 1;
                    self.events.publish(Event::TargetCompleted {
                        id,
                        duration_ms,
                        output_size,
                        t: events::now_millis(),
                    });
                }

                if let Some(discovery) = outcome.produced_discoveries {
                    graph.dynamic_extend(discovery)?;
                }

                if let Some(node) = graph.node_mut(id) {
                    node.state = if outcome.status == BuildStatus::Cached {
                        NodeState::Cached
                    } else {
                        NodeState::Success
                    };
                }

                Ok(newly_ready_rdeps(graph, interner, id))
            }
            Ok(outcome) if outcome.status == BuildStatus::Cancelled => {
                self.mark_cancelled(graph, id, summary);
                Ok(Vec::new())
            }
            Ok(outcome) => {
                self.fail(graph, id, &outcome.logs, summary);
                Ok(Vec::new())
            }
            Err(err) => {
                self.fail(graph, id, &format!("{err:#}"), summary);
                Ok(Vec::new())
            }
        }
    }

    /// A target whose handler observed the cancel signal and stopped, as
    /// distinct from an actual build failure: no `TargetFailed` event, and
    /// counted separately so `BuildSummary::is_success` can tell the two
    /// apart.
    fn mark_cancelled(&self, graph: &mut Graph, id: TargetId, summary: &mut BuildSummary) {
        summary.cancelled += 1;
        self.events.publish(Event::TargetCancelled {
            id,
            t: events::now_millis(),
        });
        if let Some(node) = graph.node_mut(id) {
            node.state = NodeState::Failed;
        }
        for skipped in transitive_rdeps(graph, id) {
            if let Some(node) = graph.node_mut(skipped) {
                if node.state == NodeState::Pending || node.state == NodeState::Ready {
                    node.state = NodeState::Skipped;
                    summary.skipped += 1;
                }
            }
        }
    }

    fn fail(&self, graph: &mut Graph, id: TargetId, reason: &str, summary: &mut BuildSummary) {
        summary.failed += 1;
        self.events.publish(Event::TargetFailed {
            id,
            reason: reason.to_string(),
            t: events::now_millis(),
        });
        if let Some(node) = graph.node_mut(id) {
            node.state = NodeState::Failed;
        }
        for skipped in transitive_rdeps(graph, id) {
            if let Some(node) = graph.node_mut(skipped) {
                if node.state == NodeState::Pending || node.state == NodeState::Ready {
                    node.state = NodeState::Skipped;
                    summary.skipped += 1;
                }
            }
        }
    }

    /// Write the target's declared outputs into the artifact store and
    /// record a fresh [`CacheEntry`], so the next build can skip it outright.
    async fn persist_success(
        &self,
        graph: &mut Graph,
        id: TargetId,
        outcome: &crate::handler::BuildOutcome,
    ) -> Result<u64> {
        let Some(node) = graph.node(id) else {
            return Ok(0);
        };
        let target = node.target.clone();

        let mut outputs = outcome.outputs.clone();
        let mut output_size = 0u64;
        for output_path in &target.output_path {
            let abs = AbsFilePath::try_from(std::path::PathBuf::from(output_path))
                .with_context(|| format!("resolve output path {output_path}"))?;
            if let Some(bytes) = crate::fs::read_buffered(&abs).await? {
                output_size += bytes.len() as u64;
                outputs.push(self.artifacts.put(&bytes).await?);
            }
        }

        if let Ok((quick, full)) = target_fingerprints(&target).await {
            self.cache.put_target(CacheEntry {
                target: id,
                quick,
                fingerprint: full,
                outputs,
                last_access: 0,
            });
        }

        if let Some(node) = graph.node_mut(id) {
            node.outputs = target.output_path.clone().into_iter().collect();
        }

        Ok(output_size)
    }

    async fn save_checkpoint(
        &self,
        graph: &Graph,
        interner: &Interner,
        path: &AbsFilePath,
    ) -> Result<()> {
        let mut completed_ids = std::collections::BTreeSet::new();
        let mut in_progress_ids = std::collections::BTreeSet::new();
        for id in graph.topological_order(interner) {
            let Some(node) = graph.node(id) else { continue };
            match node.state {
                NodeState::Success | NodeState::Cached => {
                    completed_ids.insert(id);
                }
                NodeState::Building => {
                    in_progress_ids.insert(id);
                }
                _ => {}
            }
        }

        let checkpoint = Checkpoint {
            completed_ids,
            in_progress_ids,
            graph_fingerprint: graph_fingerprint(graph, interner),
        };
        checkpoint.save(path).await
    }

    /// Load a checkpoint from `path` if present and apply it to `graph`.
    /// Returns `false` (without mutating the graph) if no checkpoint exists.
    pub async fn resume(
        &self,
        graph: &mut Graph,
        interner: &Interner,
        path: &AbsFilePath,
    ) -> Result<bool> {
        let Some(checkpoint) = Checkpoint::load(path).await? else {
            return Ok(false);
        };
        checkpoint.apply(graph, interner)?;
        Ok(true)
    }
}

/// Invoke a handler's full lifecycle (plan, then build) under a timeout,
/// cancelling and giving the handler `cancel_grace_secs` to notice before
/// the call returns a timeout error.
async fn build_one(
    handler: &dyn Handler,
    target: &Target,
    workspace_root: &str,
    cancel: &CancelToken,
    timeout: std::time::Duration,
) -> Result<crate::handler::BuildOutcome> {
    let plan = handler.plan(target, workspace_root).await?;
    match tokio::time::timeout(timeout, handler.build(target, &plan, cancel)).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(color_eyre::eyre::eyre!(
                "target build exceeded {}s timeout",
                timeout.as_secs()
            ))
        }
    }
}

/// Nodes whose dependencies are all `Success`/`Cached`, in depth order.
fn mark_ready(graph: &mut Graph, interner: &Interner) -> Vec<TargetId> {
    let order = graph.topological_order(interner);
    let mut ready = Vec::new();
    for id in order {
        let Some(node) = graph.node(id) else { continue };
        if node.state != NodeState::Pending {
            continue;
        }
        let deps_done = node.resolved_deps.iter().all(|dep| {
            graph
                .node(*dep)
                .map(|d| matches!(d.state, NodeState::Success | NodeState::Cached))
                .unwrap_or(false)
        });
        if deps_done {
            ready.push(id);
        }
    }
    for id in &ready {
        if let Some(node) = graph.node_mut(*id) {
            node.state = NodeState::Ready;
        }
    }
    ready
}

/// Direct dependents of `id` that just became unblocked (all of their own
/// dependencies are now `Success`/`Cached`), in depth order.
fn newly_ready_rdeps(graph: &mut Graph, interner: &Interner, id: TargetId) -> Vec<TargetId> {
    let candidates = graph.rdeps(id);
    let order = graph.topological_order(interner);
    let mut ready: Vec<TargetId> = order
        .into_iter()
        .filter(|cand| candidates.contains(cand))
        .filter(|cand| {
            graph
                .node(*cand)
                .map(|n| n.state == NodeState::Pending)
                .unwrap_or(false)
        })
        .filter(|cand| {
            graph
                .node(*cand)
                .map(|n| {
                    n.resolved_deps.iter().all(|dep| {
                        graph
                            .node(*dep)
                            .map(|d| matches!(d.state, NodeState::Success | NodeState::Cached))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false)
        })
        .collect();
    ready.dedup();
    for ready_id in &ready {
        if let Some(node) = graph.node_mut(*ready_id) {
            node.state = NodeState::Ready;
        }
    }
    ready
}

/// All transitive dependents of `id` (BFS over `rdeps`), for marking
/// `Skipped` after a failure.
fn transitive_rdeps(graph: &Graph, id: TargetId) -> Vec<TargetId> {
    let mut seen = std::collections::BTreeSet::new();
    let mut queue = VecDeque::from([id]);
    let mut out = Vec::new();
    while let Some(current) = queue.pop_front() {
        for dep in graph.rdeps(current) {
            if seen.insert(dep) {
                out.push(dep);
                queue.push_back(dep);
            }
        }
    }
    out
}

/// Combine every source file's fingerprint into one target-level
/// `(quick, full)` pair: `quick` sums sizes and takes the latest mtime
/// (a cheap proxy good enough to reject most unchanged targets outright);
/// `full` hashes the sorted, concatenated per-source digests, mirroring
/// `incremental::action_fingerprint`'s "id plus content" composition.
async fn target_fingerprints(target: &Target) -> Result<(QuickFingerprint, Fingerprint)> {
    let mut size = 0u64;
    let mut mtime_nanos = 0i128;
    let mut digests: Vec<String> = Vec::new();

    for source in &target.sources {
        let abs = AbsFilePath::try_from(std::path::PathBuf::from(source))
            .with_context(|| format!("resolve source path {source}"))?;
        let q = fingerprint::quick(&abs).await?;
        size += q.size;
        mtime_nanos = mtime_nanos.max(q.mtime_nanos);
        let full = fingerprint::full(&abs).await?;
        digests.push(full.to_hex());
    }
    digests.sort();

    let quick = QuickFingerprint {
        size,
        mtime_nanos,
        inode: None,
    };
    let full = fingerprint::of_bytes(digests.join(",").as_bytes());
    Ok((quick, full))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NullHandler;

    fn sample_graph() -> (Graph, Interner, TargetId, TargetId) {
        let interner = Interner::new();
        let mut graph = Graph::new();
        let a = interner.intern("//a");
        let b = interner.intern("//b");
        graph
            .add_target(
                Target::builder()
                    .id(a)
                    .kind(TargetKind::Library)
                    .language(Language::Generic)
                    .output_path(None)
                    .build(),
            )
            .unwrap();
        graph
            .add_target(
                Target::builder()
                    .id(b)
                    .kind(TargetKind::Library)
                    .language(Language::Generic)
                    .declared_deps([a].into_iter().collect())
                    .output_path(None)
                    .build(),
            )
            .unwrap();
        graph.add_edge(b, a).unwrap();
        (graph, interner, a, b)
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new(Arc::new(NullHandler))
    }

    #[tokio::test]
    async fn run_builds_every_node_in_order() {
        let (mut graph, interner, a, b) = sample_graph();
        let (_dir, cache) = Cache::open_in_temp().unwrap();
        let artifacts_dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::open(artifacts_dir.path(), Default::default())
            .await
            .unwrap();

        let executor = Executor::new(
            ExecutorConfig::default(),
            cache,
            artifacts,
            registry(),
            "/workspace",
        );

        let summary = executor.run(&mut graph, &interner, None).await.unwrap();
        assert_eq!(summary.built, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(graph.node(a).unwrap().state, NodeState::Success);
        assert_eq!(graph.node(b).unwrap().state, NodeState::Success);
    }

    #[test]
    fn mark_ready_only_picks_nodes_with_satisfied_deps() {
        let (mut graph, interner, a, b) = sample_graph();
        let ready = mark_ready(&mut graph, &interner);
        assert_eq!(ready, vec![a]);
        assert_ne!(ready, vec![b]);
    }
}
