//! Checkpoint/resume support: after each Node completes, the executor
//! writes a minimal record of build progress so an interrupted build can
//! resume without re-running completed work.

use std::collections::BTreeSet;

use color_eyre::{Result, eyre::Context, eyre::bail};
use serde::{Deserialize, Serialize};

use crate::{
    graph::{Graph, Interner, TargetId},
    path::AbsFilePath,
};

/// Minimal resumable state: which nodes finished, which were mid-flight
/// when the process stopped, and a fingerprint of the graph shape so
/// `resume` can detect a workspace edit invalidating the checkpoint.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub completed_ids: BTreeSet<TargetId>,
    pub in_progress_ids: BTreeSet<TargetId>,
    pub graph_fingerprint: String,
}

impl Checkpoint {
    pub async fn save(&self, path: &AbsFilePath) -> Result<()> {
        let bytes = serde_json::to_vec(self).context("serialize checkpoint")?;
        crate::fs::write(path, bytes)
            .await
            .context("write checkpoint file")
    }

    pub async fn load(path: &AbsFilePath) -> Result<Option<Self>> {
        let Some(text) = crate::fs::read_buffered_utf8(path).await? else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .context("parse checkpoint file")
            .map(Some)
    }

    /// Validate against a freshly-loaded graph and apply it: completed
    /// nodes become `Success` without re-execution; in-progress nodes
    /// become `Pending` so they're re-scheduled. Fails if `graph_fingerprint`
    /// doesn't match — the workspace changed since the checkpoint was
    /// written and resuming against it would be unsound.
    pub fn apply(&self, graph: &mut Graph, interner: &Interner) -> Result<()> {
        let current = graph_fingerprint(graph, interner);
        if current != self.graph_fingerprint {
            bail!(
                "checkpoint graph fingerprint mismatch (workspace changed since checkpoint): expected {}, got {current}",
                self.graph_fingerprint
            );
        }

        for id in &self.completed_ids {
            if let Some(node) = graph.node_mut(*id) {
                node.state = crate::graph::NodeState::Success;
            }
        }
        for id in &self.in_progress_ids {
            if let Some(node) = graph.node_mut(*id) {
                node.state = crate::graph::NodeState::Pending;
            }
        }
        Ok(())
    }
}

/// Deterministic hash of the graph's shape (target ids plus their resolved
/// dependency sets), used to detect a workspace edit that would make a
/// checkpoint's node ids refer to a different build.
pub fn graph_fingerprint(graph: &Graph, interner: &Interner) -> String {
    let mut names: Vec<String> = graph
        .topological_order(interner)
        .into_iter()
        .map(|id| {
            let name = interner.resolve(id).unwrap_or_default();
            let deps = graph
                .node(id)
                .map(|n| {
                    n.resolved_deps
                        .iter()
                        .map(|d| interner.resolve(*d).unwrap_or_default())
                        .collect::<BTreeSet<_>>()
                })
                .unwrap_or_default();
            format!("{name}<-{deps:?}")
        })
        .collect();
    names.sort();

    let mut hasher = blake3::Hasher::new();
    for name in names.drain(..) {
        hasher.update(name.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Language, Target, TargetKind};

    fn build_graph() -> (Graph, Interner, TargetId, TargetId) {
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

    #[test]
    fn fingerprint_stable_for_same_graph() {
        let (g1, i1, ..) = build_graph();
        let (g2, i2, ..) = build_graph();
        assert_eq!(graph_fingerprint(&g1, &i1), graph_fingerprint(&g2, &i2));
    }

    #[tokio::test]
    async fn round_trips_through_json() {
        let (graph, interner, a, _b) = build_graph();
        let checkpoint = Checkpoint {
            completed_ids: [a].into_iter().collect(),
            in_progress_ids: BTreeSet::new(),
            graph_fingerprint: graph_fingerprint(&graph, &interner),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = crate::path::AbsFilePath::try_from(dir.path().join("checkpoint.json")).unwrap();
        checkpoint.save(&path).await.unwrap();
        let loaded = Checkpoint::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn apply_rejects_mismatched_fingerprint() {
        let (mut graph, interner, ..) = build_graph();
        let checkpoint = Checkpoint {
            completed_ids: BTreeSet::new(),
            in_progress_ids: BTreeSet::new(),
            graph_fingerprint: "not-the-real-fingerprint".to_string(),
        };
        assert!(checkpoint.apply(&mut graph, &interner).is_err());
    }
}
