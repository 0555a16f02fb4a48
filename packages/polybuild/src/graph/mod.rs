//! Target dependency graph (Component C): nodes, edges, topological/wave
//! ordering, cycle detection, and dynamic extension.
//!
//! The graph is an arena (`Vec<Node>`) indexed by [`NodeIndex`], with a
//! `TargetId -> NodeIndex` `dashmap` index layered on top for O(1) lookup by
//! name. There is no process-wide singleton: every caller constructs and owns
//! its own [`Graph`] plus the [`Interner`] that hands out [`TargetId`]s.

mod target;

use std::collections::{BTreeSet, VecDeque};

use color_eyre::{Result, eyre::bail};
use dashmap::DashMap;
use derive_more::{Debug, Display};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

pub use target::{Language, Target, TargetKind};

use crate::fingerprint::Fingerprint;

/// Interns [`TargetId`] strings to small integers.
///
/// Not a `static`: every [`Graph`] owns one. Two graphs never share ids.
#[derive(Debug, Default)]
pub struct Interner {
    by_name: DashMap<String, u32>,
    by_id: DashMap<u32, String>,
    next: std::sync::atomic::AtomicU32,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a target name, returning its stable [`TargetId`].
    pub fn intern(&self, name: impl AsRef<str>) -> TargetId {
        let name = name.as_ref();
        if let Some(id) = self.by_name.get(name) {
            return TargetId(*id);
        }
        let id = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.by_name.insert(name.to_owned(), id);
        self.by_id.insert(id, name.to_owned());
        TargetId(id)
    }

    /// Resolve a [`TargetId`] back to its fully qualified name.
    pub fn resolve(&self, id: TargetId) -> Option<String> {
        self.by_id.get(&id.0).map(|r| r.clone())
    }

    /// Look up an already-interned name without interning it, for callers
    /// (like the query language) that must distinguish "unknown target"
    /// from "newly created".
    pub fn lookup(&self, name: &str) -> Option<TargetId> {
        self.by_name.get(name).map(|id| TargetId(*id))
    }
}

/// A fully qualified target name, e.g. `//path/to/pkg:name`.
///
/// Interned; comparisons and map keys use the intern index rather than the
/// string.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[display("target#{_0}")]
pub struct TargetId(u32);

impl std::str::FromStr for TargetId {
    type Err = std::num::ParseIntError;

    /// Inverse of the `target#{n}` `Display` impl, so a `TargetId` can
    /// round-trip through its sqlite-index text form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("target#").unwrap_or(s).parse().map(TargetId)
    }
}

/// Index of a [`Node`] in the graph's arena. Not stable across graph
/// rebuilds, only within a single [`Graph`] instance's lifetime.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("node#{_0}")]
pub struct NodeIndex(u32);

impl NodeIndex {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Build state of a [`Node`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum NodeState {
    Pending,
    Ready,
    Building,
    Success,
    Failed,
    Cached,
    Skipped,
}

/// Mutable graph entry for a [`Target`].
#[derive(Clone, Debug)]
pub struct Node {
    pub target: Target,
    pub state: NodeState,
    pub depth: u32,
    pub resolved_deps: BTreeSet<TargetId>,
    pub last_fingerprint: Option<Fingerprint>,
    pub outputs: Vec<String>,
}

impl Node {
    fn new(target: Target) -> Self {
        let resolved_deps = target.declared_deps.clone();
        Self {
            target,
            state: NodeState::Pending,
            depth: 0,
            resolved_deps,
            last_fingerprint: None,
            outputs: Vec::new(),
        }
    }
}

/// A batch of newly discovered targets and edges produced by executing a
/// target (e.g. schema compilation emitting new compile units).
#[derive(Clone, Debug)]
pub struct Discovery {
    pub origin: TargetId,
    pub created: Vec<Target>,
    pub input_fingerprints: Vec<Fingerprint>,
    pub t: i64,
}

/// Graph-specific failure. Converted into [`crate::error::Error`] at the
/// boundary where a caller needs the structured taxonomy; within the graph
/// module itself, `color_eyre` propagation via `?`/`bail!` is enough.
#[derive(Debug, Display)]
pub enum GraphError {
    #[display("target already exists: {_0}")]
    DuplicateTarget(TargetId),
    #[display("unknown target: {_0}")]
    UnknownTarget(TargetId),
    #[display("adding this edge would create a cycle: {_0:?}")]
    CycleDetected(Vec<TargetId>),
}

impl std::error::Error for GraphError {}

/// The target dependency graph. A DAG at all times observable outside a
/// mutating method.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    index: DashMap<TargetId, NodeIndex>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: TargetId) -> Option<&Node> {
        self.index.get(&id).map(|idx| &self.nodes[idx.index()])
    }

    pub fn node_mut(&mut self, id: TargetId) -> Option<&mut Node> {
        let idx = self.index.get(&id)?.index();
        self.nodes.get_mut(idx)
    }

    /// Every target id currently in the graph, in arena order (not sorted).
    pub fn all_ids(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.nodes.iter().map(|n| n.target.id)
    }

    /// Add a target, failing with [`GraphError::DuplicateTarget`] if its id
    /// already exists.
    #[instrument(skip(self, target))]
    pub fn add_target(&mut self, target: Target) -> Result<NodeIndex> {
        let id = target.id;
        if self.index.contains_key(&id) {
            bail!(GraphError::DuplicateTarget(id));
        }
        let node_index = NodeIndex(self.nodes.len() as u32);
        self.nodes.push(Node::new(target));
        self.index.insert(id, node_index);
        Ok(node_index)
    }

    /// Add an edge `from -> to` (`from` depends on `to`).
    ///
    /// Checks are performed before mutation via a speculative DFS: if adding
    /// the edge would create a cycle, the graph is left unchanged and
    /// [`GraphError::CycleDetected`] is returned with the cycle path.
    #[instrument(skip(self))]
    pub fn add_edge(&mut self, from: TargetId, to: TargetId) -> Result<()> {
        let from_idx = self
            .index
            .get(&from)
            .map(|r| *r)
            .ok_or(GraphError::UnknownTarget(from))?;
        let to_idx = self
            .index
            .get(&to)
            .map(|r| *r)
            .ok_or(GraphError::UnknownTarget(to))?;

        if let Some(cycle) = self.would_cycle(from_idx, to_idx) {
            bail!(GraphError::CycleDetected(cycle));
        }

        self.nodes[from_idx.index()].resolved_deps.insert(to);
        self.recompute_depths_from(from_idx);
        trace!(%from, %to, "added edge");
        Ok(())
    }

    /// Atomically add a batch of newly discovered targets and edges.
    /// Discovered targets may only depend on nodes already present or
    /// introduced in the same batch. Fails with [`GraphError::CycleDetected`]
    /// without mutation.
    #[instrument(skip(self, discovery))]
    pub fn dynamic_extend(&mut self, discovery: Discovery) -> Result<Vec<TargetId>> {
        let snapshot_len = self.nodes.len();
        let mut new_ids = Vec::new();

        let result = (|| -> Result<Vec<TargetId>> {
            for target in discovery.created {
                let id = target.id;
                let declared = target.declared_deps.clone();
                self.add_target(target)?;
                new_ids.push(id);
                for dep in declared {
                    self.add_edge(id, dep)?;
                }
            }
            Ok(new_ids.clone())
        })();

        match result {
            Ok(ids) => Ok(ids),
            Err(err) => {
                self.nodes.truncate(snapshot_len);
                for id in &new_ids {
                    self.index.remove(id);
                }
                Err(err)
            }
        }
    }

    /// Stable topological order, consistent with depth, tie-broken
    /// lexicographically by resolved target name via the interner.
    pub fn topological_order(&self, interner: &Interner) -> Vec<TargetId> {
        let mut order = (0..self.nodes.len())
            .map(|i| self.nodes[i].target.id)
            .collect::<Vec<_>>();
        order.sort_by(|a, b| {
            let depth_a = self.node(*a).map(|n| n.depth).unwrap_or_default();
            let depth_b = self.node(*b).map(|n| n.depth).unwrap_or_default();
            depth_a.cmp(&depth_b).then_with(|| {
                let name_a = interner.resolve(*a).unwrap_or_default();
                let name_b = interner.resolve(*b).unwrap_or_default();
                name_a.cmp(&name_b)
            })
        });
        order
    }

    /// Partition the topological order into waves: all nodes in wave k have
    /// all dependencies in waves < k.
    pub fn waves(&self, interner: &Interner) -> Vec<Vec<TargetId>> {
        let order = self.topological_order(interner);
        let mut waves: Vec<Vec<TargetId>> = Vec::new();
        let mut wave_of = std::collections::HashMap::new();

        for id in order {
            let node = self.node(id).expect("target from topological_order exists");
            let wave = node
                .resolved_deps
                .iter()
                .filter_map(|dep| wave_of.get(dep).copied())
                .max()
                .map(|w: usize| w + 1)
                .unwrap_or(0);
            wave_of.insert(id, wave);
            if waves.len() <= wave {
                waves.push(Vec::new());
            }
            waves[wave].push(id);
        }

        waves
    }

    /// Reverse dependencies: targets that directly depend on `id`.
    pub fn rdeps(&self, id: TargetId) -> Vec<TargetId> {
        self.nodes
            .iter()
            .filter(|n| n.resolved_deps.contains(&id))
            .map(|n| n.target.id)
            .collect()
    }

    /// Breadth-first shortest path between two targets, if one exists.
    pub fn shortest(&self, from: TargetId, to: TargetId) -> Option<Vec<TargetId>> {
        if from == to {
            return Some(vec![from]);
        }
        let mut queue = VecDeque::from([from]);
        let mut came_from = std::collections::HashMap::new();
        came_from.insert(from, from);

        while let Some(current) = queue.pop_front() {
            let Some(node) = self.node(current) else {
                continue;
            };
            for dep in &node.resolved_deps {
                if came_from.contains_key(dep) {
                    continue;
                }
                came_from.insert(*dep, current);
                if *dep == to {
                    let mut path = vec![to];
                    let mut cursor = current;
                    while cursor != from {
                        path.push(cursor);
                        cursor = came_from[&cursor];
                    }
                    path.push(from);
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(*dep);
            }
        }
        None
    }

    /// All simple paths between two targets (used by the `allpaths` query).
    pub fn allpaths(&self, from: TargetId, to: TargetId) -> Vec<Vec<TargetId>> {
        let mut results = Vec::new();
        let mut path = vec![from];
        let mut visited = std::collections::HashSet::from([from]);
        self.allpaths_dfs(from, to, &mut path, &mut visited, &mut results);
        results
    }

    fn allpaths_dfs(
        &self,
        current: TargetId,
        to: TargetId,
        path: &mut Vec<TargetId>,
        visited: &mut std::collections::HashSet<TargetId>,
        results: &mut Vec<Vec<TargetId>>,
    ) {
        if current == to {
            results.push(path.clone());
            return;
        }
        let Some(node) = self.node(current) else {
            return;
        };
        for dep in node.resolved_deps.clone() {
            if visited.insert(dep) {
                path.push(dep);
                self.allpaths_dfs(dep, to, path, visited, results);
                path.pop();
                visited.remove(&dep);
            }
        }
    }

    /// Whether a path exists at all between two targets (used by `somepath`).
    pub fn somepath(&self, from: TargetId, to: TargetId) -> bool {
        self.shortest(from, to).is_some()
    }

    /// Recompute `depth(u) = max(depth(v)+1 for v in deps(u))` starting at
    /// `from` and walking reverse-dependents, since an edge inserted above an
    /// existing node can raise the depth of everything depending on it.
    fn recompute_depths_from(&mut self, from: NodeIndex) {
        let mut queue = VecDeque::from([from]);
        while let Some(idx) = queue.pop_front() {
            let deps = self.nodes[idx.index()].resolved_deps.clone();
            let new_depth = deps
                .iter()
                .filter_map(|dep| self.index.get(dep).map(|r| self.nodes[r.index()].depth))
                .max()
                .map(|d| d + 1)
                .unwrap_or(0);

            if self.nodes[idx.index()].depth != new_depth {
                self.nodes[idx.index()].depth = new_depth;
                let id = self.nodes[idx.index()].target.id;
                for rdep in self.rdeps(id) {
                    if let Some(r) = self.index.get(&rdep) {
                        queue.push_back(*r);
                    }
                }
            }
        }
    }

    /// Speculative DFS: would adding `from -> to` create a cycle? If so,
    /// returns the cycle path (three-color marker: white/gray/black,
    /// represented here as not-visited/in-progress/done).
    fn would_cycle(&self, from: NodeIndex, to: NodeIndex) -> Option<Vec<TargetId>> {
        if from == to {
            let id = self.nodes[from.index()].target.id;
            return Some(vec![id]);
        }

        #[derive(Copy, Clone, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color = vec![Color::White; self.nodes.len()];
        let mut path = Vec::new();

        fn visit(
            graph: &Graph,
            idx: NodeIndex,
            target: NodeIndex,
            color: &mut [Color],
            path: &mut Vec<TargetId>,
        ) -> bool {
            color[idx.index()] = Color::Gray;
            path.push(graph.nodes[idx.index()].target.id);

            if idx == target {
                return true;
            }

            for dep in graph.nodes[idx.index()].resolved_deps.clone() {
                let Some(dep_idx) = graph.index.get(&dep).map(|r| *r) else {
                    continue;
                };
                if color[dep_idx.index()] == Color::Gray {
                    path.push(graph.nodes[dep_idx.index()].target.id);
                    return true;
                }
                if color[dep_idx.index()] == Color::White
                    && visit(graph, dep_idx, target, color, path)
                {
                    return true;
                }
            }

            color[idx.index()] = Color::Black;
            path.pop();
            false
        }

        // The new edge is from -> to; a cycle exists iff `to` can already
        // reach `from`.
        if visit(self, to, from, &mut color, &mut path) {
            Some(path)
        } else {
            None
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::target::{Language, TargetKind};

    fn target(interner: &Interner, name: &str, deps: &[TargetId]) -> Target {
        Target {
            id: interner.intern(name),
            kind: TargetKind::Library,
            language: Language::Generic,
            sources: Vec::new(),
            declared_deps: deps.iter().copied().collect(),
            flags: Vec::new(),
            env: Default::default(),
            output_path: None,
            handler_config: Default::default(),
        }
    }

    #[test]
    fn topological_order_respects_depth() {
        let interner = Interner::new();
        let mut graph = Graph::new();
        let a = interner.intern("//a");
        let b = interner.intern("//b");
        graph.add_target(target(&interner, "//a", &[])).unwrap();
        graph.add_target(target(&interner, "//b", &[a])).unwrap();
        graph.add_edge(b, a).unwrap();

        let order = graph.topological_order(&interner);
        assert_eq!(order, vec![a, b]);
    }

    #[test]
    fn cycle_detection_rejects_and_preserves_graph() {
        let interner = Interner::new();
        let mut graph = Graph::new();
        let a = interner.intern("//a");
        let b = interner.intern("//b");
        graph.add_target(target(&interner, "//a", &[])).unwrap();
        graph.add_target(target(&interner, "//b", &[a])).unwrap();
        graph.add_edge(b, a).unwrap();

        let before = graph.node(a).unwrap().resolved_deps.clone();
        let err = graph.add_edge(a, b);
        assert!(err.is_err());
        assert_eq!(graph.node(a).unwrap().resolved_deps, before);
    }

    #[test]
    fn waves_partition_topological_order() {
        let interner = Interner::new();
        let mut graph = Graph::new();
        let a = interner.intern("//a");
        let b = interner.intern("//b");
        let c = interner.intern("//c");
        graph.add_target(target(&interner, "//a", &[])).unwrap();
        graph.add_target(target(&interner, "//b", &[])).unwrap();
        graph.add_target(target(&interner, "//c", &[a, b])).unwrap();
        graph.add_edge(c, a).unwrap();
        graph.add_edge(c, b).unwrap();

        let waves = graph.waves(&interner);
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].len(), 2);
        assert_eq!(waves[1], vec![c]);
    }

    #[test]
    fn duplicate_target_rejected() {
        let interner = Interner::new();
        let mut graph = Graph::new();
        graph.add_target(target(&interner, "//a", &[])).unwrap();
        assert!(graph.add_target(target(&interner, "//a", &[])).is_err());
    }
}
