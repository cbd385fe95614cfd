//! The dependency graph and its queries.
//!
//! Nodes live in an arena (a vector of [`BuildNode`]) indexed by a numeric
//! [`NodeHandle`]; a map resolves [`TargetId`] to handle. Back edges
//! (`dependent_ids`) are recomputed when the graph is sealed, never stored
//! as pointer cycles.
//!
//! Two validation modes:
//!
//! - [`Validation::Immediate`]: every edge addition runs a reachability
//!   check and refuses edges that would create a cycle.
//! - [`Validation::Deferred`] (the default for batch loading): edges are
//!   added unchecked and the topological sort at seal time is the cycle
//!   check. This is O(V+E) total instead of O(V·(V+E)) across a large load.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use derive_more::Display;
use itertools::Itertools as _;
use tracing::{debug, instrument, trace};

use crate::error::{EngineError, EngineResult};
use crate::hash::stable_hash;
use crate::target::{Target, TargetId};

/// Index of a node in the graph arena.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("#{_0}")]
pub struct NodeHandle(pub u32);

impl NodeHandle {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Build-time status of a node. Terminal states are absorbing.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
#[repr(u8)]
pub enum NodeStatus {
    Pending = 0,
    Building = 1,
    Success = 2,
    Cached = 3,
    Failed = 4,
}

impl NodeStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeStatus::Pending,
            1 => NodeStatus::Building,
            2 => NodeStatus::Success,
            3 => NodeStatus::Cached,
            _ => NodeStatus::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Cached | NodeStatus::Failed
        )
    }
}

/// A target plus its mutable build-time state.
///
/// The graph is immutable once sealed; the atomics here are the only state
/// mutated during a build, so nodes can be shared across executor tasks
/// without locks.
#[derive(Debug)]
pub struct BuildNode {
    target: Target,
    /// Forward edges: what this node depends on.
    dependency_ids: BTreeSet<TargetId>,
    /// Back edges: who depends on this node. Filled at seal time.
    dependent_ids: BTreeSet<TargetId>,
    /// Unfinished dependencies remaining; a node is ready at zero.
    pending_deps: AtomicUsize,
    status: AtomicU8,
    retry_count: AtomicU32,
    /// Memoized depth; -1 means uncomputed.
    cached_depth: AtomicI64,
}

impl BuildNode {
    fn new(target: Target) -> Self {
        let dependency_ids = target.deps.clone();
        Self {
            target,
            dependency_ids,
            dependent_ids: BTreeSet::new(),
            pending_deps: AtomicUsize::new(0),
            status: AtomicU8::new(NodeStatus::Pending as u8),
            retry_count: AtomicU32::new(0),
            cached_depth: AtomicI64::new(-1),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn id(&self) -> &TargetId {
        &self.target.id
    }

    pub fn dependency_ids(&self) -> &BTreeSet<TargetId> {
        &self.dependency_ids
    }

    pub fn dependent_ids(&self) -> &BTreeSet<TargetId> {
        &self.dependent_ids
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: NodeStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Transition only if the current status matches; returns whether the
    /// transition happened. Keeps terminal states absorbing under races.
    pub fn transition(&self, from: NodeStatus, to: NodeStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn pending_deps(&self) -> usize {
        self.pending_deps.load(Ordering::SeqCst)
    }

    pub fn reset_pending_deps(&self) {
        self.pending_deps
            .store(self.dependency_ids.len(), Ordering::SeqCst);
    }

    /// Decrement the pending counter; returns the new value.
    pub fn complete_dependency(&self) -> usize {
        self.pending_deps.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Record how many retries this node's build consumed.
    pub fn record_retries(&self, retries: u32) {
        self.retry_count.store(retries, Ordering::SeqCst);
    }
}

/// Cycle-validation strategy for edge additions.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Validation {
    /// Re-run reachability on every edge addition.
    Immediate,
    /// Validate once, via topological sort, when the graph is sealed.
    #[default]
    Deferred,
}

/// The build graph: an arena of nodes plus the id→handle index.
#[derive(Debug)]
pub struct BuildGraph {
    nodes: Vec<BuildNode>,
    index: BTreeMap<TargetId, NodeHandle>,
    validation: Validation,
    sealed: bool,
}

impl BuildGraph {
    pub fn new(validation: Validation) -> Self {
        Self {
            nodes: Vec::new(),
            index: BTreeMap::new(),
            validation,
            sealed: false,
        }
    }

    /// Build and seal a graph from a validated workspace.
    #[instrument(skip(targets))]
    pub fn from_targets(
        targets: impl IntoIterator<Item = Target>,
        validation: Validation,
    ) -> EngineResult<Self> {
        let mut graph = Self::new(validation);
        let targets: Vec<Target> = targets.into_iter().collect();
        for target in &targets {
            graph.insert(target.clone())?;
        }
        for target in &targets {
            for dep in &target.deps {
                graph.add_edge(&target.id, dep)?;
            }
        }
        graph.seal()?;
        Ok(graph)
    }

    /// Insert a target. Duplicate ids are a configuration error.
    pub fn insert(&mut self, target: Target) -> EngineResult<NodeHandle> {
        if self.index.contains_key(&target.id) {
            return Err(EngineError::config(format!(
                "duplicate target {}",
                target.id
            ))
            .suggest("rename one of the colliding targets"));
        }
        let handle = NodeHandle(self.nodes.len() as u32);
        self.index.insert(target.id.clone(), handle);
        // Edges recorded in the target are added by the caller; start from
        // an explicit empty set so add_edge is the single source of truth.
        let mut node = BuildNode::new(target);
        node.dependency_ids.clear();
        self.nodes.push(node);
        self.sealed = false;
        trace!(%handle, "inserted target");
        Ok(handle)
    }

    /// Add the edge `from → to` ("`from` depends on `to`").
    pub fn add_edge(&mut self, from: &TargetId, to: &TargetId) -> EngineResult<()> {
        let from_handle = self.handle(from)?;
        let to_handle = self.handle(to)?;
        if self.validation == Validation::Immediate && self.reaches(to_handle, from_handle) {
            let mut trace = self.path_between(to_handle, from_handle);
            trace.push(self.nodes[to_handle.index()].id().clone());
            return Err(cycle_error(&trace));
        }
        let to_id = self.nodes[to_handle.index()].id().clone();
        let node = &mut self.nodes[from_handle.index()];
        if node.dependency_ids.insert(to_id) {
            node.cached_depth.store(-1, Ordering::SeqCst);
            self.invalidate_depths_above(from_handle);
        }
        self.sealed = false;
        Ok(())
    }

    /// Recompute back edges and, in deferred mode, run the cycle check.
    #[instrument(skip(self))]
    pub fn seal(&mut self) -> EngineResult<()> {
        let edges: Vec<(TargetId, TargetId)> = self
            .nodes
            .iter()
            .flat_map(|node| {
                let from = node.id().clone();
                node.dependency_ids
                    .iter()
                    .map(move |to| (from.clone(), to.clone()))
            })
            .collect();
        for node in &mut self.nodes {
            node.dependent_ids.clear();
        }
        for (from, to) in edges {
            let to_handle = self.handle(&to)?;
            self.nodes[to_handle.index()].dependent_ids.insert(from);
        }
        // The sort doubles as the deferred cycle check.
        self.topo_order()?;
        self.sealed = true;
        debug!(nodes = self.nodes.len(), "sealed graph");
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn handle(&self, id: &TargetId) -> EngineResult<NodeHandle> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| EngineError::graph(format!("unknown target {id}")))
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, handle: NodeHandle) -> &BuildNode {
        &self.nodes[handle.index()]
    }

    pub fn node_by_id(&self, id: &TargetId) -> EngineResult<&BuildNode> {
        Ok(self.node(self.handle(id)?))
    }

    /// Handles in deterministic (id-lexicographic) order.
    pub fn handles(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.index.values().copied()
    }

    /// Topological order: every dependency precedes its dependents. Ties
    /// broken by id lexicographic order so builds are reproducible.
    ///
    /// Kahn's algorithm with an ordered ready set.
    #[instrument(skip(self))]
    pub fn topo_order(&self) -> EngineResult<Vec<NodeHandle>> {
        let mut in_degree: BTreeMap<NodeHandle, usize> = BTreeMap::new();
        for handle in self.handles() {
            in_degree.insert(handle, self.node(handle).dependency_ids.len());
        }

        // BTreeSet keyed by id keeps extraction deterministic.
        let mut ready: BTreeSet<(TargetId, NodeHandle)> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&handle, _)| (self.node(handle).id().clone(), handle))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(entry) = ready.iter().next().cloned() {
            ready.remove(&entry);
            let (_, handle) = entry;
            order.push(handle);
            for dependent in &self.node(handle).dependent_ids {
                let dep_handle = self.handle(dependent)?;
                let degree = in_degree
                    .get_mut(&dep_handle)
                    .ok_or_else(|| EngineError::internal("in-degree map out of sync"))?;
                *degree -= 1;
                if *degree == 0 {
                    ready.insert((dependent.clone(), dep_handle));
                }
            }
        }

        if order.len() != self.nodes.len() {
            let trace = self
                .find_cycle()
                .ok_or_else(|| EngineError::internal("sort incomplete but no cycle found"))?;
            return Err(cycle_error(&trace));
        }
        Ok(order)
    }

    /// Find one directed cycle, as `[a, b, c, a]`.
    pub fn find_cycle(&self) -> Option<Vec<TargetId>> {
        #[derive(Copy, Clone, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let mut marks = vec![Mark::White; self.nodes.len()];
        let mut stack: Vec<NodeHandle> = Vec::new();

        // Iterative DFS over dependency edges; a grey-on-grey hit is a cycle.
        for start in self.handles() {
            if marks[start.index()] != Mark::White {
                continue;
            }
            let mut work: Vec<(NodeHandle, bool)> = vec![(start, false)];
            while let Some((handle, children_done)) = work.pop() {
                if children_done {
                    marks[handle.index()] = Mark::Black;
                    stack.pop();
                    continue;
                }
                if marks[handle.index()] == Mark::Black {
                    continue;
                }
                marks[handle.index()] = Mark::Grey;
                stack.push(handle);
                work.push((handle, true));
                for dep in &self.node(handle).dependency_ids {
                    let dep_handle = match self.index.get(dep) {
                        Some(&h) => h,
                        None => continue,
                    };
                    match marks[dep_handle.index()] {
                        Mark::White => work.push((dep_handle, false)),
                        Mark::Grey => {
                            // Close the loop from the stack.
                            let from = stack
                                .iter()
                                .position(|&h| h == dep_handle)
                                .unwrap_or(0);
                            let mut trace: Vec<TargetId> = stack[from..]
                                .iter()
                                .map(|&h| self.node(h).id().clone())
                                .collect();
                            trace.push(self.node(dep_handle).id().clone());
                            return Some(trace);
                        }
                        Mark::Black => {}
                    }
                }
            }
        }
        None
    }

    /// Depth of a node: 0 for leaves, else `1 + max(depth of deps)`.
    /// Memoized on the node; mutations invalidate the cache and cascade
    /// the invalidation up through dependents.
    pub fn depth(&self, handle: NodeHandle) -> EngineResult<u64> {
        // Iterative post-order so thousand-deep chains don't recurse.
        let mut result: Option<u64> = None;
        let mut work: Vec<(NodeHandle, bool)> = vec![(handle, false)];
        while let Some((current, children_done)) = work.pop() {
            let cached = self.node(current).cached_depth.load(Ordering::SeqCst);
            if !children_done && cached >= 0 {
                result = Some(cached as u64);
                continue;
            }
            if children_done {
                let mut depth = 0u64;
                for dep in &self.node(current).dependency_ids {
                    let dep_handle = self.handle(dep)?;
                    let dep_depth = self.node(dep_handle).cached_depth.load(Ordering::SeqCst);
                    if dep_depth < 0 {
                        return Err(EngineError::internal("dependency depth not computed"));
                    }
                    depth = depth.max(dep_depth as u64 + 1);
                }
                self.node(current)
                    .cached_depth
                    .store(depth as i64, Ordering::SeqCst);
                result = Some(depth);
            } else {
                work.push((current, true));
                for dep in &self.node(current).dependency_ids {
                    let dep_handle = self.handle(dep)?;
                    if self.node(dep_handle).cached_depth.load(Ordering::SeqCst) < 0 {
                        work.push((dep_handle, false));
                    }
                }
            }
        }
        result.ok_or_else(|| EngineError::internal("depth computation produced no result"))
    }

    /// Stable hash of the graph structure: sorted ids and their sorted
    /// dependency ids. Used for checkpoint staleness.
    pub fn structural_hash(&self) -> u64 {
        let shape: Vec<(&str, Vec<&str>)> = self
            .index
            .iter()
            .map(|(id, &handle)| {
                let deps: Vec<&str> = self
                    .node(handle)
                    .dependency_ids
                    .iter()
                    .map(TargetId::as_str)
                    .collect();
                (id.as_str(), deps)
            })
            .collect();
        stable_hash(shape)
    }

    /// Whether `to` is reachable from `from` over dependency edges.
    fn reaches(&self, from: NodeHandle, to: NodeHandle) -> bool {
        if from == to {
            return true;
        }
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([from]);
        seen[from.index()] = true;
        while let Some(current) = queue.pop_front() {
            for dep in &self.node(current).dependency_ids {
                let Some(&dep_handle) = self.index.get(dep) else {
                    continue;
                };
                if dep_handle == to {
                    return true;
                }
                if !seen[dep_handle.index()] {
                    seen[dep_handle.index()] = true;
                    queue.push_back(dep_handle);
                }
            }
        }
        false
    }

    /// One path `from → … → to` over dependency edges, for cycle traces.
    fn path_between(&self, from: NodeHandle, to: NodeHandle) -> Vec<TargetId> {
        let mut parent: BTreeMap<NodeHandle, NodeHandle> = BTreeMap::new();
        let mut queue = VecDeque::from([from]);
        let mut found = from == to;
        while let Some(current) = queue.pop_front() {
            if found {
                break;
            }
            for dep in &self.node(current).dependency_ids {
                let Some(&dep_handle) = self.index.get(dep) else {
                    continue;
                };
                if dep_handle != from && !parent.contains_key(&dep_handle) {
                    parent.insert(dep_handle, current);
                    if dep_handle == to {
                        found = true;
                        break;
                    }
                    queue.push_back(dep_handle);
                }
            }
        }
        let mut path = vec![self.node(to).id().clone()];
        let mut current = to;
        while current != from {
            let Some(&prev) = parent.get(&current) else {
                break;
            };
            path.push(self.node(prev).id().clone());
            current = prev;
        }
        path.reverse();
        path
    }

    /// Clear memoized depths of every node that can reach `handle`.
    fn invalidate_depths_above(&self, handle: NodeHandle) {
        let mut queue = VecDeque::from([handle]);
        let mut seen = vec![false; self.nodes.len()];
        seen[handle.index()] = true;
        while let Some(current) = queue.pop_front() {
            self.node(current).cached_depth.store(-1, Ordering::SeqCst);
            for dependent in &self.node(current).dependent_ids {
                let Some(&dep_handle) = self.index.get(dependent) else {
                    continue;
                };
                if !seen[dep_handle.index()] {
                    seen[dep_handle.index()] = true;
                    queue.push_back(dep_handle);
                }
            }
        }
    }

    /// Render the graph as deterministic DOT, for `foreman graph`.
    pub fn to_dot(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::from("digraph build {\n");
        for (id, &handle) in &self.index {
            let _ = writeln!(out, "  \"{id}\";");
            for dep in &self.node(handle).dependency_ids {
                let _ = writeln!(out, "  \"{id}\" -> \"{dep}\";");
            }
        }
        out.push_str("}\n");
        out
    }
}

fn cycle_error(trace: &[TargetId]) -> EngineError {
    let rendered = trace.iter().map(TargetId::as_str).join(" → ");
    EngineError::graph(format!("dependency cycle: {rendered}"))
        .suggest("break the cycle by removing one of the listed edges")
}
