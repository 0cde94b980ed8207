// Resource graph and cycle detection.
//
// Generalizes the call graph to every chunk kind: an edge exists
// wherever one chunk structurally references another, tagged with a
// semantic kind. Tarjan's algorithm partitions the graph into strongly
// connected components in one O(V+E) pass; components that loop are
// classified by shape and edge-kind mix. Classification is purely
// informative: cycles are never blocked or repaired here.

use crate::call_graph::CallGraph;
use crate::chunk::ChunkKind;
use indexmap::IndexMap;
use log::debug;
use std::collections::BTreeSet;
use std::fmt;

/// Semantic kind of a cross-chunk reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeKind {
    /// Code flow: calls, guard checks.
    Behavioral,
    /// Placement or definition: table lookups, slot references.
    Structural,
    /// Render pipeline: draw-group membership, sprite references.
    Visual,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EdgeKind::Behavioral => write!(f, "behavioral"),
            EdgeKind::Structural => write!(f, "structural"),
            EdgeKind::Visual => write!(f, "visual"),
        }
    }
}

/// A node: any chunk, identified by kind and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub kind: ChunkKind,
    pub id: u16,
}

impl ResourceId {
    pub fn routine(id: u16) -> ResourceId {
        ResourceId {
            kind: ChunkKind::BehaviorRoutine,
            id,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEdge {
    pub from: ResourceId,
    pub to: ResourceId,
    pub kind: EdgeKind,
}

/// Shape of a detected cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleShape {
    /// One node with a self-loop.
    SelfReferential,
    /// Two mutually referencing nodes.
    Mutual,
    /// Three or more nodes.
    Complex,
}

impl fmt::Display for CycleShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CycleShape::SelfReferential => write!(f, "self-referential"),
            CycleShape::Mutual => write!(f, "mutual"),
            CycleShape::Complex => write!(f, "complex"),
        }
    }
}

/// One strongly connected component that actually loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Member nodes, sorted for reproducible output.
    pub members: Vec<ResourceId>,
    /// Union of the kinds of edges spanning the members.
    pub edge_kinds: BTreeSet<EdgeKind>,
    pub shape: CycleShape,
    /// True when some member has an edge leaving the cycle.
    pub has_exit: bool,
}

impl Cycle {
    /// All-behavioral cycles are expected (recursion, state machines,
    /// callback loops); anything with a structural or visual edge in
    /// the loop is anomalous and surfaced at elevated severity.
    pub fn is_anomalous(&self) -> bool {
        self.edge_kinds
            .iter()
            .any(|k| *k != EdgeKind::Behavioral)
    }

    pub fn contains(&self, node: ResourceId) -> bool {
        self.members.binary_search(&node).is_ok()
    }

    /// A pure behavioral cycle with no branch out: every run that
    /// enters it stays in it. Static infinite-loop candidate; for
    /// precision intersect with the tracer's unbounded-loop findings.
    pub fn is_infinite_loop_candidate(&self) -> bool {
        !self.has_exit && !self.is_anomalous()
    }
}

/// All cycles found in one detection pass, with the query surface over
/// them. Derived view: stale as soon as any edit commits.
#[derive(Debug, Clone)]
pub struct CycleSet {
    pub cycles: Vec<Cycle>,
}

impl CycleSet {
    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    pub fn containing(&self, node: ResourceId) -> Vec<&Cycle> {
        self.cycles.iter().filter(|c| c.contains(node)).collect()
    }

    /// Cycles whose edge-kind union is a subset of `kinds`.
    pub fn with_kinds(&self, kinds: &BTreeSet<EdgeKind>) -> Vec<&Cycle> {
        self.cycles
            .iter()
            .filter(|c| c.edge_kinds.is_subset(kinds))
            .collect()
    }

    pub fn anomalous(&self) -> Vec<&Cycle> {
        self.cycles.iter().filter(|c| c.is_anomalous()).collect()
    }

    pub fn infinite_loop_candidates(&self) -> Vec<&Cycle> {
        self.cycles
            .iter()
            .filter(|c| c.is_infinite_loop_candidate())
            .collect()
    }

    /// Narrow infinite-loop candidates to those touching a routine the
    /// tracer found an unbounded loop in.
    pub fn confirmed_unbounded(&self, unbounded_routines: &BTreeSet<u16>) -> Vec<&Cycle> {
        self.infinite_loop_candidates()
            .into_iter()
            .filter(|c| {
                c.members.iter().any(|m| {
                    m.kind == ChunkKind::BehaviorRoutine && unbounded_routines.contains(&m.id)
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: IndexMap<ResourceId, Vec<(usize, EdgeKind)>>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        ResourceGraph::default()
    }

    pub fn add_node(&mut self, node: ResourceId) {
        self.nodes.entry(node).or_default();
    }

    pub fn add_edge(&mut self, from: ResourceId, to: ResourceId, kind: EdgeKind) {
        self.add_node(from);
        self.add_node(to);
        let to_idx = self.nodes.get_index_of(&to).expect("node just inserted");
        let from_idx = self.nodes.get_index_of(&from).expect("node just inserted");
        self.nodes[from_idx].push((to_idx, kind));
    }

    /// Fold a call graph in as behavioral edges between routine nodes.
    pub fn extend_from_call_graph(&mut self, calls: &CallGraph) {
        for (id, _) in calls.nodes() {
            self.add_node(ResourceId::routine(id));
        }
        for edge in calls.edges() {
            self.add_edge(
                ResourceId::routine(edge.caller),
                ResourceId::routine(edge.callee),
                EdgeKind::Behavioral,
            );
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|adj| adj.len()).sum()
    }

    /// Run Tarjan's algorithm and classify the looping components.
    /// Single-threaded by design: the algorithm is sequential over one
    /// shared graph.
    pub fn find_cycles(&self) -> CycleSet {
        let components = self.tarjan();
        let n = self.nodes.len();

        // Component membership per node index.
        let mut component_of = vec![usize::MAX; n];
        for (comp_idx, comp) in components.iter().enumerate() {
            for &node in comp {
                component_of[node] = comp_idx;
            }
        }

        // Per-component edge-kind union, self-loop presence, exits.
        let mut kinds: Vec<BTreeSet<EdgeKind>> = vec![BTreeSet::new(); components.len()];
        let mut self_loop = vec![false; components.len()];
        let mut has_exit = vec![false; components.len()];
        for (from, adjacency) in self.nodes.values().enumerate() {
            for &(to, kind) in adjacency {
                let comp = component_of[from];
                if comp == component_of[to] {
                    kinds[comp].insert(kind);
                    if from == to {
                        self_loop[comp] = true;
                    }
                } else {
                    has_exit[comp] = true;
                }
            }
        }

        let mut cycles = Vec::new();
        for (comp_idx, comp) in components.iter().enumerate() {
            let shape = match comp.len() {
                1 if self_loop[comp_idx] => CycleShape::SelfReferential,
                1 => continue, // a lone node is not a cycle
                2 => CycleShape::Mutual,
                _ => CycleShape::Complex,
            };
            let mut members: Vec<ResourceId> = comp
                .iter()
                .map(|&idx| *self.nodes.get_index(idx).expect("index in range").0)
                .collect();
            members.sort_unstable();
            cycles.push(Cycle {
                members,
                edge_kinds: kinds[comp_idx].clone(),
                shape,
                has_exit: has_exit[comp_idx],
            });
        }
        cycles.sort_by(|a, b| a.members.cmp(&b.members));

        debug!(
            "cycle detection: {} nodes, {} edges, {} component(s), {} cycle(s)",
            n,
            self.edge_count(),
            components.len(),
            cycles.len()
        );

        CycleSet { cycles }
    }

    /// Iterative Tarjan SCC over node indices. Components come out in
    /// reverse topological order; we only use the partition.
    fn tarjan(&self) -> Vec<Vec<usize>> {
        let n = self.nodes.len();
        let mut index = vec![usize::MAX; n];
        let mut lowlink = vec![usize::MAX; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut next_index = 0usize;
        let mut components = Vec::new();

        // Explicit DFS frames: (node, next adjacency slot).
        let mut frames: Vec<(usize, usize)> = Vec::new();

        for root in 0..n {
            if index[root] != usize::MAX {
                continue;
            }
            frames.push((root, 0));
            index[root] = next_index;
            lowlink[root] = next_index;
            next_index += 1;
            stack.push(root);
            on_stack[root] = true;

            while let Some(&mut (node, ref mut slot)) = frames.last_mut() {
                let adjacency = &self.nodes[node];
                if *slot < adjacency.len() {
                    let (next, _) = adjacency[*slot];
                    *slot += 1;
                    if index[next] == usize::MAX {
                        index[next] = next_index;
                        lowlink[next] = next_index;
                        next_index += 1;
                        stack.push(next);
                        on_stack[next] = true;
                        frames.push((next, 0));
                    } else if on_stack[next] {
                        lowlink[node] = lowlink[node].min(index[next]);
                    }
                } else {
                    frames.pop();
                    if let Some(&(parent, _)) = frames.last() {
                        lowlink[parent] = lowlink[parent].min(lowlink[node]);
                    }
                    if lowlink[node] == index[node] {
                        let mut component = Vec::new();
                        loop {
                            let popped = stack.pop().expect("tarjan stack underflow");
                            on_stack[popped] = false;
                            component.push(popped);
                            if popped == node {
                                break;
                            }
                        }
                        components.push(component);
                    }
                }
            }
        }

        components
    }
}
