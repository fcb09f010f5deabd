//! Dependency graph construction, cycle detection and cycle breaking

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, warn};

use crate::error::{OrchestrationError, Result};
use crate::models::{CycleBreak, DependencyEdge, DependencyType, ResourceRef};

/// Directed graph of resource dependencies
///
/// An edge `from -> to` means `from` depends on `to`. All internal maps are
/// ordered so every traversal visits nodes in `ResourceRef` order, which keeps
/// cycle breaking and planning deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// All resources in the graph
    nodes: BTreeSet<ResourceRef>,

    /// Edges keyed by `(from, to)`
    edges: BTreeMap<(ResourceRef, ResourceRef), DependencyEdge>,

    /// Forward adjacency (dependent -> dependencies)
    adjacency: BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,

    /// Reverse adjacency (dependency -> dependents)
    reverse_adjacency: BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,

    /// Problems found while discovering edges
    warnings: Vec<String>,
}

impl DependencyGraph {
    /// Creates an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource; adding an existing resource is a no-op
    pub fn add_node(&mut self, resource: ResourceRef) {
        self.adjacency.entry(resource.clone()).or_default();
        self.reverse_adjacency.entry(resource.clone()).or_default();
        self.nodes.insert(resource);
    }

    /// Adds an edge between two known resources
    ///
    /// When an edge for the same pair already exists the stronger one is kept
    /// (hard over soft, then higher weight).
    pub fn add_edge(&mut self, edge: DependencyEdge) -> Result<()> {
        if !self.nodes.contains(&edge.from) {
            return Err(OrchestrationError::ResourceNotFound(edge.from.to_string()));
        }
        if !self.nodes.contains(&edge.to) {
            return Err(OrchestrationError::ResourceNotFound(edge.to.to_string()));
        }
        if edge.from == edge.to {
            return Err(OrchestrationError::DependencyCycle(format!(
                "{} cannot depend on itself",
                edge.from
            )));
        }

        let key = (edge.from.clone(), edge.to.clone());
        if let Some(existing) = self.edges.get(&key) {
            if !edge.outranks(existing) {
                return Ok(());
            }
        }

        self.adjacency
            .entry(edge.from.clone())
            .or_default()
            .insert(edge.to.clone());
        self.reverse_adjacency
            .entry(edge.to.clone())
            .or_default()
            .insert(edge.from.clone());
        self.edges.insert(key, edge);

        Ok(())
    }

    /// Records a discovery warning
    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Warnings collected during discovery
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn contains(&self, resource: &ResourceRef) -> bool {
        self.nodes.contains(resource)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Number of hard edges
    pub fn hard_edge_count(&self) -> usize {
        self.edges.values().filter(|e| e.is_hard()).count()
    }

    /// Resources in `ResourceRef` order
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceRef> {
        self.nodes.iter()
    }

    /// Edges in `(from, to)` order
    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.values()
    }

    /// Gets the edge `from -> to`, if any
    pub fn edge(&self, from: &ResourceRef, to: &ResourceRef) -> Option<&DependencyEdge> {
        self.edges.get(&(from.clone(), to.clone()))
    }

    pub fn has_edge(&self, from: &ResourceRef, to: &ResourceRef) -> bool {
        self.edge(from, to).is_some()
    }

    /// Whether `a` and `b` are joined by a soft edge in either direction
    pub fn soft_connected(&self, a: &ResourceRef, b: &ResourceRef) -> bool {
        [self.edge(a, b), self.edge(b, a)]
            .into_iter()
            .flatten()
            .any(|e| e.dependency_type == DependencyType::Soft)
    }

    /// Resources that `resource` depends on
    pub fn dependencies(&self, resource: &ResourceRef, hard_only: bool) -> Vec<ResourceRef> {
        self.adjacency
            .get(resource)
            .into_iter()
            .flatten()
            .filter(|to| !hard_only || self.is_hard(resource, to))
            .cloned()
            .collect()
    }

    /// Resources that depend on `resource`
    pub fn dependents(&self, resource: &ResourceRef, hard_only: bool) -> Vec<ResourceRef> {
        self.reverse_adjacency
            .get(resource)
            .into_iter()
            .flatten()
            .filter(|from| !hard_only || self.is_hard(from, resource))
            .cloned()
            .collect()
    }

    fn is_hard(&self, from: &ResourceRef, to: &ResourceRef) -> bool {
        self.edge(from, to).is_some_and(DependencyEdge::is_hard)
    }

    /// Checks whether `from` reaches `to` along hard edges
    pub fn can_reach(&self, from: &ResourceRef, to: &ResourceRef) -> bool {
        if from == to {
            return true;
        }

        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([from.clone()]);

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            for next in self.dependencies(&current, true) {
                if &next == to {
                    return true;
                }
                if !visited.contains(&next) {
                    queue.push_back(next);
                }
            }
        }

        false
    }

    /// Finds cycles in the hard-edge subgraph
    ///
    /// Depth-first search with an explicit recursion stack; each back edge
    /// yields one cycle listed in traversal order starting at the node the
    /// back edge returns to.
    pub fn detect_cycles(&self) -> Vec<Vec<ResourceRef>> {
        let mut visited = BTreeSet::new();
        let mut stack = Vec::new();
        let mut on_stack = BTreeSet::new();
        let mut cycles = Vec::new();

        for node in &self.nodes {
            if !visited.contains(node) {
                self.dfs_cycle_detection(node, &mut visited, &mut stack, &mut on_stack, &mut cycles);
            }
        }

        cycles
    }

    fn dfs_cycle_detection(
        &self,
        node: &ResourceRef,
        visited: &mut BTreeSet<ResourceRef>,
        stack: &mut Vec<ResourceRef>,
        on_stack: &mut BTreeSet<ResourceRef>,
        cycles: &mut Vec<Vec<ResourceRef>>,
    ) {
        visited.insert(node.clone());
        stack.push(node.clone());
        on_stack.insert(node.clone());

        for next in self.dependencies(node, true) {
            if on_stack.contains(&next) {
                if let Some(start) = stack.iter().position(|n| n == &next) {
                    cycles.push(stack[start..].to_vec());
                }
            } else if !visited.contains(&next) {
                self.dfs_cycle_detection(&next, visited, stack, on_stack, cycles);
            }
        }

        stack.pop();
        on_stack.remove(node);
    }

    /// Downgrades the weakest hard edge of every cycle until the hard subgraph is acyclic
    ///
    /// The weakest edge is the one with the lowest weight, ties broken by
    /// `(from, to)` order. Each round picks the weakest edge of every detected
    /// cycle against the graph as it was before the round, so cycles sharing
    /// an edge are broken independently; an edge picked by several cycles is
    /// downgraded and reported once. Calling this on an acyclic graph returns
    /// nothing.
    pub fn break_cycles(&mut self) -> Vec<CycleBreak> {
        let mut breaks = Vec::new();

        loop {
            let cycles = self.detect_cycles();
            if cycles.is_empty() {
                break;
            }

            let mut picked: BTreeSet<(ResourceRef, ResourceRef)> = BTreeSet::new();
            let mut round = Vec::new();
            for cycle in &cycles {
                let Some(weakest) = self.weakest_hard_edge(cycle) else {
                    continue;
                };
                let key = (weakest.from.clone(), weakest.to.clone());
                if picked.insert(key) {
                    round.push(CycleBreak {
                        cycle: cycle.clone(),
                        from: weakest.from.clone(),
                        to: weakest.to.clone(),
                        weight: weakest.weight,
                    });
                }
            }

            if round.is_empty() {
                break;
            }

            for cycle_break in round {
                let key = (cycle_break.from.clone(), cycle_break.to.clone());
                if let Some(edge) = self.edges.get_mut(&key) {
                    edge.dependency_type = DependencyType::Soft;
                }
                warn!(
                    from = %cycle_break.from,
                    to = %cycle_break.to,
                    weight = cycle_break.weight,
                    "Downgraded dependency to break cycle"
                );
                breaks.push(cycle_break);
            }
        }

        debug!(broken = breaks.len(), "Cycle breaking finished");
        breaks
    }

    /// Lowest `(weight, from, to)` edge of a cycle whose edges are all hard
    fn weakest_hard_edge(&self, cycle: &[ResourceRef]) -> Option<&DependencyEdge> {
        let edges: Option<Vec<&DependencyEdge>> = cycle
            .iter()
            .enumerate()
            .map(|(i, from)| {
                let to = &cycle[(i + 1) % cycle.len()];
                self.edges.get(&(from.clone(), to.clone()))
            })
            .collect();
        let edges = edges?;
        if edges.iter().any(|e| !e.is_hard()) {
            return None;
        }
        edges
            .into_iter()
            .min_by(|a, b| (a.weight, &a.from, &a.to).cmp(&(b.weight, &b.from, &b.to)))
    }

    /// Projects the graph onto `keep`, retaining only edges between kept nodes
    pub fn subgraph(&self, keep: &BTreeSet<ResourceRef>) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for node in self.nodes.iter().filter(|n| keep.contains(*n)) {
            graph.add_node(node.clone());
        }
        for edge in self.edges.values() {
            if keep.contains(&edge.from) && keep.contains(&edge.to) {
                let key = (edge.from.clone(), edge.to.clone());
                graph.adjacency.entry(key.0.clone()).or_default().insert(key.1.clone());
                graph
                    .reverse_adjacency
                    .entry(key.1.clone())
                    .or_default()
                    .insert(key.0.clone());
                graph.edges.insert(key, edge.clone());
            }
        }
        graph.warnings = self.warnings.clone();
        graph
    }

    /// Validates graph consistency
    pub fn validate(&self) -> Result<()> {
        for (from, to) in self.edges.keys() {
            if !self.nodes.contains(from) {
                return Err(OrchestrationError::ResourceNotFound(from.to_string()));
            }
            if !self.nodes.contains(to) {
                return Err(OrchestrationError::ResourceNotFound(to.to_string()));
            }
        }
        Ok(())
    }
}
