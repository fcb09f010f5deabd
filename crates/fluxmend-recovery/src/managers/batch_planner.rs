//! Batch planning: dependency levels for cleanup and recreation

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::analyzers::DependencyGraph;
use crate::config::{PriorityTable, StrategyTable};
use crate::error::{OrchestrationError, Result};
use crate::models::{Batch, BatchPhase, OperationAction, ResourceRef, UpdateOperation};

/// Cleanup and recreation batches of a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatches {
    /// Dependents first
    pub cleanup: Vec<Batch>,

    /// Dependencies first
    pub recreation: Vec<Batch>,
}

/// Turns an acyclic dependency graph into ordered, deterministic batches
///
/// Recreation levels come from Kahn's algorithm over hard edges: a level holds
/// every resource whose hard dependencies all sit in earlier levels. Cleanup
/// uses the same levels in reverse, so each dependent is removed in an
/// earlier batch than anything it depends on.
#[derive(Debug, Clone)]
pub struct BatchPlanner {
    strategies: StrategyTable,
    priorities: PriorityTable,
}

impl BatchPlanner {
    pub fn new(strategies: StrategyTable, priorities: PriorityTable) -> Self {
        Self {
            strategies,
            priorities,
        }
    }

    /// Plans both phases over every node of `graph`
    ///
    /// Fails with `DependencyCycle` if the hard-edge subgraph is cyclic.
    pub fn plan(&self, graph: &DependencyGraph) -> Result<PlannedBatches> {
        let levels = self.levels(graph)?;

        let recreation: Vec<Batch> = levels
            .iter()
            .enumerate()
            .map(|(i, level)| self.batch(graph, level, i + 1, BatchPhase::Recreation))
            .collect();

        let cleanup: Vec<Batch> = levels
            .iter()
            .rev()
            .enumerate()
            .map(|(i, level)| self.batch(graph, level, i + 1, BatchPhase::Cleanup))
            .collect();

        debug!(
            resources = graph.node_count(),
            batches = levels.len(),
            sequential = recreation.iter().filter(|b| !b.parallel_safe).count(),
            "Batches planned"
        );

        Ok(PlannedBatches {
            cleanup,
            recreation,
        })
    }

    /// Forward topological levels over hard edges, each in priority order
    fn levels(&self, graph: &DependencyGraph) -> Result<Vec<Vec<ResourceRef>>> {
        let mut in_degree: BTreeMap<ResourceRef, usize> = graph
            .nodes()
            .map(|node| (node.clone(), graph.dependencies(node, true).len()))
            .collect();

        let mut levels = Vec::new();
        let mut placed = BTreeSet::new();

        while placed.len() < in_degree.len() {
            let mut current: Vec<ResourceRef> = in_degree
                .iter()
                .filter(|(node, degree)| **degree == 0 && !placed.contains(*node))
                .map(|(node, _)| node.clone())
                .collect();

            if current.is_empty() {
                let remaining: Vec<String> = in_degree
                    .keys()
                    .filter(|node| !placed.contains(*node))
                    .map(ToString::to_string)
                    .collect();
                return Err(OrchestrationError::DependencyCycle(format!(
                    "unresolved hard dependencies among {}",
                    remaining.join(", ")
                )));
            }

            for node in &current {
                placed.insert(node.clone());
                for dependent in graph.dependents(node, true) {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }

            self.sort_by_priority(&mut current);
            levels.push(current);
        }

        Ok(levels)
    }

    /// Descending priority, then `ResourceRef` order
    fn sort_by_priority(&self, resources: &mut [ResourceRef]) {
        resources.sort_by(|a, b| {
            self.priorities
                .priority_for(b)
                .cmp(&self.priorities.priority_for(a))
                .then_with(|| a.cmp(b))
        });
    }

    fn batch(
        &self,
        graph: &DependencyGraph,
        level: &[ResourceRef],
        number: usize,
        phase: BatchPhase,
    ) -> Batch {
        let action = match phase {
            BatchPhase::Cleanup => OperationAction::Cleanup,
            BatchPhase::Recreation => OperationAction::Recreate,
        };

        let operations = level
            .iter()
            .map(|resource| {
                UpdateOperation::new(
                    resource.clone(),
                    action,
                    self.strategies.strategy_for(&resource.kind),
                    self.priorities.priority_for(resource),
                )
            })
            .collect();

        Batch {
            number,
            phase,
            operations,
            parallel_safe: self.is_parallel_safe(graph, level),
        }
    }

    /// A batch is sequential when a soft-connected pair carries a non-default priority
    fn is_parallel_safe(&self, graph: &DependencyGraph, level: &[ResourceRef]) -> bool {
        for (i, a) in level.iter().enumerate() {
            for b in &level[i + 1..] {
                if graph.soft_connected(a, b)
                    && (self.priorities.is_non_default(a) || self.priorities.is_non_default(b))
                {
                    return false;
                }
            }
        }
        true
    }
}
