//! Dependency discovery over a resource set

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::analyzers::dependency_graph::DependencyGraph;
use crate::analyzers::signals::{default_extractors, kind_rank, ResourceIndex, SignalExtractor};
use crate::models::{weights, ClusterSnapshot, DependencyEdge, ResourceRecord, SignalSource};

/// Builds dependency graphs from ownership, reference and annotation signals
///
/// Discovery has no side effects and never fails: malformed reference data is
/// skipped with a warning, so the worst outcome is a less optimal ordering.
pub struct DependencyAnalyzer {
    /// Signal extractors, run in order for every record
    extractors: Vec<Box<dyn SignalExtractor>>,

    /// Whether to add soft same-namespace edges
    colocation: bool,
}

impl DependencyAnalyzer {
    /// Creates an analyzer with the built-in extractors
    pub fn new() -> Self {
        Self {
            extractors: default_extractors(),
            colocation: true,
        }
    }

    /// Creates an analyzer with no extractors
    pub fn empty() -> Self {
        Self {
            extractors: Vec::new(),
            colocation: false,
        }
    }

    /// Registers an additional extractor
    pub fn with_extractor(mut self, extractor: impl SignalExtractor + 'static) -> Self {
        self.extractors.push(Box::new(extractor));
        self
    }

    /// Enables or disables colocation soft edges
    pub fn with_colocation(mut self, enabled: bool) -> Self {
        self.colocation = enabled;
        self
    }

    /// Names of the registered extractors
    pub fn extractor_names(&self) -> Vec<&'static str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }

    /// Builds a graph whose nodes are exactly `resources`
    ///
    /// Edges whose target is outside the set are dropped. Duplicate records
    /// for the same resource keep the last occurrence.
    pub fn discover(&self, resources: &[ResourceRecord]) -> DependencyGraph {
        let mut unique: BTreeMap<_, &ResourceRecord> = BTreeMap::new();
        let mut graph = DependencyGraph::new();

        for record in resources {
            if unique.insert(&record.reference, record).is_some() {
                let message = format!("{}: duplicate record, keeping the last one", record.reference);
                warn!(resource = %record.reference, "Duplicate resource record");
                graph.add_warning(message);
            }
        }

        let index = ResourceIndex::new(unique.values().copied());
        for reference in unique.keys() {
            graph.add_node((*reference).clone());
        }

        for record in index.records() {
            for extractor in &self.extractors {
                let signals = extractor.extract(record, &index);

                for message in signals.warnings {
                    warn!(extractor = extractor.name(), "{}", message);
                    graph.add_warning(message);
                }

                for edge in signals.edges {
                    self.add_signal_edge(&mut graph, edge, extractor.name());
                }
            }
        }

        if self.colocation {
            self.add_colocation_edges(&mut graph, &index);
        }

        info!(
            resources = graph.node_count(),
            edges = graph.edge_count(),
            hard_edges = graph.hard_edge_count(),
            warnings = graph.warnings().len(),
            "Dependency discovery complete"
        );

        graph
    }

    /// Builds a graph over a cluster snapshot plus the target set
    ///
    /// Target records replace snapshot records with the same identity, so the
    /// desired state wins over the observed one.
    pub fn discover_snapshot(
        &self,
        snapshot: &ClusterSnapshot,
        targets: &[ResourceRecord],
    ) -> DependencyGraph {
        let mut records: Vec<ResourceRecord> = snapshot
            .resources
            .iter()
            .filter(|r| !targets.iter().any(|t| t.reference == r.reference))
            .cloned()
            .collect();
        records.extend(targets.iter().cloned());

        debug!(
            snapshot_version = snapshot.version,
            records = records.len(),
            "Discovering dependencies over snapshot"
        );
        self.discover(&records)
    }

    fn add_signal_edge(&self, graph: &mut DependencyGraph, edge: DependencyEdge, extractor: &str) {
        if !graph.contains(&edge.to) {
            debug!(
                extractor,
                from = %edge.from,
                to = %edge.to,
                "Dependency target outside resource set"
            );
            return;
        }

        let (from, to) = (edge.from.clone(), edge.to.clone());
        if let Err(e) = graph.add_edge(edge) {
            warn!(extractor, from = %from, to = %to, error = %e, "Skipping dependency");
            graph.add_warning(format!("{}: {}", from, e));
        }
    }

    /// Adds soft edges between same-namespace resources with no other signal
    fn add_colocation_edges(&self, graph: &mut DependencyGraph, index: &ResourceIndex<'_>) {
        let mut namespaces: BTreeMap<&str, Vec<&ResourceRecord>> = BTreeMap::new();
        for record in index.records() {
            if !record.reference.is_cluster_scoped() {
                namespaces
                    .entry(record.reference.namespace.as_str())
                    .or_default()
                    .push(record);
            }
        }

        let mut added = 0usize;
        for members in namespaces.values() {
            for a in members {
                for b in members {
                    let (Some(rank_a), Some(rank_b)) =
                        (kind_rank(&a.reference.kind), kind_rank(&b.reference.kind))
                    else {
                        continue;
                    };
                    if rank_a <= rank_b
                        || graph.has_edge(&a.reference, &b.reference)
                        || graph.has_edge(&b.reference, &a.reference)
                    {
                        continue;
                    }

                    let edge = DependencyEdge::soft(
                        a.reference.clone(),
                        b.reference.clone(),
                        weights::LOW,
                        SignalSource::Colocation,
                    );
                    if graph.add_edge(edge).is_ok() {
                        added += 1;
                    }
                }
            }
        }

        debug!(added, "Added colocation edges");
    }
}

impl Default for DependencyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyAnalyzer")
            .field("extractors", &self.extractor_names())
            .field("colocation", &self.colocation)
            .finish()
    }
}
