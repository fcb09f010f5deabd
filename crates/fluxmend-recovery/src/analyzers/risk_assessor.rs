//! Blast radius and risk assessment for recovery plans

use std::collections::{BTreeSet, VecDeque};

use tracing::debug;

use crate::analyzers::dependency_graph::DependencyGraph;
use crate::config::{PriorityTable, RiskConfig};
use crate::models::{CycleBreak, ResourceRef, RiskAssessment, RiskLevel};

/// Computes impact scores and risk levels
///
/// Impact is `direct + indirect_weight * indirect + bonus`, where dependents
/// are counted outside the target set and the bonus is added once per
/// critical namespace touched by a target.
#[derive(Debug, Clone)]
pub struct RiskAssessor {
    config: RiskConfig,
    priorities: PriorityTable,
}

impl RiskAssessor {
    pub fn new(config: RiskConfig, priorities: PriorityTable) -> Self {
        Self { config, priorities }
    }

    /// Assesses a change to `targets` over `graph`
    pub fn assess(
        &self,
        graph: &DependencyGraph,
        targets: &[ResourceRef],
        cycle_breaks: &[CycleBreak],
    ) -> RiskAssessment {
        let target_set: BTreeSet<&ResourceRef> = targets.iter().collect();
        let (direct, indirect) = self.blast_radius(graph, &target_set);

        let critical_namespaces: BTreeSet<&str> = targets
            .iter()
            .map(|t| t.namespace.as_str())
            .filter(|ns| self.priorities.is_critical_namespace(ns))
            .collect();

        let bonus = critical_namespaces.len() as f64 * self.config.critical_namespace_bonus;
        let impact_score =
            direct.len() as f64 + self.config.indirect_weight * indirect.len() as f64 + bonus;

        let mut factors = vec![format!("{} resources affected", targets.len())];
        if !direct.is_empty() {
            factors.push(format!("{} direct dependents", direct.len()));
        }
        if !indirect.is_empty() {
            factors.push(format!("{} indirect dependents", indirect.len()));
        }
        for namespace in &critical_namespaces {
            factors.push(format!("critical namespace {} involved", namespace));
        }
        for cycle_break in cycle_breaks {
            factors.push(format!(
                "circular dependency broken between {} and {}",
                cycle_break.from, cycle_break.to
            ));
        }
        factors.push(format!("impact score {:.1}", impact_score));

        let level = if impact_score >= self.config.high_threshold || !cycle_breaks.is_empty() {
            RiskLevel::High
        } else if impact_score >= self.config.medium_threshold || !critical_namespaces.is_empty() {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        debug!(
            targets = targets.len(),
            direct = direct.len(),
            indirect = indirect.len(),
            impact_score,
            ?level,
            "Risk assessed"
        );

        RiskAssessment {
            level,
            impact_score,
            direct_dependents: direct.len(),
            indirect_dependents: indirect.len(),
            factors,
            mitigation_required: level == RiskLevel::High,
        }
    }

    /// Breadth-first walk over hard dependents, depth-limited
    ///
    /// Returns `(direct, indirect)` dependents, excluding the targets.
    fn blast_radius(
        &self,
        graph: &DependencyGraph,
        targets: &BTreeSet<&ResourceRef>,
    ) -> (BTreeSet<ResourceRef>, BTreeSet<ResourceRef>) {
        let mut direct = BTreeSet::new();
        let mut indirect = BTreeSet::new();
        let mut visited: BTreeSet<ResourceRef> = targets.iter().map(|t| (*t).clone()).collect();
        let mut queue: VecDeque<(ResourceRef, usize)> =
            targets.iter().map(|t| ((*t).clone(), 0)).collect();

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= self.config.max_traversal_depth {
                continue;
            }
            for dependent in graph.dependents(&current, true) {
                if !visited.insert(dependent.clone()) {
                    continue;
                }
                if depth == 0 {
                    direct.insert(dependent.clone());
                } else {
                    indirect.insert(dependent.clone());
                }
                queue.push_back((dependent, depth + 1));
            }
        }

        (direct, indirect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DependencyEdge, SignalSource};

    fn r(ns: &str, name: &str) -> ResourceRef {
        ResourceRef::new("Deployment", ns, name)
    }

    /// `count` dependents fan into `default/core`, each with one further dependent
    fn fan_in(count: usize) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        let core = r("default", "core");
        graph.add_node(core.clone());
        for i in 0..count {
            let mid = r("default", &format!("mid-{}", i));
            let leaf = r("default", &format!("leaf-{}", i));
            graph.add_node(mid.clone());
            graph.add_node(leaf.clone());
            graph
                .add_edge(DependencyEdge::hard(mid.clone(), core.clone(), 75, SignalSource::Mount))
                .unwrap();
            graph
                .add_edge(DependencyEdge::hard(leaf, mid, 75, SignalSource::Mount))
                .unwrap();
        }
        graph
    }

    fn assessor() -> RiskAssessor {
        RiskAssessor::new(RiskConfig::default(), PriorityTable::default())
    }

    #[test]
    fn test_low_risk() {
        let graph = fan_in(1);
        let assessment = assessor().assess(&graph, &[r("default", "core")], &[]);

        assert_eq!(assessment.direct_dependents, 1);
        assert_eq!(assessment.indirect_dependents, 1);
        assert!((assessment.impact_score - 1.5).abs() < f64::EPSILON);
        assert_eq!(assessment.level, RiskLevel::Low);
        assert!(!assessment.mitigation_required);
        assert_eq!(assessment.factors[0], "1 resources affected");
    }

    #[test]
    fn test_medium_risk_by_impact() {
        let graph = fan_in(4);
        let assessment = assessor().assess(&graph, &[r("default", "core")], &[]);
        // 4 direct + 0.5 * 4 indirect
        assert!((assessment.impact_score - 6.0).abs() < f64::EPSILON);
        assert_eq!(assessment.level, RiskLevel::Medium);
    }

    #[test]
    fn test_high_risk_by_impact() {
        let graph = fan_in(14);
        let assessment = assessor().assess(&graph, &[r("default", "core")], &[]);
        assert_eq!(assessment.level, RiskLevel::High);
        assert!(assessment.mitigation_required);
    }

    #[test]
    fn test_critical_namespace_forces_medium() {
        let mut graph = DependencyGraph::new();
        let target = r("kube-system", "coredns");
        graph.add_node(target.clone());

        let config = RiskConfig {
            critical_namespace_bonus: 1.0,
            ..RiskConfig::default()
        };
        let assessment = RiskAssessor::new(config, PriorityTable::default()).assess(&graph, &[target], &[]);
        assert_eq!(assessment.level, RiskLevel::Medium);
        assert!(assessment
            .factors
            .iter()
            .any(|f| f == "critical namespace kube-system involved"));
    }

    #[test]
    fn test_default_critical_bonus_reaches_high() {
        let mut graph = DependencyGraph::new();
        let target = r("flux-system", "source-controller");
        graph.add_node(target.clone());

        let assessment = assessor().assess(&graph, &[target], &[]);
        assert!((assessment.impact_score - 25.0).abs() < f64::EPSILON);
        assert_eq!(assessment.level, RiskLevel::High);
    }

    #[test]
    fn test_cycle_break_forces_high() {
        let graph = fan_in(0);
        let cycle_break = CycleBreak {
            cycle: vec![r("default", "a"), r("default", "b")],
            from: r("default", "b"),
            to: r("default", "a"),
            weight: 5,
        };
        let assessment = assessor().assess(&graph, &[r("default", "core")], &[cycle_break]);
        assert_eq!(assessment.level, RiskLevel::High);
        assert!(assessment.factors.iter().any(|f| f.contains("circular dependency broken")));
    }

    #[test]
    fn test_traversal_depth_limited() {
        let mut graph = DependencyGraph::new();
        let chain: Vec<ResourceRef> = (0..10).map(|i| r("default", &format!("n{}", i))).collect();
        for node in &chain {
            graph.add_node(node.clone());
        }
        for pair in chain.windows(2) {
            graph
                .add_edge(DependencyEdge::hard(pair[1].clone(), pair[0].clone(), 75, SignalSource::Mount))
                .unwrap();
        }

        let config = RiskConfig {
            max_traversal_depth: 3,
            ..RiskConfig::default()
        };
        let assessment =
            RiskAssessor::new(config, PriorityTable::default()).assess(&graph, &[chain[0].clone()], &[]);
        assert_eq!(assessment.direct_dependents, 1);
        assert_eq!(assessment.indirect_dependents, 2);
    }

    #[test]
    fn test_targets_are_not_counted_as_dependents() {
        let graph = fan_in(1);
        let targets = vec![r("default", "core"), r("default", "mid-0")];
        let assessment = assessor().assess(&graph, &targets, &[]);
        assert_eq!(assessment.direct_dependents, 1);
        assert_eq!(assessment.indirect_dependents, 0);
    }

    #[test]
    fn test_unrelated_neighbours_do_not_raise_risk() {
        let lonely = ResourceRef::new("ConfigMap", "default", "lonely");
        let mut records = vec![crate::models::ResourceRecord::new(lonely.clone())];
        records.extend(
            (0..25).map(|i| crate::models::ResourceRecord::new(r("default", &format!("web-{}", i)))),
        );
        let graph = crate::analyzers::DependencyAnalyzer::new().discover(&records);
        assert!(!graph.dependents(&lonely, false).is_empty());

        let assessment = assessor().assess(&graph, &[lonely], &[]);
        assert_eq!(assessment.direct_dependents, 0);
        assert_eq!(assessment.indirect_dependents, 0);
        assert!(assessment.impact_score.abs() < f64::EPSILON);
        assert_eq!(assessment.level, RiskLevel::Low);
        assert!(!assessment.mitigation_required);
    }

    #[test]
    fn test_soft_edges_are_not_followed() {
        let mut graph = fan_in(1);
        let neighbour = r("default", "neighbour");
        graph.add_node(neighbour.clone());
        graph
            .add_edge(DependencyEdge::soft(neighbour, r("default", "core"), 10, SignalSource::Colocation))
            .unwrap();

        let assessment = assessor().assess(&graph, &[r("default", "core")], &[]);
        assert_eq!(assessment.direct_dependents, 1);
        assert_eq!(assessment.indirect_dependents, 1);
    }
}
