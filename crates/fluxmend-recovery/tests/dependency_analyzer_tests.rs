//! Discovery over realistic application manifests

use fluxmend_recovery::analyzers::{DEPENDS_ON_ANNOTATION, PRIORITY_ANNOTATION};
use fluxmend_recovery::{
    BatchPlanner, ClusterSnapshot, DependencyAnalyzer, DependencyType, PriorityTable,
    ResourceRecord, ResourceRef, SignalSource, Strategy, StrategyTable,
};
use serde_json::json;

fn r(kind: &str, name: &str) -> ResourceRef {
    ResourceRef::new(kind, "shop", name)
}

/// Namespace, config, secret, service account, deployment, service and ingress
fn web_stack() -> Vec<ResourceRecord> {
    vec![
        ResourceRecord::new(ResourceRef::cluster_scoped("Namespace", "shop")),
        ResourceRecord::new(r("ConfigMap", "web-config")),
        ResourceRecord::new(r("Secret", "web-tls")),
        ResourceRecord::new(r("ServiceAccount", "web")),
        ResourceRecord::new(r("Deployment", "web")).with_spec(json!({
            "template": {
                "metadata": {"labels": {"app": "web", "tier": "frontend"}},
                "spec": {
                    "serviceAccountName": "web",
                    "volumes": [
                        {"name": "config", "configMap": {"name": "web-config"}},
                        {"name": "tls", "secret": {"secretName": "web-tls"}}
                    ],
                    "containers": [{"name": "web", "image": "shop/web:1.4"}]
                }
            }
        })),
        ResourceRecord::new(r("Service", "web")).with_spec(json!({
            "selector": {"app": "web"}
        })),
        ResourceRecord::new(r("Ingress", "web")).with_spec(json!({
            "rules": [{
                "host": "shop.example.com",
                "http": {"paths": [{"path": "/", "backend": {"service": {"name": "web"}}}]}
            }]
        })),
    ]
}

#[test]
fn test_web_stack_edges() {
    let graph = DependencyAnalyzer::new().discover(&web_stack());

    assert_eq!(graph.node_count(), 7);
    assert!(graph.warnings().is_empty());

    let deployment = r("Deployment", "web");
    let mut deps = graph.dependencies(&deployment, true);
    deps.sort();
    let mut expected = vec![
        ResourceRef::cluster_scoped("Namespace", "shop"),
        r("ConfigMap", "web-config"),
        r("Secret", "web-tls"),
        r("ServiceAccount", "web"),
    ];
    expected.sort();
    assert_eq!(deps, expected);

    let service_edge = graph.edge(&r("Service", "web"), &deployment).unwrap();
    assert_eq!(service_edge.source, SignalSource::Selector);
    assert!(service_edge.is_hard());

    let ingress_edge = graph.edge(&r("Ingress", "web"), &r("Service", "web")).unwrap();
    assert_eq!(ingress_edge.source, SignalSource::Backend);
}

#[test]
fn test_web_stack_batches() {
    let graph = DependencyAnalyzer::new().discover(&web_stack());
    let planned = BatchPlanner::new(StrategyTable::default(), PriorityTable::default())
        .plan(&graph)
        .unwrap();

    let recreation: Vec<Vec<String>> = planned
        .recreation
        .iter()
        .map(|b| b.resources().iter().map(ToString::to_string).collect())
        .collect();
    assert_eq!(
        recreation,
        vec![
            vec!["Namespace/shop"],
            vec![
                "ConfigMap/shop/web-config",
                "Secret/shop/web-tls",
                "ServiceAccount/shop/web"
            ],
            vec!["Deployment/shop/web"],
            vec!["Service/shop/web"],
            vec!["Ingress/shop/web"],
        ]
    );
    assert_eq!(planned.cleanup[0].resources(), vec![r("Ingress", "web")]);

    let strategies: Vec<Strategy> = planned
        .recreation
        .iter()
        .skip(2)
        .map(|b| b.operations[0].strategy)
        .collect();
    assert_eq!(
        strategies,
        vec![Strategy::Rolling, Strategy::Recreate, Strategy::Atomic]
    );
}

#[test]
fn test_owned_pods_follow_owner() {
    let records = vec![
        ResourceRecord::new(r("ReplicaSet", "web-7c9")),
        ResourceRecord::new(r("Pod", "web-7c9-abc")).with_owner("ReplicaSet", "web-7c9"),
    ];
    let graph = DependencyAnalyzer::new().discover(&records);

    let edge = graph
        .edge(&r("Pod", "web-7c9-abc"), &r("ReplicaSet", "web-7c9"))
        .unwrap();
    assert_eq!(edge.source, SignalSource::Ownership);
    assert_eq!(edge.weight, 100);
}

#[test]
fn test_colocation_edges_are_soft() {
    let records = vec![
        ResourceRecord::new(r("ConfigMap", "unrelated")),
        ResourceRecord::new(r("Deployment", "worker")),
    ];
    let graph = DependencyAnalyzer::new().discover(&records);

    let edge = graph
        .edge(&r("Deployment", "worker"), &r("ConfigMap", "unrelated"))
        .unwrap();
    assert_eq!(edge.dependency_type, DependencyType::Soft);
    assert_eq!(graph.hard_edge_count(), 0);

    let without = DependencyAnalyzer::new().with_colocation(false).discover(&records);
    assert_eq!(without.edge_count(), 0);
}

#[test]
fn test_malformed_references_only_warn() {
    let records = vec![
        ResourceRecord::new(r("Deployment", "broken")).with_spec(json!({
            "template": {"spec": {
                "volumes": "not-a-list",
                "serviceAccountName": 42
            }}
        })),
        ResourceRecord::new(r("ConfigMap", "a"))
            .with_annotation(DEPENDS_ON_ANNOTATION, "Secret/b:heavy, ConfigMap/a"),
    ];
    let graph = DependencyAnalyzer::new().discover(&records);

    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.hard_edge_count(), 0);
    let warnings = graph.warnings().join("\n");
    assert!(warnings.contains("spec volumes is not a list"));
    assert!(warnings.contains("serviceAccountName is not a string"));
    assert!(warnings.contains("invalid weight in 'Secret/b:heavy'"));
    assert!(warnings.contains("declares a dependency on itself"));
}

#[test]
fn test_annotations_declare_dependencies() {
    let records = vec![
        ResourceRecord::new(r("ConfigMap", "schema")),
        ResourceRecord::new(r("Job", "migrate"))
            .with_annotation(DEPENDS_ON_ANNOTATION, "ConfigMap/schema:90")
            .with_annotation(PRIORITY_ANNOTATION, "10"),
    ];
    let graph = DependencyAnalyzer::new().discover(&records);

    let edge = graph
        .edge(&r("Job", "migrate"), &r("ConfigMap", "schema"))
        .unwrap();
    assert_eq!(edge.source, SignalSource::Annotation);
    assert_eq!(edge.weight, 90);
}

#[test]
fn test_snapshot_discovery_prefers_desired_state() {
    let observed = ResourceRecord::new(r("Deployment", "web")).with_spec(json!({
        "template": {"spec": {"volumes": [{"name": "c", "configMap": {"name": "old-config"}}]}}
    }));
    let snapshot = ClusterSnapshot::new(
        3,
        vec![
            observed,
            ResourceRecord::new(r("ConfigMap", "old-config")),
            ResourceRecord::new(r("ConfigMap", "new-config")),
        ],
    );
    let desired = ResourceRecord::new(r("Deployment", "web")).with_spec(json!({
        "template": {"spec": {"volumes": [{"name": "c", "configMap": {"name": "new-config"}}]}}
    }));

    let graph = DependencyAnalyzer::new().discover_snapshot(&snapshot, &[desired]);

    assert_eq!(graph.node_count(), 3);
    assert!(graph
        .edge(&r("Deployment", "web"), &r("ConfigMap", "new-config"))
        .is_some_and(|e| e.is_hard()));
    assert!(!graph
        .edge(&r("Deployment", "web"), &r("ConfigMap", "old-config"))
        .is_some_and(|e| e.is_hard()));
}
