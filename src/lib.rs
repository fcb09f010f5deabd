//! Shared fixtures for the end-to-end recovery scenarios

use std::sync::Arc;

use fluxmend_recovery::analyzers::DEPENDS_ON_ANNOTATION;
use fluxmend_recovery::{
    InMemoryControlPlane, RecoveryConfig, RecoveryManager, ResourceRecord, ResourceRef,
};
use serde_json::json;

pub const NAMESPACE: &str = "default";

pub fn reference(kind: &str, name: &str) -> ResourceRef {
    ResourceRef::new(kind, NAMESPACE, name)
}

/// Config map, deployment mounting it, service selecting the deployment and
/// ingress routing to the service
pub fn web_application() -> Vec<ResourceRecord> {
    vec![
        ResourceRecord::new(reference("ConfigMap", "cfg")).with_spec(json!({
            "data": {"LOG_LEVEL": "info"}
        })),
        ResourceRecord::new(reference("Deployment", "app")).with_spec(json!({
            "replicas": 2,
            "template": {
                "metadata": {"labels": {"app": "web"}},
                "spec": {
                    "volumes": [{"name": "config", "configMap": {"name": "cfg"}}],
                    "containers": [{"name": "web", "image": "registry.local/web:2.1"}]
                }
            }
        })),
        ResourceRecord::new(reference("Service", "svc")).with_spec(json!({
            "selector": {"app": "web"},
            "ports": [{"port": 80, "targetPort": 8080}]
        })),
        ResourceRecord::new(reference("Ingress", "ing")).with_spec(json!({
            "rules": [{
                "host": "web.example.com",
                "http": {"paths": [{"path": "/", "backend": {"service": {"name": "svc"}}}]}
            }]
        })),
    ]
}

/// Two config maps declaring dependencies on each other
pub fn declared_cycle(a_to_b: u32, b_to_a: u32) -> Vec<ResourceRecord> {
    vec![
        ResourceRecord::new(reference("ConfigMap", "a"))
            .with_annotation(DEPENDS_ON_ANNOTATION, format!("ConfigMap/b:{}", a_to_b)),
        ResourceRecord::new(reference("ConfigMap", "b"))
            .with_annotation(DEPENDS_ON_ANNOTATION, format!("ConfigMap/a:{}", b_to_a)),
    ]
}

/// Millisecond backoff and polling so failure paths finish quickly
pub fn fast_config(auto_rollback: bool) -> RecoveryConfig {
    let mut config = RecoveryConfig::default();
    config.auto_rollback = auto_rollback;
    config.executor.initial_backoff_ms = 1;
    config.executor.max_backoff_ms = 4;
    config.executor.readiness_poll_interval_ms = 5;
    config.executor.operation_timeout_secs = 2;
    config
}

/// A manager over `plane` with [`fast_config`]
pub fn manager(plane: &Arc<InMemoryControlPlane>, auto_rollback: bool) -> RecoveryManager {
    match RecoveryManager::new(plane.clone(), fast_config(auto_rollback)) {
        Ok(manager) => manager,
        Err(err) => panic!("fixture configuration rejected: {}", err),
    }
}

/// Resource names of each batch, in order
pub fn batch_names(batches: &[fluxmend_recovery::Batch]) -> Vec<Vec<String>> {
    batches
        .iter()
        .map(|b| b.resources().into_iter().map(|r| r.name).collect())
        .collect()
}
