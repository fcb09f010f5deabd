//! Pluggable extraction of dependency signals from resource records
//!
//! Each extractor understands one family of reference fields and turns it
//! into typed edges. Malformed data never aborts discovery: the extractor
//! skips the entry and reports a warning instead.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::models::{weights, DependencyEdge, ResourceRecord, ResourceRef, SignalSource};

/// Annotation listing explicit dependencies: `Kind/name[:weight], Kind/ns/name[:weight]`
pub const DEPENDS_ON_ANNOTATION: &str = "fluxmend.io/depends-on";

/// Annotation carrying an integer planning priority
pub const PRIORITY_ANNOTATION: &str = "fluxmend.io/priority";

/// Lookup over the resource set being analyzed
#[derive(Debug)]
pub struct ResourceIndex<'a> {
    records: BTreeMap<&'a ResourceRef, &'a ResourceRecord>,
}

impl<'a> ResourceIndex<'a> {
    pub fn new(records: impl IntoIterator<Item = &'a ResourceRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (&r.reference, r)).collect(),
        }
    }

    pub fn get(&self, reference: &ResourceRef) -> Option<&'a ResourceRecord> {
        self.records.get(reference).copied()
    }

    pub fn contains(&self, reference: &ResourceRef) -> bool {
        self.records.contains_key(reference)
    }

    /// Records in a namespace, in `ResourceRef` order
    pub fn in_namespace<'s>(
        &'s self,
        namespace: &'s str,
    ) -> impl Iterator<Item = &'a ResourceRecord> + 's {
        self.records
            .values()
            .copied()
            .filter(move |r| r.reference.namespace == namespace)
    }

    pub fn records(&self) -> impl Iterator<Item = &'a ResourceRecord> + '_ {
        self.records.values().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Edges and warnings produced for one record
#[derive(Debug, Default)]
pub struct Signals {
    pub edges: Vec<DependencyEdge>,
    pub warnings: Vec<String>,
}

impl Signals {
    fn hard(&mut self, from: &ResourceRef, to: ResourceRef, weight: u32, source: SignalSource) {
        self.edges
            .push(DependencyEdge::hard(from.clone(), to, weight, source));
    }

    fn warn(&mut self, record: &ResourceRecord, message: impl AsRef<str>) {
        self.warnings
            .push(format!("{}: {}", record.reference, message.as_ref()));
    }
}

/// Turns one family of reference fields into dependency edges
///
/// New reference kinds are supported by adding an extractor; the graph and
/// the planner never need to change.
pub trait SignalExtractor: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Extracts signals for `record`; targets may be outside `index`
    fn extract(&self, record: &ResourceRecord, index: &ResourceIndex<'_>) -> Signals;
}

/// Owner references: the owned resource depends on its owner
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnershipExtractor;

impl SignalExtractor for OwnershipExtractor {
    fn name(&self) -> &'static str {
        "ownership"
    }

    fn extract(&self, record: &ResourceRecord, index: &ResourceIndex<'_>) -> Signals {
        let mut signals = Signals::default();
        for owner in &record.owner_references {
            if owner.kind.is_empty() || owner.name.is_empty() {
                signals.warn(record, "owner reference without kind or name");
                continue;
            }

            let namespaced = ResourceRef::new(&owner.kind, &record.reference.namespace, &owner.name);
            let target = if index.contains(&namespaced) {
                namespaced
            } else {
                ResourceRef::cluster_scoped(&owner.kind, &owner.name)
            };
            signals.hard(&record.reference, target, weights::MAX, SignalSource::Ownership);
        }
        signals
    }
}

/// Namespaced resources depend on their `Namespace` object
#[derive(Debug, Default, Clone, Copy)]
pub struct NamespaceExtractor;

impl SignalExtractor for NamespaceExtractor {
    fn name(&self) -> &'static str {
        "namespace"
    }

    fn extract(&self, record: &ResourceRecord, _index: &ResourceIndex<'_>) -> Signals {
        let mut signals = Signals::default();
        if !record.reference.is_cluster_scoped() {
            let namespace = ResourceRef::cluster_scoped("Namespace", &record.reference.namespace);
            signals.hard(&record.reference, namespace, weights::HIGH, SignalSource::Namespace);
        }
        signals
    }
}

/// Pod-template references: volumes, `envFrom`, `env.valueFrom` and service accounts
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkloadReferenceExtractor;

impl WorkloadReferenceExtractor {
    fn volumes(record: &ResourceRecord, pod_spec: &Value, signals: &mut Signals) {
        let Some(volumes) = pod_spec.get("volumes") else {
            return;
        };
        let Some(volumes) = volumes.as_array() else {
            signals.warn(record, "spec volumes is not a list");
            return;
        };

        let namespace = &record.reference.namespace;
        for volume in volumes {
            if !volume.is_object() {
                signals.warn(record, "volume entry is not an object");
                continue;
            }

            let mounts = [
                ("configMap", "name", "ConfigMap"),
                ("secret", "secretName", "Secret"),
                ("persistentVolumeClaim", "claimName", "PersistentVolumeClaim"),
            ];
            for (field, name_field, kind) in mounts {
                if let Some(source) = volume.get(field) {
                    match source.get(name_field).and_then(Value::as_str) {
                        Some(name) if !name.is_empty() => signals.hard(
                            &record.reference,
                            ResourceRef::new(kind, namespace, name),
                            weights::HIGH,
                            SignalSource::Mount,
                        ),
                        _ => signals.warn(record, format!("{} volume without {}", field, name_field)),
                    }
                }
            }

            if let Some(sources) = volume.pointer("/projected/sources").and_then(Value::as_array) {
                for source in sources {
                    for (field, kind) in [("configMap", "ConfigMap"), ("secret", "Secret")] {
                        if let Some(name) = source.pointer(&format!("/{}/name", field)).and_then(Value::as_str) {
                            signals.hard(
                                &record.reference,
                                ResourceRef::new(kind, namespace, name),
                                weights::HIGH,
                                SignalSource::Mount,
                            );
                        }
                    }
                }
            }
        }
    }

    fn containers(record: &ResourceRecord, pod_spec: &Value, signals: &mut Signals) {
        let namespace = &record.reference.namespace;
        for list in ["containers", "initContainers"] {
            let Some(containers) = pod_spec.get(list) else {
                continue;
            };
            let Some(containers) = containers.as_array() else {
                signals.warn(record, format!("spec {} is not a list", list));
                continue;
            };

            for container in containers {
                for env_from in container
                    .get("envFrom")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    for (field, kind) in [("configMapRef", "ConfigMap"), ("secretRef", "Secret")] {
                        if let Some(source) = env_from.get(field) {
                            match source.get("name").and_then(Value::as_str) {
                                Some(name) if !name.is_empty() => signals.hard(
                                    &record.reference,
                                    ResourceRef::new(kind, namespace, name),
                                    weights::HIGH,
                                    SignalSource::Environment,
                                ),
                                _ => signals.warn(record, format!("envFrom {} without name", field)),
                            }
                        }
                    }
                }

                for env in container
                    .get("env")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    for (field, kind) in [("configMapKeyRef", "ConfigMap"), ("secretKeyRef", "Secret")] {
                        if let Some(source) = env.pointer(&format!("/valueFrom/{}", field)) {
                            match source.get("name").and_then(Value::as_str) {
                                Some(name) if !name.is_empty() => signals.hard(
                                    &record.reference,
                                    ResourceRef::new(kind, namespace, name),
                                    weights::HIGH,
                                    SignalSource::Environment,
                                ),
                                _ => signals.warn(record, format!("env {} without name", field)),
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Locates the pod spec inside a workload manifest
pub fn pod_spec(record: &ResourceRecord) -> Option<&Value> {
    let spec = &record.spec;
    match record.reference.kind.as_str() {
        "Pod" => Some(spec),
        "CronJob" => spec.pointer("/jobTemplate/spec/template/spec"),
        _ => spec.pointer("/template/spec"),
    }
}

/// Labels of the pods a workload manages
pub fn pod_labels(record: &ResourceRecord) -> BTreeMap<String, String> {
    let labels = match record.reference.kind.as_str() {
        "Pod" => return record.labels.clone(),
        "CronJob" => record.spec.pointer("/jobTemplate/spec/template/metadata/labels"),
        _ => record.spec.pointer("/template/metadata/labels"),
    };

    labels
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

impl SignalExtractor for WorkloadReferenceExtractor {
    fn name(&self) -> &'static str {
        "workload-references"
    }

    fn extract(&self, record: &ResourceRecord, _index: &ResourceIndex<'_>) -> Signals {
        let mut signals = Signals::default();
        let Some(spec) = pod_spec(record) else {
            return signals;
        };
        if !spec.is_object() {
            signals.warn(record, "pod template spec is not an object");
            return signals;
        }

        Self::volumes(record, spec, &mut signals);
        Self::containers(record, spec, &mut signals);

        match spec.get("serviceAccountName") {
            None => {}
            Some(Value::String(name)) if !name.is_empty() && name != "default" => signals.hard(
                &record.reference,
                ResourceRef::new("ServiceAccount", &record.reference.namespace, name),
                weights::HIGH,
                SignalSource::ServiceAccount,
            ),
            Some(Value::String(_)) => {}
            Some(_) => signals.warn(record, "serviceAccountName is not a string"),
        }

        signals
    }
}

/// Services depend on the workloads their selector targets
#[derive(Debug, Default, Clone, Copy)]
pub struct ServiceSelectorExtractor;

impl SignalExtractor for ServiceSelectorExtractor {
    fn name(&self) -> &'static str {
        "service-selector"
    }

    fn extract(&self, record: &ResourceRecord, index: &ResourceIndex<'_>) -> Signals {
        let mut signals = Signals::default();
        if record.reference.kind != "Service" {
            return signals;
        }
        let Some(selector) = record.spec.get("selector") else {
            return signals;
        };
        let Some(selector) = selector.as_object() else {
            signals.warn(record, "service selector is not a map");
            return signals;
        };

        let mut wanted = BTreeMap::new();
        for (key, value) in selector {
            match value.as_str() {
                Some(value) => {
                    wanted.insert(key.clone(), value.to_string());
                }
                None => signals.warn(record, format!("selector value for {} is not a string", key)),
            }
        }
        if wanted.is_empty() {
            return signals;
        }

        for candidate in index.in_namespace(&record.reference.namespace) {
            if pod_spec(candidate).is_none() || candidate.reference == record.reference {
                continue;
            }
            // Pods owned by a selected workload are reached through ownership
            if candidate.reference.kind == "Pod" && !candidate.owner_references.is_empty() {
                continue;
            }
            let labels = pod_labels(candidate);
            if wanted.iter().all(|(k, v)| labels.get(k) == Some(v)) {
                signals.hard(
                    &record.reference,
                    candidate.reference.clone(),
                    weights::HIGH,
                    SignalSource::Selector,
                );
            }
        }
        signals
    }
}

/// Ingresses depend on their backend services
#[derive(Debug, Default, Clone, Copy)]
pub struct IngressBackendExtractor;

impl IngressBackendExtractor {
    fn backend_service(backend: &Value) -> Option<&str> {
        backend
            .pointer("/service/name")
            .or_else(|| backend.get("serviceName"))
            .and_then(Value::as_str)
    }
}

impl SignalExtractor for IngressBackendExtractor {
    fn name(&self) -> &'static str {
        "ingress-backend"
    }

    fn extract(&self, record: &ResourceRecord, _index: &ResourceIndex<'_>) -> Signals {
        let mut signals = Signals::default();
        if record.reference.kind != "Ingress" {
            return signals;
        }

        let mut services = Vec::new();
        if let Some(default_backend) = record.spec.get("defaultBackend") {
            match Self::backend_service(default_backend) {
                Some(name) => services.push(name.to_string()),
                None => signals.warn(record, "default backend without service name"),
            }
        }

        match record.spec.get("rules") {
            None => {}
            Some(Value::Array(rules)) => {
                for rule in rules {
                    let paths = rule
                        .pointer("/http/paths")
                        .and_then(Value::as_array)
                        .into_iter()
                        .flatten();
                    for path in paths {
                        match path.get("backend").and_then(Self::backend_service) {
                            Some(name) => services.push(name.to_string()),
                            None => signals.warn(record, "ingress path without backend service"),
                        }
                    }
                }
            }
            Some(_) => signals.warn(record, "ingress rules is not a list"),
        }

        services.sort();
        services.dedup();
        for name in services {
            signals.hard(
                &record.reference,
                ResourceRef::new("Service", &record.reference.namespace, name),
                weights::HIGH,
                SignalSource::Backend,
            );
        }
        signals
    }
}

/// Dependencies declared through [`DEPENDS_ON_ANNOTATION`]
#[derive(Debug, Default, Clone, Copy)]
pub struct AnnotationExtractor;

impl AnnotationExtractor {
    /// Parses one `Kind/name[:weight]` entry
    fn parse_entry(entry: &str, namespace: &str) -> Result<(ResourceRef, u32), String> {
        let (target, weight) = match entry.rsplit_once(':') {
            Some((target, weight)) => {
                let weight = weight
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| format!("invalid weight in '{}'", entry))?;
                (target, weight)
            }
            None => (entry, weights::MEDIUM),
        };

        let reference = ResourceRef::parse(target, namespace)
            .ok_or_else(|| format!("invalid dependency reference '{}'", entry))?;
        Ok((reference, weight))
    }
}

impl SignalExtractor for AnnotationExtractor {
    fn name(&self) -> &'static str {
        "annotation"
    }

    fn extract(&self, record: &ResourceRecord, _index: &ResourceIndex<'_>) -> Signals {
        let mut signals = Signals::default();
        let Some(declared) = record.annotations.get(DEPENDS_ON_ANNOTATION) else {
            return signals;
        };

        for entry in declared.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match Self::parse_entry(entry, &record.reference.namespace) {
                Ok((target, _)) if target == record.reference => {
                    signals.warn(record, "declares a dependency on itself");
                }
                Ok((target, weight)) => {
                    signals.hard(&record.reference, target, weight, SignalSource::Annotation)
                }
                Err(message) => signals.warn(record, message),
            }
        }
        signals
    }
}

/// Reads [`PRIORITY_ANNOTATION`], if present and well-formed
pub fn declared_priority(record: &ResourceRecord) -> Option<std::result::Result<i32, String>> {
    record.annotations.get(PRIORITY_ANNOTATION).map(|value| {
        value
            .trim()
            .parse::<i32>()
            .map_err(|_| format!("{}: invalid priority '{}'", record.reference, value))
    })
}

/// Ordering rank of well-known kinds for colocation heuristics
///
/// Lower ranks are depended on by higher ranks in the same namespace.
pub fn kind_rank(kind: &str) -> Option<u8> {
    let rank = match kind {
        "Namespace" | "CustomResourceDefinition" => 0,
        "ServiceAccount" | "ConfigMap" | "Secret" | "PersistentVolumeClaim" | "Role" => 1,
        "RoleBinding" => 2,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" | "CronJob" | "Pod" => 3,
        "Service" => 4,
        "Ingress" | "HorizontalPodAutoscaler" | "PodDisruptionBudget" | "NetworkPolicy" => 5,
        _ => return None,
    };
    Some(rank)
}

/// The extractors used by a default analyzer
pub fn default_extractors() -> Vec<Box<dyn SignalExtractor>> {
    vec![
        Box::new(OwnershipExtractor),
        Box::new(NamespaceExtractor),
        Box::new(WorkloadReferenceExtractor),
        Box::new(ServiceSelectorExtractor),
        Box::new(IngressBackendExtractor),
        Box::new(AnnotationExtractor),
    ]
}
