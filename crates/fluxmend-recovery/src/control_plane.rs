//! Resource control-plane interface and an in-memory implementation
//!
//! The orchestrator is a client of the control plane: it never reimplements
//! apply/delete semantics, it only calls them. [`InMemoryControlPlane`] is a
//! faithful stand-in for simulation and tests, with fault injection for the
//! failure modes the executor has to survive.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{OrchestrationError, Result};
use crate::models::{ClusterSnapshot, ResourceRecord, ResourceRef};

/// Operations the orchestrator needs from the cluster API
///
/// Dry-run calls must be idempotent and must never mutate state.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Point-in-time view of every managed resource
    async fn snapshot(&self) -> Result<ClusterSnapshot>;

    /// Current state of a resource, `None` when absent
    async fn get(&self, resource: &ResourceRef) -> Result<Option<ResourceRecord>>;

    /// Creates or updates a resource
    async fn apply(&self, record: &ResourceRecord, dry_run: bool) -> Result<()>;

    /// Deletes a resource; deleting an absent resource yields `ResourceNotFound`
    async fn delete(&self, resource: &ResourceRef, dry_run: bool) -> Result<()>;

    /// Kind-specific readiness condition
    async fn is_ready(&self, resource: &ResourceRef) -> Result<bool>;
}

/// Mutating call kinds, for fault injection and the call journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Apply,
    Delete,
}

/// One apply or delete call received by the in-memory control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneCall {
    pub kind: CallKind,
    pub resource: ResourceRef,
    pub dry_run: bool,

    /// Whether the call was accepted
    pub accepted: bool,
}

#[derive(Debug, Default)]
struct ClusterState {
    version: u64,
    resources: BTreeMap<ResourceRef, ResourceRecord>,

    /// Remaining injected unavailability per real (non dry-run) call
    transient_failures: HashMap<(CallKind, ResourceRef), u32>,

    /// Permanent rejections of real (non dry-run) calls
    rejections: HashMap<(CallKind, ResourceRef), String>,

    /// Rejections of dry-run calls
    dry_run_rejections: HashMap<(CallKind, ResourceRef), String>,

    never_ready: BTreeSet<ResourceRef>,

    /// Readiness polls to answer `false` before reporting ready
    pending_readiness: HashMap<ResourceRef, u32>,

    unavailable: bool,
    journal: Vec<ControlPlaneCall>,
}

impl ClusterState {
    fn fault(&mut self, kind: CallKind, resource: &ResourceRef, dry_run: bool) -> Option<OrchestrationError> {
        if self.unavailable {
            return Some(OrchestrationError::ControlPlaneUnavailable(
                "control plane is unreachable".to_string(),
            ));
        }

        let key = (kind, resource.clone());
        if let Some(remaining) = self.transient_failures.get_mut(&key).filter(|_| !dry_run) {
            if *remaining > 0 {
                *remaining -= 1;
                return Some(OrchestrationError::ControlPlaneUnavailable(format!(
                    "{:?} {}: service unavailable",
                    kind, resource
                )));
            }
        }

        let rejections = if dry_run {
            &self.dry_run_rejections
        } else {
            &self.rejections
        };
        rejections
            .get(&key)
            .map(|reason| OrchestrationError::ControlPlaneRejected(format!("{}: {}", resource, reason)))
    }

    fn record(&mut self, kind: CallKind, resource: &ResourceRef, dry_run: bool, accepted: bool) {
        self.journal.push(ControlPlaneCall {
            kind,
            resource: resource.clone(),
            dry_run,
            accepted,
        });
    }
}

/// In-memory control plane with fault injection
#[derive(Debug, Default)]
pub struct InMemoryControlPlane {
    state: RwLock<ClusterState>,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a control plane that already holds `resources`
    pub fn with_resources(resources: impl IntoIterator<Item = ResourceRecord>) -> Self {
        let state = ClusterState {
            version: 1,
            resources: resources
                .into_iter()
                .map(|r| (r.reference.clone(), r))
                .collect(),
            ..ClusterState::default()
        };
        Self {
            state: RwLock::new(state),
        }
    }

    /// Makes the next `times` real `kind` calls on `resource` fail as unavailable
    pub async fn fail_transiently(&self, kind: CallKind, resource: ResourceRef, times: u32) {
        self.state
            .write()
            .await
            .transient_failures
            .insert((kind, resource), times);
    }

    /// Rejects every real `kind` call on `resource`
    pub async fn reject(&self, kind: CallKind, resource: ResourceRef, reason: impl Into<String>) {
        self.state
            .write()
            .await
            .rejections
            .insert((kind, resource), reason.into());
    }

    /// Rejects every dry-run `kind` call on `resource`
    pub async fn reject_dry_run(&self, kind: CallKind, resource: ResourceRef, reason: impl Into<String>) {
        self.state
            .write()
            .await
            .dry_run_rejections
            .insert((kind, resource), reason.into());
    }

    /// Keeps `resource` unready forever
    pub async fn never_ready(&self, resource: ResourceRef) {
        self.state.write().await.never_ready.insert(resource);
    }

    /// Reports `resource` unready for the next `polls` readiness checks
    pub async fn delay_readiness(&self, resource: ResourceRef, polls: u32) {
        self.state
            .write()
            .await
            .pending_readiness
            .insert(resource, polls);
    }

    /// Makes every call fail as unavailable until switched back
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Every apply and delete call received so far, in order
    pub async fn journal(&self) -> Vec<ControlPlaneCall> {
        self.state.read().await.journal.clone()
    }

    /// Accepted, non dry-run calls for `resource`
    pub async fn mutations_of(&self, resource: &ResourceRef) -> Vec<CallKind> {
        self.state
            .read()
            .await
            .journal
            .iter()
            .filter(|c| &c.resource == resource && !c.dry_run && c.accepted)
            .map(|c| c.kind)
            .collect()
    }

    pub async fn contains(&self, resource: &ResourceRef) -> bool {
        self.state.read().await.resources.contains_key(resource)
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn snapshot(&self) -> Result<ClusterSnapshot> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(OrchestrationError::ControlPlaneUnavailable(
                "control plane is unreachable".to_string(),
            ));
        }
        Ok(ClusterSnapshot::new(
            state.version,
            state.resources.values().cloned().collect(),
        ))
    }

    async fn get(&self, resource: &ResourceRef) -> Result<Option<ResourceRecord>> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(OrchestrationError::ControlPlaneUnavailable(
                "control plane is unreachable".to_string(),
            ));
        }
        Ok(state.resources.get(resource).cloned())
    }

    async fn apply(&self, record: &ResourceRecord, dry_run: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let resource = &record.reference;

        if let Some(err) = state.fault(CallKind::Apply, resource, dry_run) {
            state.record(CallKind::Apply, resource, dry_run, false);
            return Err(err);
        }

        state.record(CallKind::Apply, resource, dry_run, true);
        if !dry_run {
            state.version += 1;
            state.resources.insert(resource.clone(), record.clone());
            debug!(resource = %resource, version = state.version, "Applied resource");
        }
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef, dry_run: bool) -> Result<()> {
        let mut state = self.state.write().await;

        if let Some(err) = state.fault(CallKind::Delete, resource, dry_run) {
            state.record(CallKind::Delete, resource, dry_run, false);
            return Err(err);
        }

        if !state.resources.contains_key(resource) {
            state.record(CallKind::Delete, resource, dry_run, false);
            return Err(OrchestrationError::ResourceNotFound(resource.to_string()));
        }

        state.record(CallKind::Delete, resource, dry_run, true);
        if !dry_run {
            state.version += 1;
            state.resources.remove(resource);
            debug!(resource = %resource, version = state.version, "Deleted resource");
        }
        Ok(())
    }

    async fn is_ready(&self, resource: &ResourceRef) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(OrchestrationError::ControlPlaneUnavailable(
                "control plane is unreachable".to_string(),
            ));
        }
        if !state.resources.contains_key(resource) || state.never_ready.contains(resource) {
            return Ok(false);
        }
        if let Some(remaining) = state.pending_readiness.get_mut(resource) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ResourceRef {
        ResourceRef::new("ConfigMap", "default", "cfg")
    }

    #[tokio::test]
    async fn test_apply_and_delete() {
        let plane = InMemoryControlPlane::new();
        let record = ResourceRecord::new(cfg());

        plane.apply(&record, false).await.unwrap();
        assert!(plane.contains(&cfg()).await);
        assert_eq!(plane.version().await, 1);

        plane.delete(&cfg(), false).await.unwrap();
        assert!(!plane.contains(&cfg()).await);
        assert!(matches!(
            plane.delete(&cfg(), false).await,
            Err(OrchestrationError::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dry_run_never_mutates() {
        let plane = InMemoryControlPlane::with_resources(vec![ResourceRecord::new(cfg())]);

        plane.delete(&cfg(), true).await.unwrap();
        assert!(plane.contains(&cfg()).await);
        assert!(plane.mutations_of(&cfg()).await.is_empty());
        assert_eq!(plane.journal().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_consumed() {
        let plane = InMemoryControlPlane::new();
        plane.fail_transiently(CallKind::Apply, cfg(), 2).await;
        let record = ResourceRecord::new(cfg());

        for _ in 0..2 {
            let err = plane.apply(&record, false).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(plane.apply(&record, false).await.is_ok());
        assert_eq!(plane.mutations_of(&cfg()).await, vec![CallKind::Apply]);
    }

    #[tokio::test]
    async fn test_rejections_split_by_dry_run() {
        let plane = InMemoryControlPlane::new();
        plane.reject_dry_run(CallKind::Apply, cfg(), "invalid data").await;
        let record = ResourceRecord::new(cfg());

        let err = plane.apply(&record, true).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ControlPlaneRejected(_)));
        assert!(plane.apply(&record, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_readiness() {
        let plane = InMemoryControlPlane::with_resources(vec![ResourceRecord::new(cfg())]);
        plane.delay_readiness(cfg(), 2).await;

        assert!(!plane.is_ready(&cfg()).await.unwrap());
        assert!(!plane.is_ready(&cfg()).await.unwrap());
        assert!(plane.is_ready(&cfg()).await.unwrap());

        plane.never_ready(cfg()).await;
        assert!(!plane.is_ready(&cfg()).await.unwrap());

        let missing = ResourceRef::new("Secret", "default", "missing");
        assert!(!plane.is_ready(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_plane() {
        let plane = InMemoryControlPlane::new();
        plane.set_unavailable(true).await;
        assert!(plane.snapshot().await.unwrap_err().is_transient());
        assert!(plane.get(&cfg()).await.unwrap_err().is_transient());
    }
}
