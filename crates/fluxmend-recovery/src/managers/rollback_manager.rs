//! Rollback ledger and best-effort reversal of completed operations
//!
//! The executor appends an entry for every operation whose mutating call was
//! accepted, together with the resource state observed just before the call.
//! Rollback replays the ledger most-recent first and reports every entry,
//! whether or not it could be reversed.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analyzers::DependencyGraph;
use crate::control_plane::ControlPlane;
use crate::error::{OrchestrationError, Result};
use crate::managers::retry::RetryPolicy;
use crate::metrics::{MetricsSink, ROLLBACKS_TOTAL};
use crate::config::ExecutorConfig;
use crate::models::{
    OperationAction, OperationState, ResourceRecord, ResourceRef, RollbackEntryResult, RollbackResult,
    RollbackStatus, UpdateOperation,
};

/// Handle to a prior-state snapshot kept by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotRef(Uuid);

impl SnapshotRef {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One completed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub operation: UpdateOperation,

    /// State before the mutation, if the resource existed
    pub prior_state: Option<SnapshotRef>,

    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    entries: Vec<LedgerEntry>,
    snapshots: HashMap<SnapshotRef, ResourceRecord>,
}

/// Append-only record of completed operations for one plan
///
/// Appends are serialized. Rollback drains the whole ledger in one step, so
/// each entry is consumed exactly once.
#[derive(Debug)]
pub struct RollbackLedger {
    plan_id: String,
    inner: Mutex<LedgerInner>,
}

impl RollbackLedger {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    /// Records a completed operation and the state it replaced
    pub async fn append(
        &self,
        operation: UpdateOperation,
        prior_state: Option<ResourceRecord>,
    ) -> Option<SnapshotRef> {
        let mut inner = self.inner.lock().await;
        let snapshot = prior_state.map(|record| {
            let snapshot = SnapshotRef::new();
            inner.snapshots.insert(snapshot, record);
            snapshot
        });

        debug!(
            plan_id = %self.plan_id,
            operation = %operation.id,
            snapshot = ?snapshot,
            "Ledger entry appended"
        );
        inner.entries.push(LedgerEntry {
            operation,
            prior_state: snapshot,
            completed_at: Utc::now(),
        });
        snapshot
    }

    /// Records the final execution state of a ledgered operation
    pub async fn settle(&self, operation_id: &str, state: OperationState) {
        let mut inner = self.inner.lock().await;
        for entry in inner
            .entries
            .iter_mut()
            .filter(|e| e.operation.id == operation_id)
        {
            entry.operation.state = state;
        }
    }

    /// Entries in completion order
    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.lock().await.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Takes every entry and snapshot, leaving the ledger empty
    async fn drain(&self) -> (Vec<LedgerEntry>, HashMap<SnapshotRef, ResourceRecord>) {
        let mut inner = self.inner.lock().await;
        let drained = std::mem::take(&mut *inner);
        (drained.entries, drained.snapshots)
    }
}

/// Reverses completed operations on failure or on request
pub struct RollbackManager {
    control_plane: Arc<dyn ControlPlane>,
    retry: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,

    /// Budget for reversing a single entry, retries included
    reversal_timeout: Duration,
}

impl RollbackManager {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        retry: RetryPolicy,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            control_plane,
            retry,
            metrics,
            reversal_timeout: ExecutorConfig::default().operation_timeout(),
        }
    }

    pub fn with_timeout(mut self, reversal_timeout: Duration) -> Self {
        self.reversal_timeout = reversal_timeout;
        self
    }

    /// Consumes the ledger and reverses its entries, most recent first
    ///
    /// - Entries with a prior snapshot are reversed by re-applying it.
    /// - Recreations of previously absent resources are reversed by deleting
    ///   them, unless a resource that is still in place depends on them, in
    ///   which case they are `Retained`.
    /// - Cleanups of resources that were already absent need no reversal.
    ///
    /// Never fails: every reversal failure is reported as `RollbackFailed`.
    /// A second call on the same ledger returns an empty result.
    pub async fn rollback(&self, ledger: &RollbackLedger, graph: &DependencyGraph) -> RollbackResult {
        let (entries, snapshots) = ledger.drain().await;
        if entries.is_empty() {
            debug!(plan_id = %ledger.plan_id(), "Nothing to roll back");
            return RollbackResult::empty(ledger.plan_id());
        }

        let started_at = Utc::now();
        info!(
            plan_id = %ledger.plan_id(),
            entries = entries.len(),
            "Starting rollback"
        );
        self.metrics.increment(ROLLBACKS_TOTAL, 1);

        // Resources this plan brought into existence that are still present
        let mut surviving: BTreeSet<ResourceRef> = entries
            .iter()
            .filter(|e| e.operation.action == OperationAction::Recreate)
            .map(|e| e.operation.resource.clone())
            .collect();

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries.iter().rev() {
            let prior = entry.prior_state.and_then(|s| snapshots.get(&s));
            let result = self.reverse(entry, prior, graph, &mut surviving).await;

            match result.status {
                RollbackStatus::RolledBack => debug!(
                    resource = %result.resource,
                    action = %result.action,
                    "Operation rolled back"
                ),
                RollbackStatus::Retained => warn!(
                    resource = %result.resource,
                    detail = ?result.detail,
                    "Recreated resource retained"
                ),
                RollbackStatus::RollbackFailed => error!(
                    resource = %result.resource,
                    detail = ?result.detail,
                    "Rollback failed; manual intervention required"
                ),
            }
            results.push(result);
        }

        let failed = results
            .iter()
            .filter(|r| r.status == RollbackStatus::RollbackFailed)
            .count();
        info!(
            plan_id = %ledger.plan_id(),
            reversed = results.len() - failed,
            failed,
            "Rollback finished"
        );

        RollbackResult {
            plan_id: ledger.plan_id().to_string(),
            entries: results,
            started_at,
            completed_at: Utc::now(),
        }
    }

    async fn reverse(
        &self,
        entry: &LedgerEntry,
        prior: Option<&ResourceRecord>,
        graph: &DependencyGraph,
        surviving: &mut BTreeSet<ResourceRef>,
    ) -> RollbackEntryResult {
        let operation = &entry.operation;
        let resource = operation.resource.clone();
        let outcome = |status: RollbackStatus, detail: Option<String>| RollbackEntryResult {
            resource: resource.clone(),
            action: operation.action,
            status,
            detail,
        };

        if let Some(record) = prior {
            let result = self
                .bounded(&resource, async {
                    self.retry
                        .run("rollback apply", || self.control_plane.apply(record, false))
                        .await
                        .0
                })
                .await;
            return match result {
                Ok(()) => outcome(RollbackStatus::RolledBack, Some("prior state restored".to_string())),
                Err(err) => outcome(RollbackStatus::RollbackFailed, Some(failure(&resource, err))),
            };
        }

        if operation.action == OperationAction::Cleanup {
            return outcome(
                RollbackStatus::RolledBack,
                Some("resource was absent before cleanup".to_string()),
            );
        }

        let blockers: Vec<String> = graph
            .dependents(&resource, true)
            .into_iter()
            .filter(|d| surviving.contains(d))
            .map(|d| d.to_string())
            .collect();
        if !blockers.is_empty() {
            return outcome(
                RollbackStatus::Retained,
                Some(format!("still required by {}", blockers.join(", "))),
            );
        }

        let result = self
            .bounded(&resource, async {
                self.retry
                    .run("rollback delete", || self.control_plane.delete(&resource, false))
                    .await
                    .0
            })
            .await;
        match result {
            Ok(()) | Err(OrchestrationError::ResourceNotFound(_)) => {
                surviving.remove(&resource);
                outcome(RollbackStatus::RolledBack, Some("recreated resource removed".to_string()))
            }
            Err(err) => outcome(RollbackStatus::RollbackFailed, Some(failure(&resource, err))),
        }
    }

    /// Runs one reversal within `reversal_timeout`
    async fn bounded(
        &self,
        resource: &ResourceRef,
        reversal: impl std::future::Future<Output = Result<()>>,
    ) -> Result<()> {
        match timeout(self.reversal_timeout, reversal).await {
            Ok(result) => result,
            Err(_) => Err(OrchestrationError::OperationTimeout {
                resource: resource.to_string(),
                timeout_secs: self.reversal_timeout.as_secs(),
            }),
        }
    }
}

fn failure(resource: &ResourceRef, err: OrchestrationError) -> String {
    OrchestrationError::RollbackFailed {
        resource: resource.to_string(),
        reason: err.to_string(),
    }
    .to_string()
}

impl fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackManager")
            .field("retry", &self.retry)
            .field("reversal_timeout", &self.reversal_timeout)
            .finish_non_exhaustive()
    }
}
