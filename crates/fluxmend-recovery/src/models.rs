//! Data models for recovery planning and execution

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Edge weights assigned to each dependency signal
pub mod weights {
    /// Ownership (owner references)
    pub const MAX: u32 = 100;
    /// Structural references: mounts, env, selectors, backends
    pub const HIGH: u32 = 75;
    /// Annotation-declared dependencies without an explicit weight
    pub const MEDIUM: u32 = 50;
    /// Same-namespace colocation heuristics
    pub const LOW: u32 = 10;
}

/// Unique identity of a managed resource
///
/// Ordering is lexicographic over `(kind, name, namespace)` and is what every
/// tie-break in planning falls back to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource kind, e.g. `Deployment`
    pub kind: String,

    /// Resource name
    pub name: String,

    /// Namespace; empty for cluster-scoped resources
    #[serde(default)]
    pub namespace: String,
}

impl ResourceRef {
    /// Creates a namespaced reference
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Creates a cluster-scoped reference
    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, "", name)
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    /// Parses `Kind/name` (resolved in `default_namespace`) or `Kind/namespace/name`
    pub fn parse(value: &str, default_namespace: &str) -> Option<Self> {
        let parts: Vec<&str> = value.trim().split('/').map(str::trim).collect();
        match parts.as_slice() {
            [kind, name] if !kind.is_empty() && !name.is_empty() => {
                Some(Self::new(*kind, default_namespace, *name))
            }
            [kind, namespace, name] if !kind.is_empty() && !name.is_empty() => {
                Some(Self::new(*kind, *namespace, *name))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Owner link carried in resource metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
}

/// A resource as observed in (or desired for) the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Identity of the resource
    pub reference: ResourceRef,

    /// Owner links from metadata
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,

    /// Metadata labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Metadata annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Manifest body; extractors read references from here
    #[serde(default)]
    pub spec: Value,
}

impl ResourceRecord {
    /// Creates a record with empty metadata and spec
    pub fn new(reference: ResourceRef) -> Self {
        Self {
            reference,
            owner_references: Vec::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: Value::Null,
        }
    }

    pub fn with_owner(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.owner_references.push(OwnerReference {
            kind: kind.into(),
            name: name.into(),
        });
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }
}

/// Versioned, point-in-time view of the cluster
///
/// Planning always works against an explicit snapshot; re-planning takes a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Monotonic version assigned by the control plane
    pub version: u64,

    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,

    /// All resources visible at that version
    pub resources: Vec<ResourceRecord>,
}

impl ClusterSnapshot {
    pub fn new(version: u64, resources: Vec<ResourceRecord>) -> Self {
        Self {
            version,
            taken_at: Utc::now(),
            resources,
        }
    }

    /// Looks up a resource in the snapshot
    pub fn get(&self, reference: &ResourceRef) -> Option<&ResourceRecord> {
        self.resources.iter().find(|r| &r.reference == reference)
    }
}

/// Strength of a dependency edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Ordering preference only
    Soft,

    /// Target must be ready before the source can be recreated
    Hard,
}

/// Where a dependency edge was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Ownership,
    Namespace,
    Mount,
    Environment,
    ServiceAccount,
    Selector,
    Backend,
    Annotation,
    Colocation,
}

/// Directed dependency: `from` depends on `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Dependent resource
    pub from: ResourceRef,

    /// Resource that must exist first
    pub to: ResourceRef,

    /// Hard or soft
    pub dependency_type: DependencyType,

    /// Relative importance; lower weights are broken first in cycles
    pub weight: u32,

    /// Signal that produced the edge
    pub source: SignalSource,
}

impl DependencyEdge {
    pub fn hard(from: ResourceRef, to: ResourceRef, weight: u32, source: SignalSource) -> Self {
        Self {
            from,
            to,
            dependency_type: DependencyType::Hard,
            weight,
            source,
        }
    }

    pub fn soft(from: ResourceRef, to: ResourceRef, weight: u32, source: SignalSource) -> Self {
        Self {
            from,
            to,
            dependency_type: DependencyType::Soft,
            weight,
            source,
        }
    }

    pub fn is_hard(&self) -> bool {
        self.dependency_type == DependencyType::Hard
    }

    /// Whether this edge carries more ordering weight than `other`
    pub fn outranks(&self, other: &DependencyEdge) -> bool {
        (self.dependency_type, self.weight) > (other.dependency_type, other.weight)
    }
}

/// Lifecycle action performed on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationAction {
    Cleanup,
    Recreate,
}

impl fmt::Display for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationAction::Cleanup => write!(f, "cleanup"),
            OperationAction::Recreate => write!(f, "recreate"),
        }
    }
}

/// How a resource kind is replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Graceful replacement; apply and wait for readiness
    Rolling,

    /// Immutable identifying fields; wait for full removal before re-applying
    Recreate,

    /// Immediately consistent; a single call with no readiness wait
    Atomic,
}

/// State machine of a single operation
///
/// `Pending -> Validating -> Running -> {Succeeded, Failed}`; operations that
/// never started end in `NotStarted`, and rollback moves succeeded ones on to
/// `RolledBack` or `RollbackFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Validating,
    Running,
    Succeeded,
    Failed,
    NotStarted,
    RolledBack,
    RollbackFailed,
}

impl OperationState {
    /// Whether no further transition happens during execution
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            OperationState::Pending | OperationState::Validating | OperationState::Running
        )
    }
}

/// A single cleanup or recreation of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOperation {
    /// Operation identifier, unique within a plan
    pub id: String,

    /// Target resource
    pub resource: ResourceRef,

    /// Cleanup or recreate
    pub action: OperationAction,

    /// Replacement strategy for the resource kind
    pub strategy: Strategy,

    /// Effective priority used for intra-batch ordering
    pub priority: i32,

    /// Current state
    pub state: OperationState,
}

impl UpdateOperation {
    pub fn new(resource: ResourceRef, action: OperationAction, strategy: Strategy, priority: i32) -> Self {
        Self {
            id: format!("{}:{}", action, resource),
            resource,
            action,
            strategy,
            priority,
            state: OperationState::Pending,
        }
    }
}

/// Which half of a plan a batch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Cleanup,
    Recreation,
}

/// Operations that can run together at the same point of the sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Position of the batch within its phase, starting at 1
    pub number: usize,

    /// Cleanup or recreation
    pub phase: BatchPhase,

    /// Operations in execution order
    pub operations: Vec<UpdateOperation>,

    /// Whether the operations may run concurrently
    pub parallel_safe: bool,
}

impl Batch {
    /// Resources in this batch, in execution order
    pub fn resources(&self) -> Vec<ResourceRef> {
        self.operations.iter().map(|op| op.resource.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// A hard edge downgraded to soft to make the graph acyclic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleBreak {
    /// Nodes of the detected cycle, in traversal order
    pub cycle: Vec<ResourceRef>,

    /// Downgraded edge
    pub from: ResourceRef,
    pub to: ResourceRef,
    pub weight: u32,
}

impl CycleBreak {
    /// Recommendation text attached to the plan
    pub fn recommendation(&self) -> String {
        format!(
            "Circular dependency broken between {} and {}: dependency {} -> {} (weight {}) downgraded from hard to soft; manual review required",
            self.from, self.to, self.from, self.to, self.weight
        )
    }
}

/// Risk classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Blast radius and risk attached to every plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Overall level
    pub level: RiskLevel,

    /// Weighted impact score
    pub impact_score: f64,

    /// Resources directly depending on a target
    pub direct_dependents: usize,

    /// Resources reached transitively beyond the direct dependents
    pub indirect_dependents: usize,

    /// Human-readable contributing factors
    pub factors: Vec<String>,

    /// Whether the plan must not run without mitigation
    pub mitigation_required: bool,
}

/// Why recovery was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    StuckReconciliation,
    ImmutableFieldConflict,
    ScheduledUpdate,
    Manual,
}

/// Target set and reason supplied by an event source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryTrigger {
    pub reason: TriggerReason,
    pub resources: Vec<ResourceRecord>,
}

/// Complete, immutable recovery plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    /// Plan identifier
    pub id: String,

    /// Why the plan was requested
    pub reason: TriggerReason,

    /// Whether the plan was produced in dry-run mode
    pub dry_run: bool,

    /// Resources the plan cleans up and recreates, sorted
    pub target_resources: Vec<ResourceRef>,

    /// Removal order, dependents first
    pub cleanup_batches: Vec<Batch>,

    /// Creation order, dependencies first
    pub recreation_batches: Vec<Batch>,

    /// Blast radius and risk
    pub risk_assessment: RiskAssessment,

    /// Items requiring human attention
    pub recommendations: Vec<String>,

    /// Cycles broken while planning
    pub cycle_breaks: Vec<CycleBreak>,

    /// Snapshot version the plan was computed against
    pub snapshot_version: u64,

    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl RecoveryPlan {
    /// Cleanup batches followed by recreation batches
    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.cleanup_batches.iter().chain(self.recreation_batches.iter())
    }

    pub fn operation_count(&self) -> usize {
        self.batches().map(Batch::len).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Final record of a single operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub operation_id: String,
    pub resource: ResourceRef,
    pub action: OperationAction,
    pub state: OperationState,

    /// Control-plane attempts made for the mutating call
    pub attempts: u32,

    /// Failure description, when failed
    pub error: Option<String>,

    /// Stable error label, when failed
    pub error_kind: Option<String>,

    pub duration_ms: u64,
}

impl OperationOutcome {
    /// Outcome for an operation that was never submitted
    pub fn not_started(operation: &UpdateOperation) -> Self {
        Self {
            operation_id: operation.id.clone(),
            resource: operation.resource.clone(),
            action: operation.action,
            state: OperationState::NotStarted,
            attempts: 0,
            error: None,
            error_kind: None,
            duration_ms: 0,
        }
    }
}

/// Terminal status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Result of executing one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_number: usize,
    pub phase: BatchPhase,
    pub status: BatchStatus,

    /// One outcome per operation, in batch order
    pub outcomes: Vec<OperationOutcome>,

    pub duration_ms: u64,
}

impl BatchResult {
    pub fn succeeded(&self) -> bool {
        self.status == BatchStatus::Succeeded
    }
}

/// How a single ledger entry was handled during rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    RolledBack,
    RollbackFailed,

    /// Left in place because a surviving operation depends on it
    Retained,
}

/// Rollback record for one completed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEntryResult {
    pub resource: ResourceRef,

    /// Action that was reversed
    pub action: OperationAction,

    pub status: RollbackStatus,
    pub detail: Option<String>,
}

/// Full report of a rollback run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub plan_id: String,

    /// Entries in reversal order, most recent completion first
    pub entries: Vec<RollbackEntryResult>,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RollbackResult {
    pub fn empty(plan_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            plan_id: plan_id.into(),
            entries: Vec::new(),
            started_at: now,
            completed_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resources flagged for manual intervention
    pub fn manual_intervention_required(&self) -> Vec<ResourceRef> {
        self.entries
            .iter()
            .filter(|e| e.status == RollbackStatus::RollbackFailed)
            .map(|e| e.resource.clone())
            .collect()
    }

    pub fn fully_reversed(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.status != RollbackStatus::RollbackFailed)
    }
}

/// Lifecycle of a plan inside the recovery manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Planned,
    Executing,
    RollingBack,
    Succeeded,

    /// Failed with automatic rollback disabled
    Failed,

    /// Failed and every completed operation was reversed
    RolledBack,

    /// Failed and some reversals need manual action
    FailedManualIntervention,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded
                | ExecutionState::Failed
                | ExecutionState::RolledBack
                | ExecutionState::FailedManualIntervention
        )
    }
}

/// Snapshot of a plan's execution progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub plan_id: String,
    pub state: ExecutionState,

    /// Whether a cancellation was requested
    pub cancelled: bool,

    /// Batch currently running, as `(phase, number)`
    pub current_batch: Option<(BatchPhase, usize)>,

    pub completed_batches: usize,
    pub total_batches: usize,

    /// Per-resource outcomes of every operation processed so far, followed
    /// by the live states of the batch in flight
    pub outcomes: Vec<OperationOutcome>,

    /// Rollback report, once a rollback has run
    pub rollback: Option<RollbackResult>,

    pub updated_at: DateTime<Utc>,
}
