//! Fluxmend Recovery
//!
//! Dependency-aware cleanup, recreation and rollback of GitOps-managed cluster
//! resources. A [`RecoveryManager`] discovers how the target resources depend on
//! each other, groups their operations into ordered batches, executes them under
//! a concurrency limit and reverses completed work when something goes wrong.

pub mod analyzers;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod managers;
pub mod metrics;
pub mod models;

pub use analyzers::{DependencyAnalyzer, DependencyGraph, RiskAssessor};
pub use config::{
    ConfigLoadResult, ConfigSource, ExecutorConfig, PlanningConfig, PriorityTable, RecoveryConfig,
    RiskConfig, StrategyTable,
};
pub use control_plane::{CallKind, ControlPlane, ControlPlaneCall, InMemoryControlPlane};
pub use error::{OrchestrationError, Result};
pub use managers::{
    BatchContext, BatchPlanner, OperationExecutor, OperationProgress, PlannedBatches,
    RecoveryManager, RetryPolicy, RollbackLedger, RollbackManager,
};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use models::{
    Batch, BatchPhase, BatchResult, BatchStatus, ClusterSnapshot, CycleBreak, DependencyEdge,
    DependencyType, ExecutionState, ExecutionStatus, OperationAction, OperationOutcome,
    OperationState, OwnerReference, RecoveryPlan, RecoveryTrigger, ResourceRecord, ResourceRef,
    RiskAssessment, RiskLevel, RollbackEntryResult, RollbackResult, RollbackStatus, SignalSource,
    Strategy, TriggerReason, UpdateOperation,
};
