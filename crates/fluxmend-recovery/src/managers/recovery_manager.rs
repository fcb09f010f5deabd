//! Recovery manager: the plan / execute / rollback / status surface

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analyzers::signals::declared_priority;
use crate::analyzers::{DependencyAnalyzer, DependencyGraph, RiskAssessor};
use crate::config::RecoveryConfig;
use crate::control_plane::ControlPlane;
use crate::error::{OrchestrationError, Result};
use crate::managers::batch_planner::BatchPlanner;
use crate::managers::operation_executor::{BatchContext, OperationExecutor, OperationProgress};
use crate::managers::retry::RetryPolicy;
use crate::managers::rollback_manager::{RollbackLedger, RollbackManager};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::models::{
    Batch, BatchResult, BatchStatus, CycleBreak, ExecutionState, ExecutionStatus,
    OperationOutcome, OperationState, RecoveryPlan, RecoveryTrigger, ResourceRecord, ResourceRef,
    RollbackResult, RollbackStatus, TriggerReason,
};

/// Everything kept for a plan between planning and discard
struct PlanRecord {
    plan: Arc<RecoveryPlan>,
    desired: Arc<BTreeMap<ResourceRef, ResourceRecord>>,

    /// Planning graph, after cycle breaking
    graph: Arc<DependencyGraph>,

    ledger: Arc<RollbackLedger>,
    cancel: CancellationToken,

    /// Live states of the batch in flight
    progress: OperationProgress,

    status: ExecutionStatus,
}

impl PlanRecord {
    /// Status with the live states of the running batch folded in
    async fn live_status(&self) -> ExecutionStatus {
        let mut status = self.status.clone();
        let Some((phase, number)) = status.current_batch else {
            return status;
        };
        let Some(batch) = self
            .plan
            .batches()
            .find(|b| b.phase == phase && b.number == number)
        else {
            return status;
        };

        for operation in &batch.operations {
            let state = self
                .progress
                .state_of(&operation.id)
                .await
                .unwrap_or(OperationState::Pending);
            status.outcomes.push(OperationOutcome {
                state,
                ..OperationOutcome::not_started(operation)
            });
        }
        status
    }

    fn is_expired(&self, retention: chrono::Duration) -> bool {
        self.status.state.is_terminal() && Utc::now() - self.status.updated_at >= retention
    }
}

type PlanStore = Arc<RwLock<HashMap<String, PlanRecord>>>;

/// Coordinates planning, execution and rollback of recovery plans
///
/// Plans are immutable once computed and can be executed once. Execution
/// runs in a background task and reports each finished batch on a stream;
/// progress is also available at any time through [`RecoveryManager::status`].
/// Finished plans are evicted once `planning.plan_retention_secs` has passed
/// since their last update; [`RecoveryManager::discard`] forgets one earlier.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use fluxmend_recovery::{
///     InMemoryControlPlane, RecoveryConfig, RecoveryManager, ResourceRecord, ResourceRef,
/// };
///
/// # tokio_test::block_on(async {
/// let plane = Arc::new(InMemoryControlPlane::new());
/// let manager = RecoveryManager::new(plane, RecoveryConfig::default()).unwrap();
///
/// let cfg = ResourceRecord::new(ResourceRef::new("ConfigMap", "default", "cfg"));
/// let plan = manager.plan(vec![cfg], true).await.unwrap();
/// assert_eq!(plan.recreation_batches.len(), 1);
/// assert!(plan.recommendations.is_empty());
/// # });
/// ```
pub struct RecoveryManager {
    control_plane: Arc<dyn ControlPlane>,
    config: RecoveryConfig,
    analyzer: DependencyAnalyzer,
    metrics: Arc<dyn MetricsSink>,
    plans: PlanStore,
}

impl RecoveryManager {
    /// Creates a manager over `control_plane`
    ///
    /// # Arguments
    ///
    /// * `control_plane` - The cluster API to plan against and mutate
    /// * `config` - Planning, execution and risk configuration
    ///
    /// # Returns
    ///
    /// An error if the configuration is invalid
    pub fn new(control_plane: Arc<dyn ControlPlane>, config: RecoveryConfig) -> Result<Self> {
        config.validate()?;
        debug!(
            concurrency_limit = config.executor.concurrency_limit,
            auto_rollback = config.auto_rollback,
            "Creating RecoveryManager"
        );

        Ok(Self {
            control_plane,
            config,
            analyzer: DependencyAnalyzer::new(),
            metrics: Arc::new(NoopMetrics),
            plans: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_analyzer(mut self, analyzer: DependencyAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Plans cleanup and recreation of `resources`
    ///
    /// # Arguments
    ///
    /// * `resources` - Desired manifests of the resources to recover
    /// * `dry_run` - Validate every operation without mutating anything; the
    ///   resulting plan cannot be executed
    ///
    /// # Returns
    ///
    /// The plan, already registered for execution
    pub async fn plan(&self, resources: Vec<ResourceRecord>, dry_run: bool) -> Result<RecoveryPlan> {
        self.plan_with_reason(TriggerReason::Manual, resources, dry_run)
            .await
    }

    /// Plans the target set supplied by an event source
    pub async fn plan_for_trigger(&self, trigger: RecoveryTrigger, dry_run: bool) -> Result<RecoveryPlan> {
        self.plan_with_reason(trigger.reason, trigger.resources, dry_run)
            .await
    }

    async fn plan_with_reason(
        &self,
        reason: TriggerReason,
        resources: Vec<ResourceRecord>,
        dry_run: bool,
    ) -> Result<RecoveryPlan> {
        let snapshot = self.control_plane.snapshot().await?;

        let desired: BTreeMap<ResourceRef, ResourceRecord> = resources
            .into_iter()
            .map(|record| (record.reference.clone(), record))
            .collect();
        let targets: BTreeSet<ResourceRef> = desired.keys().cloned().collect();
        let target_records: Vec<ResourceRecord> = desired.values().cloned().collect();

        info!(
            reason = ?reason,
            targets = targets.len(),
            snapshot_version = snapshot.version,
            dry_run,
            "Planning recovery"
        );

        let full_graph = self.analyzer.discover_snapshot(&snapshot, &target_records);
        let mut graph = full_graph.subgraph(&targets);

        let cycle_breaks = if self.config.planning.break_cycles {
            graph.break_cycles()
        } else {
            if let Some(cycle) = graph.detect_cycles().first() {
                let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
                return Err(OrchestrationError::DependencyCycle(path.join(" -> ")));
            }
            Vec::new()
        };

        let mut recommendations: Vec<String> =
            cycle_breaks.iter().map(CycleBreak::recommendation).collect();

        let mut priorities = self.config.priorities.clone();
        for record in desired.values() {
            match declared_priority(record) {
                Some(Ok(priority)) => priorities.set_override(record.reference.clone(), priority),
                Some(Err(message)) => {
                    warn!("{}", message);
                    recommendations.push(message);
                }
                None => {}
            }
        }

        for warning in graph.warnings() {
            if targets
                .iter()
                .any(|t| warning.starts_with(&format!("{}: ", t)))
            {
                recommendations.push(format!("Dependency discovery: {}", warning));
            }
        }

        let batches = BatchPlanner::new(self.config.strategies.clone(), priorities.clone())
            .plan(&graph)?;

        let target_resources: Vec<ResourceRef> = targets.into_iter().collect();
        let risk_assessment = RiskAssessor::new(self.config.risk.clone(), priorities).assess(
            &full_graph,
            &target_resources,
            &cycle_breaks,
        );
        if risk_assessment.mitigation_required {
            recommendations.push(format!(
                "High risk (impact score {:.1}): review the blast radius before executing",
                risk_assessment.impact_score
            ));
        }

        let mut plan = RecoveryPlan {
            id: Uuid::new_v4().to_string(),
            reason,
            dry_run,
            target_resources,
            cleanup_batches: batches.cleanup,
            recreation_batches: batches.recreation,
            risk_assessment,
            recommendations,
            cycle_breaks,
            snapshot_version: snapshot.version,
            created_at: Utc::now(),
        };

        if dry_run {
            let failures = self.validate_plan(&plan, &desired).await;
            plan.recommendations.extend(failures);
        }

        info!(
            plan_id = %plan.id,
            cleanup_batches = plan.cleanup_batches.len(),
            recreation_batches = plan.recreation_batches.len(),
            risk = ?plan.risk_assessment.level,
            recommendations = plan.recommendations.len(),
            "Recovery plan created"
        );

        let record = PlanRecord {
            status: ExecutionStatus {
                plan_id: plan.id.clone(),
                state: ExecutionState::Planned,
                cancelled: false,
                current_batch: None,
                completed_batches: 0,
                total_batches: plan.cleanup_batches.len() + plan.recreation_batches.len(),
                outcomes: Vec::new(),
                rollback: None,
                updated_at: Utc::now(),
            },
            plan: Arc::new(plan.clone()),
            desired: Arc::new(desired),
            graph: Arc::new(graph),
            ledger: Arc::new(RollbackLedger::new(plan.id.clone())),
            cancel: CancellationToken::new(),
            progress: OperationProgress::new(),
        };
        let mut plans = self.plans.write().await;
        self.evict_expired(&mut plans);
        plans.insert(plan.id.clone(), record);

        Ok(plan)
    }

    /// Dry-runs every operation; returns one recommendation per failure
    async fn validate_plan(
        &self,
        plan: &RecoveryPlan,
        desired: &BTreeMap<ResourceRef, ResourceRecord>,
    ) -> Vec<String> {
        let executor = self.executor();
        let mut failures = Vec::new();

        for operation in plan.batches().flat_map(|b| b.operations.iter()) {
            if let Err(err) = executor
                .validate(operation, desired.get(&operation.resource))
                .await
            {
                debug!(operation = %operation.id, error = %err, "Dry-run validation failed");
                failures.push(format!(
                    "Dry-run {} of {} failed: {}",
                    operation.action, operation.resource, err
                ));
            }
        }

        failures
    }

    /// Starts executing a plan
    ///
    /// # Arguments
    ///
    /// * `plan_id` - The plan to execute; each plan executes at most once
    ///
    /// # Returns
    ///
    /// A stream yielding one result per finished batch. The stream ends once
    /// the plan reaches a terminal state, including any automatic rollback.
    pub async fn execute(&self, plan_id: &str) -> Result<ReceiverStream<BatchResult>> {
        let (plan, context, graph) = {
            let mut plans = self.plans.write().await;
            let record = plans
                .get_mut(plan_id)
                .ok_or_else(|| OrchestrationError::PlanNotFound(plan_id.to_string()))?;

            if record.plan.dry_run {
                return Err(OrchestrationError::PlanNotExecutable(format!(
                    "{} was planned in dry-run mode",
                    plan_id
                )));
            }
            match record.status.state {
                ExecutionState::Planned => {}
                ExecutionState::Executing | ExecutionState::RollingBack => {
                    return Err(OrchestrationError::PlanBusy(plan_id.to_string()))
                }
                _ if record.status.cancelled => {
                    return Err(OrchestrationError::Cancelled(plan_id.to_string()))
                }
                _ => return Err(OrchestrationError::PlanAlreadyConsumed(plan_id.to_string())),
            }

            record.status.state = ExecutionState::Executing;
            record.status.updated_at = Utc::now();
            let context = BatchContext {
                desired: record.desired.clone(),
                ledger: record.ledger.clone(),
                cancel: record.cancel.clone(),
                progress: record.progress.clone(),
            };
            (record.plan.clone(), context, record.graph.clone())
        };

        let (tx, rx) = mpsc::channel(plan.batches().count().max(1));
        let run = PlanRun {
            plan,
            context,
            graph,
            executor: self.executor(),
            rollback: self.rollback_manager(),
            auto_rollback: self.config.auto_rollback,
            plans: self.plans.clone(),
            tx,
        };
        tokio::spawn(run.run());

        Ok(ReceiverStream::new(rx))
    }

    /// Reverses every completed operation of a plan
    ///
    /// Rolling back a plan with nothing completed, or rolling back twice,
    /// returns an empty result.
    pub async fn rollback(&self, plan_id: &str) -> Result<RollbackResult> {
        let (ledger, graph, previous) = {
            let mut plans = self.plans.write().await;
            let record = plans
                .get_mut(plan_id)
                .ok_or_else(|| OrchestrationError::PlanNotFound(plan_id.to_string()))?;

            let previous = record.status.state;
            if matches!(previous, ExecutionState::Executing | ExecutionState::RollingBack) {
                return Err(OrchestrationError::PlanBusy(plan_id.to_string()));
            }
            record.status.state = ExecutionState::RollingBack;
            (record.ledger.clone(), record.graph.clone(), previous)
        };

        let result = self.rollback_manager().rollback(&ledger, &graph).await;

        let mut plans = self.plans.write().await;
        if let Some(record) = plans.get_mut(plan_id) {
            if result.is_empty() {
                record.status.state = previous;
            } else {
                record_rollback(&mut record.status, &result);
            }
            record.status.updated_at = Utc::now();
        }

        Ok(result)
    }

    /// Current execution state of a plan
    ///
    /// While a batch runs, its operations appear in `outcomes` with their
    /// live state (`Pending`, `Validating`, `Running` or terminal).
    pub async fn status(&self, plan_id: &str) -> Result<ExecutionStatus> {
        let plans = self.plans.read().await;
        let record = plans
            .get(plan_id)
            .ok_or_else(|| OrchestrationError::PlanNotFound(plan_id.to_string()))?;
        Ok(record.live_status().await)
    }

    /// Stops submitting operations; completed work is rolled back if `auto_rollback` is set
    ///
    /// A plan cancelled before it starts is settled at once, with every
    /// operation `NotStarted`, and can no longer be executed.
    pub async fn cancel(&self, plan_id: &str) -> Result<()> {
        let mut plans = self.plans.write().await;
        let record = plans
            .get_mut(plan_id)
            .ok_or_else(|| OrchestrationError::PlanNotFound(plan_id.to_string()))?;

        info!(plan_id, state = ?record.status.state, "Cancelling plan");
        record.cancel.cancel();
        record.status.cancelled = true;
        if record.status.state == ExecutionState::Planned {
            record.status.outcomes = record
                .plan
                .batches()
                .flat_map(|b| b.operations.iter().map(OperationOutcome::not_started))
                .collect();
            record.status.state = if self.config.auto_rollback {
                ExecutionState::RolledBack
            } else {
                ExecutionState::Failed
            };
        }
        record.status.updated_at = Utc::now();
        Ok(())
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<RecoveryPlan> {
        self.plans
            .read()
            .await
            .get(plan_id)
            .map(|record| record.plan.as_ref().clone())
            .ok_or_else(|| OrchestrationError::PlanNotFound(plan_id.to_string()))
    }

    /// Registered plan identifiers, sorted
    pub async fn plan_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plans.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forgets a plan that is not executing or rolling back
    pub async fn discard(&self, plan_id: &str) -> Result<()> {
        let mut plans = self.plans.write().await;
        let state = plans
            .get(plan_id)
            .map(|record| record.status.state)
            .ok_or_else(|| OrchestrationError::PlanNotFound(plan_id.to_string()))?;

        if matches!(state, ExecutionState::Executing | ExecutionState::RollingBack) {
            return Err(OrchestrationError::PlanBusy(plan_id.to_string()));
        }
        plans.remove(plan_id);
        debug!(plan_id, "Plan discarded");
        Ok(())
    }

    /// Drops finished plans older than the retention window
    fn evict_expired(&self, plans: &mut HashMap<String, PlanRecord>) {
        let Ok(retention) = chrono::Duration::from_std(self.config.planning.plan_retention()) else {
            return;
        };
        let before = plans.len();
        plans.retain(|_, record| !record.is_expired(retention));
        if plans.len() < before {
            debug!(evicted = before - plans.len(), "Evicted finished plans");
        }
    }

    fn executor(&self) -> OperationExecutor {
        OperationExecutor::new(
            self.control_plane.clone(),
            self.config.executor.clone(),
            self.metrics.clone(),
        )
    }

    fn rollback_manager(&self) -> RollbackManager {
        RollbackManager::new(
            self.control_plane.clone(),
            RetryPolicy::from_config(&self.config.executor),
            self.metrics.clone(),
        )
        .with_timeout(self.config.executor.operation_timeout())
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("config", &self.config)
            .field("analyzer", &self.analyzer)
            .finish_non_exhaustive()
    }
}

/// Background execution of one plan
struct PlanRun {
    plan: Arc<RecoveryPlan>,
    context: BatchContext,
    graph: Arc<DependencyGraph>,
    executor: OperationExecutor,
    rollback: RollbackManager,
    auto_rollback: bool,
    plans: PlanStore,
    tx: mpsc::Sender<BatchResult>,
}

impl PlanRun {
    async fn run(self) {
        let plan_id = self.plan.id.clone();
        let batches: Vec<&Batch> = self.plan.batches().collect();
        info!(plan_id = %plan_id, batches = batches.len(), "Executing plan");

        let mut halted = None;
        let mut executed = 0;

        for batch in &batches {
            if self.context.cancel.is_cancelled() {
                halted = Some(BatchStatus::Cancelled);
                break;
            }

            self.update(|status| status.current_batch = Some((batch.phase, batch.number)))
                .await;
            let result = self.executor.execute_batch(batch, &self.context).await;
            executed += 1;

            self.update(|status| {
                status.current_batch = None;
                status.completed_batches += 1;
                status.outcomes.extend(result.outcomes.iter().cloned());
            })
            .await;
            self.context.progress.clear().await;

            let batch_status = result.status;
            if self.tx.send(result).await.is_err() {
                debug!(plan_id = %plan_id, "Execution stream receiver dropped");
            }
            if batch_status != BatchStatus::Succeeded {
                halted = Some(batch_status);
                break;
            }
        }

        let Some(batch_status) = halted else {
            self.update(|status| status.state = ExecutionState::Succeeded)
                .await;
            info!(plan_id = %plan_id, "Plan succeeded");
            return;
        };

        let not_started: Vec<OperationOutcome> = batches[executed..]
            .iter()
            .flat_map(|b| b.operations.iter().map(OperationOutcome::not_started))
            .collect();
        self.update(|status| status.outcomes.extend(not_started))
            .await;

        if !self.auto_rollback {
            warn!(plan_id = %plan_id, status = ?batch_status, "Plan halted; automatic rollback disabled");
            self.update(|status| status.state = ExecutionState::Failed)
                .await;
            return;
        }

        warn!(plan_id = %plan_id, status = ?batch_status, "Plan halted; rolling back");
        self.update(|status| status.state = ExecutionState::RollingBack)
            .await;
        let result = self.rollback.rollback(&self.context.ledger, &self.graph).await;
        self.update(|status| record_rollback(status, &result)).await;
    }

    async fn update(&self, apply: impl FnOnce(&mut ExecutionStatus)) {
        let mut plans = self.plans.write().await;
        if let Some(record) = plans.get_mut(&self.plan.id) {
            apply(&mut record.status);
            record.status.updated_at = Utc::now();
        }
    }
}

/// Folds a rollback report into a plan's status
fn record_rollback(status: &mut ExecutionStatus, result: &RollbackResult) {
    for entry in &result.entries {
        let state = match entry.status {
            RollbackStatus::RolledBack => OperationState::RolledBack,
            RollbackStatus::RollbackFailed => OperationState::RollbackFailed,
            RollbackStatus::Retained => continue,
        };
        if let Some(outcome) = status.outcomes.iter_mut().rev().find(|o| {
            o.resource == entry.resource
                && o.action == entry.action
                && o.state == OperationState::Succeeded
        }) {
            outcome.state = state;
        }
    }

    status.state = if result.fully_reversed() {
        ExecutionState::RolledBack
    } else {
        ExecutionState::FailedManualIntervention
    };
    status.rollback = Some(result.clone());
}
