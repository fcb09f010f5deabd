//! Batch execution against the control plane
//!
//! Every operation goes `Pending -> Validating -> Running -> {Succeeded, Failed}`.
//! Validation is a dry-run of the exact call that would follow, so an
//! operation that fails validation never mutates anything.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::control_plane::ControlPlane;
use crate::error::{OrchestrationError, Result};
use crate::managers::retry::RetryPolicy;
use crate::managers::rollback_manager::RollbackLedger;
use crate::metrics::{
    MetricsSink, BATCH_DURATION_SECONDS, OPERATIONS_TOTAL, OPERATION_DURATION_SECONDS,
    OPERATION_FAILURES_TOTAL,
};
use crate::models::{
    Batch, BatchResult, BatchStatus, OperationAction, OperationOutcome, OperationState,
    ResourceRecord, ResourceRef, Strategy, UpdateOperation,
};

/// Everything a batch needs besides its operations
#[derive(Debug, Clone)]
pub struct BatchContext {
    /// Desired manifests for recreation, keyed by resource
    pub desired: Arc<BTreeMap<ResourceRef, ResourceRecord>>,

    /// Ledger receiving every accepted mutation
    pub ledger: Arc<RollbackLedger>,

    /// Plan-scoped cancellation
    pub cancel: CancellationToken,

    /// Live operation states, readable while the batch runs
    pub progress: OperationProgress,
}

/// Latest state of every operation submitted in the batch in flight
#[derive(Debug, Clone, Default)]
pub struct OperationProgress {
    states: Arc<RwLock<BTreeMap<String, OperationState>>>,
}

impl OperationProgress {
    pub fn new() -> Self {
        Self::default()
    }

    async fn set(&self, operation_id: &str, state: OperationState) {
        self.states
            .write()
            .await
            .insert(operation_id.to_string(), state);
    }

    /// State of an operation, `None` until it is submitted
    pub async fn state_of(&self, operation_id: &str) -> Option<OperationState> {
        self.states.read().await.get(operation_id).copied()
    }

    /// Forgets every tracked operation, before the next batch starts
    pub async fn clear(&self) {
        self.states.write().await.clear();
    }
}

/// Executes batches with bounded concurrency, retries and readiness waits
#[derive(Clone)]
pub struct OperationExecutor {
    control_plane: Arc<dyn ControlPlane>,
    config: ExecutorConfig,
    retry: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl OperationExecutor {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        config: ExecutorConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            control_plane,
            retry: RetryPolicy::from_config(&config),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs one batch to completion
    ///
    /// Parallel-safe batches run up to `concurrency_limit` operations at once;
    /// sequential batches run one at a time in batch order. After the first
    /// failure, or once the plan is cancelled, no further operation is
    /// submitted; in-flight operations always run to a terminal state.
    pub async fn execute_batch(&self, batch: &Batch, context: &BatchContext) -> BatchResult {
        let started = Instant::now();
        let limit = if batch.parallel_safe {
            self.config.concurrency_limit.max(1)
        } else {
            1
        };

        info!(
            batch = batch.number,
            phase = ?batch.phase,
            operations = batch.len(),
            parallel_safe = batch.parallel_safe,
            limit,
            "Starting batch"
        );

        let semaphore = Arc::new(Semaphore::new(limit));
        let halt = context.cancel.child_token();
        let mut handles = Vec::with_capacity(batch.len());

        for (index, operation) in batch.operations.iter().enumerate() {
            // Acquire before spawning so submission order is execution order
            let permit = tokio::select! {
                biased;
                _ = halt.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                break;
            };
            if halt.is_cancelled() {
                break;
            }

            let executor = self.clone();
            let operation = operation.clone();
            let context = context.clone();
            let halt = halt.clone();

            let handle = tokio::spawn(async move {
                let outcome = executor.run_operation(operation, &context).await;
                if outcome.state != OperationState::Succeeded {
                    halt.cancel();
                }
                drop(permit);
                outcome
            });
            handles.push((index, handle));
        }

        let mut outcomes: Vec<OperationOutcome> = batch
            .operations
            .iter()
            .map(OperationOutcome::not_started)
            .collect();

        let joined = join_all(
            handles
                .into_iter()
                .map(|(index, handle)| async move { (index, handle.await) }),
        )
        .await;
        for (index, joined) in joined {
            match joined {
                Ok(outcome) => outcomes[index] = outcome,
                Err(join_error) => {
                    let operation = &batch.operations[index];
                    warn!(operation = %operation.id, error = %join_error, "Operation task aborted");
                    outcomes[index] = OperationOutcome {
                        state: OperationState::Failed,
                        error: Some(join_error.to_string()),
                        error_kind: Some("task_aborted".to_string()),
                        ..OperationOutcome::not_started(operation)
                    };
                }
            }
        }

        let status = if outcomes.iter().any(|o| o.state == OperationState::Failed) {
            BatchStatus::Failed
        } else if outcomes.iter().any(|o| o.state == OperationState::NotStarted) {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Succeeded
        };

        let duration = started.elapsed();
        self.metrics
            .observe(BATCH_DURATION_SECONDS, duration.as_secs_f64());

        match status {
            BatchStatus::Succeeded => info!(
                batch = batch.number,
                phase = ?batch.phase,
                duration_ms = duration.as_millis() as u64,
                "Batch succeeded"
            ),
            _ => warn!(
                batch = batch.number,
                phase = ?batch.phase,
                status = ?status,
                failed = outcomes.iter().filter(|o| o.state == OperationState::Failed).count(),
                not_started = outcomes.iter().filter(|o| o.state == OperationState::NotStarted).count(),
                "Batch did not succeed"
            ),
        }

        BatchResult {
            batch_number: batch.number,
            phase: batch.phase,
            status,
            outcomes,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Drives a single operation through its state machine
    ///
    /// Validation, the mutation and the readiness wait share one
    /// `operation_timeout` budget.
    async fn run_operation(
        &self,
        mut operation: UpdateOperation,
        context: &BatchContext,
    ) -> OperationOutcome {
        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let desired = context.desired.get(&operation.resource);
        self.metrics.increment(OPERATIONS_TOTAL, 1);

        self.transition(&mut operation, OperationState::Validating, context)
            .await;
        let bounded = async {
            self.check(&operation, desired).await?;
            self.transition(&mut operation, OperationState::Running, context)
                .await;
            self.mutate(&operation, desired, &context.ledger, &attempts)
                .await
        };
        let result = match timeout(self.config.operation_timeout(), bounded).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(&operation.resource)),
        };

        let duration = started.elapsed();
        self.metrics
            .observe(OPERATION_DURATION_SECONDS, duration.as_secs_f64());

        let mut outcome = OperationOutcome {
            attempts: attempts.load(Ordering::SeqCst),
            duration_ms: duration.as_millis() as u64,
            ..OperationOutcome::not_started(&operation)
        };

        match result {
            Ok(()) => {
                self.transition(&mut operation, OperationState::Succeeded, context)
                    .await;
                outcome.state = OperationState::Succeeded;
            }
            Err(err) => {
                self.transition(&mut operation, OperationState::Failed, context)
                    .await;
                self.metrics.increment(OPERATION_FAILURES_TOTAL, 1);
                warn!(
                    operation = %operation.id,
                    error_kind = err.kind(),
                    error = %err,
                    "Operation failed"
                );
                outcome.state = OperationState::Failed;
                outcome.error_kind = Some(err.kind().to_string());
                outcome.error = Some(err.to_string());
            }
        }

        outcome
    }

    /// Non-mutating check of the call an operation is about to make,
    /// bounded by `operation_timeout`
    pub async fn validate(
        &self,
        operation: &UpdateOperation,
        desired: Option<&ResourceRecord>,
    ) -> Result<()> {
        match timeout(self.config.operation_timeout(), self.check(operation, desired)).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(&operation.resource)),
        }
    }

    async fn check(
        &self,
        operation: &UpdateOperation,
        desired: Option<&ResourceRecord>,
    ) -> Result<()> {
        let resource = &operation.resource;
        let (result, attempts) = match operation.action {
            OperationAction::Cleanup => {
                let (result, attempts) = self
                    .retry
                    .run("validate delete", || self.control_plane.delete(resource, true))
                    .await;
                match result {
                    Err(OrchestrationError::ResourceNotFound(_)) => (Ok(()), attempts),
                    other => (other, attempts),
                }
            }
            OperationAction::Recreate => {
                let record = desired_record(operation, desired)?;
                self.retry
                    .run("validate apply", || self.control_plane.apply(record, true))
                    .await
            }
        };

        result.map_err(|err| match err {
            err if err.is_transient() => OrchestrationError::OperationFailed {
                resource: resource.to_string(),
                attempts,
                reason: err.to_string(),
            },
            err @ OrchestrationError::Validation { .. } => err,
            err => OrchestrationError::Validation {
                resource: resource.to_string(),
                reason: err.to_string(),
            },
        })
    }

    fn timed_out(&self, resource: &ResourceRef) -> OrchestrationError {
        OrchestrationError::OperationTimeout {
            resource: resource.to_string(),
            timeout_secs: self.config.operation_timeout_secs,
        }
    }

    /// Records a state change on the operation, the live progress table and
    /// its ledger entry, if any
    async fn transition(
        &self,
        operation: &mut UpdateOperation,
        state: OperationState,
        context: &BatchContext,
    ) {
        debug!(operation = %operation.id, from = ?operation.state, to = ?state, "Operation state changed");
        operation.state = state;
        context.progress.set(&operation.id, state).await;
        if state.is_terminal() {
            context.ledger.settle(&operation.id, state).await;
        }
    }

    /// Performs the mutation and appends it to the ledger once accepted
    async fn mutate(
        &self,
        operation: &UpdateOperation,
        desired: Option<&ResourceRecord>,
        ledger: &RollbackLedger,
        attempts: &AtomicU32,
    ) -> Result<()> {
        let resource = &operation.resource;
        let prior = self.read(resource).await?;

        match operation.action {
            OperationAction::Cleanup => {
                if prior.is_none() {
                    debug!(resource = %resource, "Already absent, nothing to clean up");
                    ledger.append(operation.clone(), None).await;
                    return Ok(());
                }

                self.call(operation, "delete", attempts, || self.delete_if_present(resource))
                    .await?;
                ledger.append(operation.clone(), prior).await;

                if operation.strategy != Strategy::Atomic {
                    self.wait_until(resource, Readiness::Absent).await?;
                }
            }
            OperationAction::Recreate => {
                let record = desired_record(operation, desired)?;
                let mut recorded = false;

                if operation.strategy == Strategy::Recreate && prior.is_some() {
                    self.call(operation, "delete", attempts, || self.delete_if_present(resource))
                        .await?;
                    ledger.append(operation.clone(), prior.clone()).await;
                    recorded = true;
                    self.wait_until(resource, Readiness::Absent).await?;
                }

                self.call(operation, "apply", attempts, || {
                    self.control_plane.apply(record, false)
                })
                .await?;
                if !recorded {
                    ledger.append(operation.clone(), prior).await;
                }

                if operation.strategy != Strategy::Atomic {
                    self.wait_until(resource, Readiness::Ready).await?;
                }
            }
        }

        Ok(())
    }

    /// Mutating call with retries
    async fn call<F, Fut>(
        &self,
        operation: &UpdateOperation,
        label: &str,
        attempts: &AtomicU32,
        call: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let (result, made) = self.retry.run(label, call).await;
        attempts.fetch_add(made, Ordering::SeqCst);

        result.map_err(|err| OrchestrationError::OperationFailed {
            resource: operation.resource.to_string(),
            attempts: made,
            reason: err.to_string(),
        })
    }

    /// Deleting an absent resource counts as done
    async fn delete_if_present(&self, resource: &ResourceRef) -> Result<()> {
        match self.control_plane.delete(resource, false).await {
            Err(OrchestrationError::ResourceNotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn read(&self, resource: &ResourceRef) -> Result<Option<ResourceRecord>> {
        let (result, attempts) = self
            .retry
            .run("get", || self.control_plane.get(resource))
            .await;
        result.map_err(|err| OrchestrationError::OperationFailed {
            resource: resource.to_string(),
            attempts,
            reason: err.to_string(),
        })
    }

    /// Polls until the condition holds; bounded by the caller's timeout
    async fn wait_until(&self, resource: &ResourceRef, condition: Readiness) -> Result<()> {
        let mut polls = 0u32;
        loop {
            polls += 1;
            let satisfied = match condition {
                Readiness::Ready => self.control_plane.is_ready(resource).await,
                Readiness::Absent => self
                    .control_plane
                    .get(resource)
                    .await
                    .map(|current| current.is_none()),
            };

            match satisfied {
                Ok(true) => {
                    debug!(resource = %resource, ?condition, polls, "Condition reached");
                    return Ok(());
                }
                Ok(false) => {}
                Err(err) if err.is_transient() => {
                    debug!(resource = %resource, error = %err, "Transient error while polling");
                }
                Err(err) => return Err(err),
            }

            tokio::time::sleep(self.config.readiness_poll_interval()).await;
        }
    }
}

impl std::fmt::Debug for OperationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationExecutor")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Condition awaited after a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    Absent,
}

fn desired_record<'a>(
    operation: &UpdateOperation,
    desired: Option<&'a ResourceRecord>,
) -> Result<&'a ResourceRecord> {
    desired.ok_or_else(|| OrchestrationError::Validation {
        resource: operation.resource.to_string(),
        reason: "no desired manifest to recreate from".to_string(),
    })
}
