//! End-to-end recovery scenarios against the in-memory control plane

use std::sync::Arc;
use std::time::Duration;

use fluxmend_integration_tests::{
    batch_names, declared_cycle, fast_config, manager, reference, web_application,
};
use fluxmend_recovery::{
    BatchPhase, BatchResult, BatchStatus, CallKind, DependencyAnalyzer, DependencyType, ExecutionState,
    InMemoryControlPlane, OperationAction, OperationState, RecoveryManager, ResourceRecord,
    RiskLevel, RollbackStatus,
};
use serde_json::json;
use tokio_stream::StreamExt;

#[tokio::test]
async fn test_dependency_chain_orders_batches() {
    let plane = Arc::new(InMemoryControlPlane::new());
    let manager = manager(&plane, true);

    let plan = manager.plan(web_application(), false).await.unwrap();

    assert_eq!(
        batch_names(&plan.cleanup_batches),
        vec![vec!["ing"], vec!["svc"], vec!["app"], vec!["cfg"]]
    );
    assert_eq!(
        batch_names(&plan.recreation_batches),
        vec![vec!["cfg"], vec!["app"], vec!["svc"], vec!["ing"]]
    );
    assert!(plan.cycle_breaks.is_empty());
}

#[tokio::test]
async fn test_dependency_chain_executes_in_order() {
    let plane = Arc::new(InMemoryControlPlane::with_resources(web_application()));
    let manager = manager(&plane, true);

    let plan = manager.plan(web_application(), false).await.unwrap();
    let results: Vec<BatchResult> = manager.execute(&plan.id).await.unwrap().collect().await;
    assert_eq!(results.len(), 8);
    assert!(results.iter().all(BatchResult::succeeded));

    let mutations: Vec<(CallKind, String)> = plane
        .journal()
        .await
        .into_iter()
        .filter(|call| call.accepted && !call.dry_run)
        .map(|call| (call.kind, call.resource.name))
        .collect();
    let expected: Vec<(CallKind, String)> = [
        (CallKind::Delete, "ing"),
        (CallKind::Delete, "svc"),
        (CallKind::Delete, "app"),
        (CallKind::Delete, "cfg"),
        (CallKind::Apply, "cfg"),
        (CallKind::Apply, "app"),
        (CallKind::Apply, "svc"),
        (CallKind::Apply, "ing"),
    ]
    .into_iter()
    .map(|(kind, name)| (kind, name.to_string()))
    .collect();
    assert_eq!(mutations, expected);

    let status = manager.status(&plan.id).await.unwrap();
    assert_eq!(status.state, ExecutionState::Succeeded);
    assert_eq!(status.completed_batches, 8);
    assert_eq!(status.outcomes.len(), 8);
}

#[tokio::test]
async fn test_declared_cycle_is_broken_at_weakest_edge() {
    let plane = Arc::new(InMemoryControlPlane::new());
    let manager = manager(&plane, true);

    let plan = manager.plan(declared_cycle(10, 5), false).await.unwrap();

    assert_eq!(plan.cycle_breaks.len(), 1);
    let cycle_break = &plan.cycle_breaks[0];
    assert_eq!(cycle_break.from, reference("ConfigMap", "b"));
    assert_eq!(cycle_break.to, reference("ConfigMap", "a"));
    assert_eq!(cycle_break.weight, 5);

    assert!(plan.recommendations.iter().any(|r| r.contains(
        "Circular dependency broken between ConfigMap/default/b and ConfigMap/default/a"
    )));
    assert_eq!(plan.risk_assessment.level, RiskLevel::High);

    assert_eq!(
        batch_names(&plan.recreation_batches),
        vec![vec!["b"], vec!["a"]]
    );

    let again = manager.plan(declared_cycle(10, 5), false).await.unwrap();
    assert_eq!(again.cycle_breaks, plan.cycle_breaks);
    assert_ne!(again.id, plan.id);

    let mut graph = DependencyAnalyzer::new().discover(&declared_cycle(10, 5));
    graph.break_cycles();
    let (a, b) = (reference("ConfigMap", "a"), reference("ConfigMap", "b"));
    assert_eq!(graph.edge(&b, &a).unwrap().dependency_type, DependencyType::Soft);
    assert_eq!(graph.edge(&a, &b).unwrap().dependency_type, DependencyType::Hard);
}

#[tokio::test]
async fn test_validation_failure_halts_sequential_batch() {
    let plane = Arc::new(InMemoryControlPlane::new());
    plane
        .reject_dry_run(
            CallKind::Apply,
            reference("ConfigMap", "y"),
            "data: invalid key",
        )
        .await;

    let mut config = fast_config(false);
    config.executor.concurrency_limit = 1;
    let manager = RecoveryManager::new(plane.clone(), config).unwrap();

    let records: Vec<ResourceRecord> = ["x", "y", "z"]
        .into_iter()
        .map(|name| {
            ResourceRecord::new(reference("ConfigMap", name)).with_spec(json!({"data": {}}))
        })
        .collect();
    let plan = manager.plan(records, false).await.unwrap();
    assert_eq!(plan.recreation_batches.len(), 1);
    assert_eq!(plan.recreation_batches[0].len(), 3);

    let results: Vec<BatchResult> = manager.execute(&plan.id).await.unwrap().collect().await;
    let recreation = results.last().unwrap();
    assert_eq!(recreation.status, BatchStatus::Failed);

    let states: Vec<OperationState> = recreation.outcomes.iter().map(|o| o.state).collect();
    assert_eq!(
        states,
        vec![
            OperationState::Succeeded,
            OperationState::Failed,
            OperationState::NotStarted
        ]
    );
    assert_eq!(recreation.outcomes[1].error_kind.as_deref(), Some("validation"));

    assert!(plane.contains(&reference("ConfigMap", "x")).await);
    assert!(plane
        .mutations_of(&reference("ConfigMap", "y"))
        .await
        .is_empty());
    assert!(plane
        .mutations_of(&reference("ConfigMap", "z"))
        .await
        .is_empty());
    assert_eq!(
        manager.status(&plan.id).await.unwrap().state,
        ExecutionState::Failed
    );
}

#[tokio::test]
async fn test_exhausted_retries_roll_back_completed_batches() {
    let records: Vec<ResourceRecord> = web_application()
        .into_iter()
        .filter(|r| r.reference.kind != "Ingress")
        .collect();
    let plane = Arc::new(InMemoryControlPlane::with_resources(records.clone()));
    plane
        .fail_transiently(CallKind::Delete, reference("ConfigMap", "cfg"), 10)
        .await;
    let manager = manager(&plane, true);

    let plan = manager.plan(records, false).await.unwrap();
    assert_eq!(
        batch_names(&plan.cleanup_batches),
        vec![vec!["svc"], vec!["app"], vec!["cfg"]]
    );

    let results: Vec<BatchResult> = manager.execute(&plan.id).await.unwrap().collect().await;
    let statuses: Vec<BatchStatus> = results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![BatchStatus::Succeeded, BatchStatus::Succeeded, BatchStatus::Failed]
    );
    let failed = &results[2].outcomes[0];
    assert_eq!(failed.attempts, 4);
    assert_eq!(failed.error_kind.as_deref(), Some("operation_failed"));

    let status = manager.status(&plan.id).await.unwrap();
    assert_eq!(status.state, ExecutionState::RolledBack);

    let rollback = status.rollback.as_ref().unwrap();
    let reversed: Vec<(String, OperationAction, RollbackStatus)> = rollback
        .entries
        .iter()
        .map(|e| (e.resource.name.clone(), e.action, e.status))
        .collect();
    assert_eq!(
        reversed,
        vec![
            ("app".to_string(), OperationAction::Cleanup, RollbackStatus::RolledBack),
            ("svc".to_string(), OperationAction::Cleanup, RollbackStatus::RolledBack),
        ]
    );

    assert!(plane.contains(&reference("Deployment", "app")).await);
    assert!(plane.contains(&reference("Service", "svc")).await);
    assert!(plane.contains(&reference("ConfigMap", "cfg")).await);

    let final_states: Vec<(String, OperationState)> = status
        .outcomes
        .iter()
        .filter(|o| o.action == OperationAction::Cleanup)
        .map(|o| (o.resource.name.clone(), o.state))
        .collect();
    assert_eq!(
        final_states,
        vec![
            ("svc".to_string(), OperationState::RolledBack),
            ("app".to_string(), OperationState::RolledBack),
            ("cfg".to_string(), OperationState::Failed),
        ]
    );
    assert!(status
        .outcomes
        .iter()
        .filter(|o| o.action == OperationAction::Recreate)
        .all(|o| o.state == OperationState::NotStarted));
}

#[tokio::test]
async fn test_rollback_before_execution_is_noop() {
    let plane = Arc::new(InMemoryControlPlane::with_resources(web_application()));
    let manager = manager(&plane, true);
    let version = plane.version().await;

    let plan = manager.plan(web_application(), false).await.unwrap();
    let rollback = manager.rollback(&plan.id).await.unwrap();

    assert!(rollback.is_empty());
    assert_eq!(plane.version().await, version);
    assert_eq!(
        manager.status(&plan.id).await.unwrap().state,
        ExecutionState::Planned
    );

    let results: Vec<BatchResult> = manager.execute(&plan.id).await.unwrap().collect().await;
    assert!(results.iter().all(BatchResult::succeeded));
}

#[tokio::test]
async fn test_cancel_mid_plan_rolls_back_completed_work() {
    let plane = Arc::new(InMemoryControlPlane::with_resources(web_application()));
    let manager = manager(&plane, true);
    let app = reference("Deployment", "app");

    let plan = manager.plan(web_application(), false).await.unwrap();
    // hold the deployment's recreation in its readiness wait
    plane.delay_readiness(app.clone(), 40).await;
    let stream = manager.execute(&plan.id).await.unwrap();

    let in_flight = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = manager.status(&plan.id).await.unwrap();
            let running = status.outcomes.iter().any(|o| {
                o.resource == app
                    && o.action == OperationAction::Recreate
                    && o.state == OperationState::Running
            });
            if running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("deployment recreation never observed running");
    assert_eq!(in_flight.current_batch, Some((BatchPhase::Recreation, 2)));
    assert_eq!(in_flight.state, ExecutionState::Executing);

    manager.cancel(&plan.id).await.unwrap();
    let results: Vec<BatchResult> = stream.collect().await;
    assert_eq!(results.len(), 6);
    assert!(results.iter().all(BatchResult::succeeded));

    let status = manager.status(&plan.id).await.unwrap();
    assert!(status.cancelled);
    assert_eq!(status.state, ExecutionState::RolledBack);
    assert_eq!(status.current_batch, None);

    let recreation: Vec<(String, OperationState)> = status
        .outcomes
        .iter()
        .filter(|o| o.action == OperationAction::Recreate)
        .map(|o| (o.resource.name.clone(), o.state))
        .collect();
    assert_eq!(
        recreation,
        vec![
            ("cfg".to_string(), OperationState::RolledBack),
            ("app".to_string(), OperationState::RolledBack),
            ("svc".to_string(), OperationState::NotStarted),
            ("ing".to_string(), OperationState::NotStarted),
        ]
    );

    let rollback = status.rollback.as_ref().unwrap();
    assert_eq!(rollback.entries.len(), 6);
    assert!(rollback.fully_reversed());
    assert_eq!(rollback.entries[0].resource, app);
    assert_eq!(rollback.entries[0].action, OperationAction::Recreate);

    for record in web_application() {
        assert!(plane.contains(&record.reference).await);
    }
    assert_eq!(
        plane.mutations_of(&reference("Service", "svc")).await,
        vec![CallKind::Delete, CallKind::Apply]
    );
}
