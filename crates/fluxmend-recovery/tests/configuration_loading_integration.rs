//! Layered configuration loading from user, workspace and environment

use std::path::Path;

use fluxmend_recovery::{ConfigSource, OrchestrationError, RecoveryConfig, Strategy};
use tempfile::TempDir;

fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn no_env() -> Vec<(String, String)> {
    Vec::new()
}

#[tokio::test]
async fn test_defaults_when_no_files_exist() {
    let dir = TempDir::new().unwrap();
    let result = RecoveryConfig::load_from(None, &dir.path().join("missing.yaml"), no_env())
        .await
        .unwrap();

    assert_eq!(result.config, RecoveryConfig::default());
    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].0, ConfigSource::Defaults);
    assert!(result.warnings.is_empty());
}

#[tokio::test]
async fn test_workspace_overrides_user() {
    let dir = TempDir::new().unwrap();
    let user = write(
        dir.path(),
        "user.yaml",
        "executor:\n  concurrency_limit: 2\n  max_retries: 5\nauto_rollback: false\n",
    );
    let workspace = write(
        dir.path(),
        "workspace.yaml",
        "executor:\n  concurrency_limit: 6\nstrategies:\n  kinds:\n    HelmRelease: recreate\n",
    );

    let result = RecoveryConfig::load_from(Some(&user), &workspace, no_env())
        .await
        .unwrap();

    let config = &result.config;
    assert_eq!(config.executor.concurrency_limit, 6);
    assert_eq!(config.executor.max_retries, 5);
    assert!(!config.auto_rollback);
    assert_eq!(config.strategies.strategy_for("HelmRelease"), Strategy::Recreate);
    assert_eq!(config.strategies.strategy_for("Secret"), Strategy::Atomic);

    let sources: Vec<ConfigSource> = result.sources.iter().map(|(s, _)| *s).collect();
    assert_eq!(
        sources,
        vec![ConfigSource::Defaults, ConfigSource::User, ConfigSource::Workspace]
    );
    assert_eq!(result.sources[2].1.as_deref(), Some(workspace.as_path()));
}

#[tokio::test]
async fn test_environment_wins_over_files() {
    let dir = TempDir::new().unwrap();
    let workspace = write(
        dir.path(),
        "workspace.yaml",
        "executor:\n  operation_timeout_secs: 60\n",
    );
    let env = vec![
        ("FLUXMEND_OPERATION_TIMEOUT_SECS".to_string(), "30".to_string()),
        ("FLUXMEND_CONCURRENCY_LIMIT".to_string(), "lots".to_string()),
    ];

    let result = RecoveryConfig::load_from(None, &workspace, env).await.unwrap();

    assert_eq!(result.config.executor.operation_timeout_secs, 30);
    assert_eq!(result.config.executor.concurrency_limit, 4);
    assert_eq!(result.sources.last().map(|(s, _)| *s), Some(ConfigSource::Environment));
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("FLUXMEND_CONCURRENCY_LIMIT"));
}

#[tokio::test]
async fn test_critical_namespaces_from_file() {
    let dir = TempDir::new().unwrap();
    let workspace = write(
        dir.path(),
        "workspace.yaml",
        "priorities:\n  critical_namespaces: [payments]\nrisk:\n  critical_namespace_bonus: 10.0\n",
    );

    let config = RecoveryConfig::load_from(None, &workspace, no_env())
        .await
        .unwrap()
        .config;

    assert!(config.priorities.is_critical_namespace("payments"));
    assert!(!config.priorities.is_critical_namespace("kube-system"));
    assert_eq!(config.risk.critical_namespace_bonus, 10.0);
    assert_eq!(config.risk.high_threshold, 20.0);
}

#[tokio::test]
async fn test_invalid_layer_rejected() {
    let dir = TempDir::new().unwrap();
    let workspace = write(
        dir.path(),
        "workspace.yaml",
        "executor:\n  concurrency_limit: 0\n",
    );

    let err = RecoveryConfig::load_from(None, &workspace, no_env())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::ConfigurationError(_)));
}

#[tokio::test]
async fn test_malformed_yaml_rejected() {
    let dir = TempDir::new().unwrap();
    let workspace = write(dir.path(), "workspace.yaml", "executor: [unclosed\n");

    assert!(RecoveryConfig::load_from(None, &workspace, no_env())
        .await
        .is_err());
}
