//! Configuration for planning, execution and risk scoring
//!
//! Configuration is layered, later sources overriding earlier ones:
//! built-in defaults, the user file (`~/.fluxmend/config.yaml`), the workspace
//! file (`<root>/.fluxmend/config.yaml`) and finally `FLUXMEND_*` environment
//! variables for executor tunables. Every field has a default, so partial
//! files are fine.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, warn};

use crate::error::{OrchestrationError, Result};
use crate::models::{ResourceRef, Strategy};

/// Top-level orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub executor: ExecutorConfig,
    pub strategies: StrategyTable,
    pub priorities: PriorityTable,
    pub risk: RiskConfig,
    pub planning: PlanningConfig,

    /// Roll back automatically when execution fails or is cancelled
    pub auto_rollback: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            strategies: StrategyTable::default(),
            priorities: PriorityTable::default(),
            risk: RiskConfig::default(),
            planning: PlanningConfig::default(),
            auto_rollback: true,
        }
    }
}

/// Operation executor tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum concurrent operations within a parallel-safe batch
    pub concurrency_limit: usize,

    /// Retries for transient control-plane failures
    pub max_retries: u32,

    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,

    /// Upper bound for a single operation, readiness wait included
    pub operation_timeout_secs: u64,

    pub readiness_poll_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            max_retries: 3,
            initial_backoff_ms: 200,
            backoff_factor: 2.0,
            max_backoff_ms: 5_000,
            operation_timeout_secs: 300,
            readiness_poll_interval_ms: 500,
        }
    }
}

impl ExecutorConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }
}

/// Replacement strategy per resource kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyTable {
    /// Used for kinds not listed in `kinds`
    pub default_strategy: Strategy,
    pub kinds: BTreeMap<String, Strategy>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        let mut kinds = BTreeMap::new();
        for kind in [
            "ConfigMap",
            "Secret",
            "ServiceAccount",
            "Role",
            "RoleBinding",
            "Ingress",
            "NetworkPolicy",
        ] {
            kinds.insert(kind.to_string(), Strategy::Atomic);
        }
        for kind in [
            "Service",
            "Job",
            "CronJob",
            "StatefulSet",
            "PersistentVolumeClaim",
        ] {
            kinds.insert(kind.to_string(), Strategy::Recreate);
        }
        for kind in ["Deployment", "DaemonSet", "ReplicaSet"] {
            kinds.insert(kind.to_string(), Strategy::Rolling);
        }

        Self {
            default_strategy: Strategy::Atomic,
            kinds,
        }
    }
}

impl StrategyTable {
    pub fn strategy_for(&self, kind: &str) -> Strategy {
        self.kinds.get(kind).copied().unwrap_or(self.default_strategy)
    }
}

/// Planning priorities and namespace criticality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityTable {
    pub default_priority: i32,

    /// Priority per resource kind
    pub kinds: BTreeMap<String, i32>,

    /// Namespaces whose resources raise risk
    pub critical_namespaces: BTreeSet<String>,

    /// Per-resource priorities, usually taken from annotations
    #[serde(skip)]
    pub overrides: BTreeMap<ResourceRef, i32>,
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self {
            default_priority: 0,
            kinds: BTreeMap::new(),
            critical_namespaces: ["kube-system", "flux-system"]
                .into_iter()
                .map(String::from)
                .collect(),
            overrides: BTreeMap::new(),
        }
    }
}

impl PriorityTable {
    /// Effective priority: resource override, then kind, then default
    pub fn priority_for(&self, resource: &ResourceRef) -> i32 {
        self.overrides
            .get(resource)
            .or_else(|| self.kinds.get(&resource.kind))
            .copied()
            .unwrap_or(self.default_priority)
    }

    pub fn is_non_default(&self, resource: &ResourceRef) -> bool {
        self.priority_for(resource) != self.default_priority
    }

    pub fn set_override(&mut self, resource: ResourceRef, priority: i32) {
        self.overrides.insert(resource, priority);
    }

    pub fn is_critical_namespace(&self, namespace: &str) -> bool {
        self.critical_namespaces.contains(namespace)
    }
}

/// Risk scoring constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Impact at which risk becomes medium
    pub medium_threshold: f64,

    /// Impact at which risk becomes high
    pub high_threshold: f64,

    /// Added once per critical namespace touched
    pub critical_namespace_bonus: f64,

    /// Multiplier for indirect dependents
    pub indirect_weight: f64,

    /// Breadth-first depth limit for blast radius traversal
    pub max_traversal_depth: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            medium_threshold: 5.0,
            high_threshold: 20.0,
            critical_namespace_bonus: 25.0,
            indirect_weight: 0.5,
            max_traversal_depth: 5,
        }
    }
}

/// Planner options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    /// Break hard cycles instead of failing the plan
    pub break_cycles: bool,

    /// How long a finished plan stays queryable before it is evicted
    pub plan_retention_secs: u64,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            break_cycles: true,
            plan_retention_secs: 3600,
        }
    }
}

impl PlanningConfig {
    pub fn plan_retention(&self) -> Duration {
        Duration::from_secs(self.plan_retention_secs)
    }
}

/// Where a configuration layer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Defaults = 0,
    User = 1,
    Workspace = 2,
    Environment = 3,
}

/// Loaded configuration with provenance
#[derive(Debug, Clone)]
pub struct ConfigLoadResult {
    pub config: RecoveryConfig,

    /// Layers applied, in order
    pub sources: Vec<(ConfigSource, Option<PathBuf>)>,

    pub warnings: Vec<String>,
}

impl RecoveryConfig {
    /// Parses a (possibly partial) YAML document over the defaults
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut merged = serde_yaml::to_value(RecoveryConfig::default())?;
        let layer: Value = serde_yaml::from_str(content)?;
        merge_values(&mut merged, layer);

        let config: RecoveryConfig = serde_yaml::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Loads the full configuration hierarchy for a workspace root
    pub async fn load(workspace_root: &Path) -> Result<ConfigLoadResult> {
        let user_path = dirs::home_dir().map(|home| home.join(".fluxmend").join("config.yaml"));
        let workspace_path = workspace_root.join(".fluxmend").join("config.yaml");
        Self::load_from(user_path.as_deref(), &workspace_path, std::env::vars()).await
    }

    /// Loads the hierarchy from explicit locations and environment
    pub async fn load_from(
        user_path: Option<&Path>,
        workspace_path: &Path,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<ConfigLoadResult> {
        let mut merged = serde_yaml::to_value(RecoveryConfig::default())?;
        let mut sources = vec![(ConfigSource::Defaults, None)];
        let mut warnings = Vec::new();

        let layers = [
            (ConfigSource::User, user_path),
            (ConfigSource::Workspace, Some(workspace_path)),
        ];
        for (source, path) in layers {
            let Some(path) = path else {
                continue;
            };
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                debug!(path = %path.display(), "Configuration file not present");
                continue;
            }

            let content = tokio::fs::read_to_string(path).await?;
            let layer: Value = serde_yaml::from_str(&content)?;
            merge_values(&mut merged, layer);
            sources.push((source, Some(path.to_path_buf())));
        }

        let mut config: RecoveryConfig = serde_yaml::from_value(merged)?;

        let applied = config.apply_env_overrides(env, &mut warnings);
        if applied > 0 {
            sources.push((ConfigSource::Environment, None));
        }
        for warning in &warnings {
            warn!("{}", warning);
        }

        config.validate()?;

        Ok(ConfigLoadResult {
            config,
            sources,
            warnings,
        })
    }

    /// Applies `FLUXMEND_*` executor overrides, returning how many were applied
    pub fn apply_env_overrides(
        &mut self,
        env: impl IntoIterator<Item = (String, String)>,
        warnings: &mut Vec<String>,
    ) -> usize {
        let mut applied = 0;
        for (key, value) in env {
            let result = match key.as_str() {
                "FLUXMEND_CONCURRENCY_LIMIT" => value
                    .parse()
                    .map(|v| self.executor.concurrency_limit = v)
                    .is_ok(),
                "FLUXMEND_MAX_RETRIES" => value
                    .parse()
                    .map(|v| self.executor.max_retries = v)
                    .is_ok(),
                "FLUXMEND_OPERATION_TIMEOUT_SECS" => value
                    .parse()
                    .map(|v| self.executor.operation_timeout_secs = v)
                    .is_ok(),
                "FLUXMEND_AUTO_ROLLBACK" => value
                    .parse()
                    .map(|v| self.auto_rollback = v)
                    .is_ok(),
                _ => continue,
            };

            if result {
                applied += 1;
            } else {
                warnings.push(format!("Ignoring {}: invalid value '{}'", key, value));
            }
        }
        applied
    }

    /// Rejects configurations the executor or risk assessor cannot work with
    pub fn validate(&self) -> Result<()> {
        let executor = &self.executor;
        if executor.concurrency_limit == 0 {
            return Err(OrchestrationError::ConfigurationError(
                "executor.concurrency_limit must be at least 1".to_string(),
            ));
        }
        if executor.backoff_factor < 1.0 {
            return Err(OrchestrationError::ConfigurationError(
                "executor.backoff_factor must be >= 1.0".to_string(),
            ));
        }
        if executor.operation_timeout_secs == 0 || executor.readiness_poll_interval_ms == 0 {
            return Err(OrchestrationError::ConfigurationError(
                "executor timeouts must be positive".to_string(),
            ));
        }
        if self.risk.high_threshold <= self.risk.medium_threshold {
            return Err(OrchestrationError::ConfigurationError(format!(
                "risk.high_threshold ({}) must exceed risk.medium_threshold ({})",
                self.risk.high_threshold, self.risk.medium_threshold
            )));
        }
        if self.risk.max_traversal_depth == 0 {
            return Err(OrchestrationError::ConfigurationError(
                "risk.max_traversal_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Deep-merges `layer` into `base`; mappings merge key by key, everything else is replaced
fn merge_values(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Mapping(base_map), Value::Mapping(layer_map)) => {
            for (key, value) in layer_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base, layer) => *base = layer,
    }
}
