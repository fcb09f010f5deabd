//! Error types for the recovery orchestrator

use thiserror::Error;

/// Errors that can occur while planning, executing or rolling back recovery work
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A dry-run check rejected the operation; nothing was mutated
    #[error("Validation failed for {resource}: {reason}")]
    Validation { resource: String, reason: String },

    /// A hard dependency cycle was found and could not be broken
    #[error("Circular dependency detected: {0}")]
    DependencyCycle(String),

    #[error("Operation timed out after {timeout_secs}s: {resource}")]
    OperationTimeout { resource: String, timeout_secs: u64 },

    /// A mutating call failed after the retry budget was spent
    #[error("Operation failed for {resource} after {attempts} attempt(s): {reason}")]
    OperationFailed {
        resource: String,
        attempts: u32,
        reason: String,
    },

    #[error("Rollback failed for {resource}: {reason}")]
    RollbackFailed { resource: String, reason: String },

    /// Network or API unavailability; retried with backoff
    #[error("Control plane unavailable: {0}")]
    ControlPlaneUnavailable(String),

    /// The control plane refused the request; never retried
    #[error("Control plane rejected request: {0}")]
    ControlPlaneRejected(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Plan already consumed: {0}")]
    PlanAlreadyConsumed(String),

    #[error("Plan is not executable: {0}")]
    PlanNotExecutable(String),

    /// The plan is executing or rolling back
    #[error("Plan is busy: {0}")]
    PlanBusy(String),

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(String),
}

impl OrchestrationError {
    /// Whether the failure is worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, OrchestrationError::ControlPlaneUnavailable(_))
    }

    /// Short, stable label used in reports and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationError::Validation { .. } => "validation",
            OrchestrationError::DependencyCycle(_) => "dependency_cycle",
            OrchestrationError::OperationTimeout { .. } => "operation_timeout",
            OrchestrationError::OperationFailed { .. } => "operation_failed",
            OrchestrationError::RollbackFailed { .. } => "rollback_failed",
            OrchestrationError::ControlPlaneUnavailable(_) => "control_plane_unavailable",
            OrchestrationError::ControlPlaneRejected(_) => "control_plane_rejected",
            OrchestrationError::ResourceNotFound(_) => "resource_not_found",
            OrchestrationError::PlanNotFound(_) => "plan_not_found",
            OrchestrationError::PlanAlreadyConsumed(_) => "plan_already_consumed",
            OrchestrationError::PlanNotExecutable(_) => "plan_not_executable",
            OrchestrationError::PlanBusy(_) => "plan_busy",
            OrchestrationError::Cancelled(_) => "cancelled",
            OrchestrationError::ConfigurationError(_) => "configuration",
            OrchestrationError::IoError(_) => "io",
            OrchestrationError::SerializationError(_) => "serialization",
            OrchestrationError::YamlError(_) => "yaml",
        }
    }
}

impl From<serde_yaml::Error> for OrchestrationError {
    fn from(err: serde_yaml::Error) -> Self {
        OrchestrationError::YamlError(err.to_string())
    }
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;
