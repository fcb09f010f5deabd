//! Manager components for planning, executing and reversing recoveries

pub mod batch_planner;
pub mod operation_executor;
pub mod recovery_manager;
pub mod retry;
pub mod rollback_manager;

pub use batch_planner::{BatchPlanner, PlannedBatches};
pub use operation_executor::{BatchContext, OperationExecutor, OperationProgress};
pub use recovery_manager::RecoveryManager;
pub use retry::RetryPolicy;
pub use rollback_manager::{LedgerEntry, RollbackLedger, RollbackManager, SnapshotRef};
