//! Metrics sink for execution and rollback counters
//!
//! Recording is fire-and-forget: sinks never block the caller and never fail.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Operations submitted to the control plane
pub const OPERATIONS_TOTAL: &str = "fluxmend_operations_total";

/// Operations that ended in `Failed`
pub const OPERATION_FAILURES_TOTAL: &str = "fluxmend_operation_failures_total";

/// Rollback runs that reversed at least one operation
pub const ROLLBACKS_TOTAL: &str = "fluxmend_rollbacks_total";

pub const BATCH_DURATION_SECONDS: &str = "fluxmend_batch_duration_seconds";
pub const OPERATION_DURATION_SECONDS: &str = "fluxmend_operation_duration_seconds";

/// Receives counters and histogram observations
pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: &'static str, by: u64);

    fn observe(&self, histogram: &'static str, seconds: f64);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _counter: &'static str, _by: u64) {}

    fn observe(&self, _histogram: &'static str, _seconds: f64) {}
}

/// Keeps every value in memory
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetrics {
    counters: Arc<Mutex<BTreeMap<&'static str, u64>>>,
    histograms: Arc<Mutex<BTreeMap<&'static str, Vec<f64>>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter; unknown counters read as zero
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|counters| counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Observations recorded for a histogram
    pub fn observations(&self, name: &str) -> Vec<f64> {
        self.histograms
            .lock()
            .map(|histograms| histograms.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, counter: &'static str, by: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(counter).or_insert(0) += by;
        }
    }

    fn observe(&self, histogram: &'static str, seconds: f64) {
        if let Ok(mut histograms) = self.histograms.lock() {
            histograms.entry(histogram).or_default().push(seconds);
        }
    }
}
