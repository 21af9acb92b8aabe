use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::gateway::Operation;

/// Live counters for gateway calls made by a driver
#[derive(Debug, Default)]
pub struct UploadMetrics {
    issued: [AtomicU64; 6],
    succeeded: [AtomicU64; 6],
    failed: [AtomicU64; 6],
    discarded: AtomicU64,
}

impl UploadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_issued(&self, operation: Operation) {
        self.issued[operation.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, operation: Operation) {
        self.succeeded[operation.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, operation: Operation) {
        self.failed[operation.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn issued(&self, operation: Operation) -> u64 {
        self.issued[operation.index()].load(Ordering::Relaxed)
    }

    pub fn succeeded(&self, operation: Operation) -> u64 {
        self.succeeded[operation.index()].load(Ordering::Relaxed)
    }

    pub fn failed(&self, operation: Operation) -> u64 {
        self.failed[operation.index()].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let per_operation = Operation::ALL
            .iter()
            .map(|op| OperationCounts {
                operation: op.name(),
                issued: self.issued(*op),
                succeeded: self.succeeded(*op),
                failed: self.failed(*op),
            })
            .collect::<Vec<_>>();

        MetricsSnapshot {
            total_issued: per_operation.iter().map(|c| c.issued).sum(),
            total_failed: per_operation.iter().map(|c| c.failed).sum(),
            discarded: self.discarded.load(Ordering::Relaxed),
            per_operation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationCounts {
    pub operation: &'static str,
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_issued: u64,
    pub total_failed: u64,
    pub discarded: u64,
    pub per_operation: Vec<OperationCounts>,
}

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to `default_filter`.
///
/// Safe to call more than once; later calls are no-ops.
#[cfg(feature = "tracing-basic")]
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_tracked_per_operation() {
        let metrics = UploadMetrics::new();
        metrics.record_issued(Operation::RequestSlot);
        metrics.record_issued(Operation::RequestSlot);
        metrics.record_failure(Operation::RequestSlot);
        metrics.record_success(Operation::RequestSlot);
        metrics.record_issued(Operation::Link);

        assert_eq!(metrics.issued(Operation::RequestSlot), 2);
        assert_eq!(metrics.failed(Operation::RequestSlot), 1);
        assert_eq!(metrics.issued(Operation::Transfer), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_issued, 3);
        assert_eq!(snapshot.total_failed, 1);
        assert_eq!(snapshot.per_operation.len(), 6);
    }
}
