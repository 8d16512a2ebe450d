//! Dispatch counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one dispatcher
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    submissions: AtomicU64,
    polls: AtomicU64,
    throttles: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
}

impl DispatchMetrics {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a statement submission
    pub fn record_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a status check
    pub fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a throttled request
    pub fn record_throttle(&self) {
        self.throttles.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a FAILED or CANCELLED execution
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an exhausted poll budget
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cancel request
    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        DispatchMetricsSnapshot {
            submissions: self.submissions.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            throttles: self.throttles.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatch metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchMetricsSnapshot {
    /// Statements submitted
    pub submissions: u64,
    /// Status checks made
    pub polls: u64,
    /// Throttled requests
    pub throttles: u64,
    /// FAILED or CANCELLED executions seen
    pub failures: u64,
    /// Poll budgets exhausted
    pub timeouts: u64,
    /// Cancel requests sent
    pub cancellations: u64,
}
