//! Counters for agent observability.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics for the agent runtime.
#[derive(Debug, Default)]
pub struct AgentMetrics {
    /// Assign events accepted for dispatch.
    pub tasks_received: AtomicU64,
    /// Assign events dropped because the task was already tracked.
    pub tasks_duplicate: AtomicU64,
    /// Assign events dropped by the reject flag or self destruct.
    pub tasks_rejected: AtomicU64,
    /// Packages successfully acquired.
    pub tasks_acquired: AtomicU64,
    /// Acquisitions that returned no package or no data.
    pub acquire_misses: AtomicU64,
    pub tasks_succeeded: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_timed_out: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    /// Results that could not be delivered after every retry.
    pub report_failures: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub heartbeat_failures: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    // High-water marks, reset on read.
    max_executing_tasks: AtomicU64,
    max_executing_futures: AtomicU64,
}

impl AgentMetrics {
    /// Create new metrics instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_received(&self) {
        self.tasks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.tasks_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.tasks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquired(&self) {
        self.tasks_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire_miss(&self) {
        self.acquire_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_report_failure(&self) {
        self.report_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self, ok: bool) {
        if ok {
            self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reconnect(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Track the number of executing tasks and in-flight worker futures.
    pub fn observe_load(&self, executing_tasks: usize, executing_futures: usize) {
        self.max_executing_tasks
            .fetch_max(executing_tasks as u64, Ordering::Relaxed);
        self.max_executing_futures
            .fetch_max(executing_futures as u64, Ordering::Relaxed);
    }

    /// Read the high-water marks and restart them from the current load.
    pub fn take_performance(
        &self,
        executing_tasks: usize,
        executing_futures: usize,
    ) -> PerformanceSnapshot {
        PerformanceSnapshot {
            max_executing_tasks: self
                .max_executing_tasks
                .swap(executing_tasks as u64, Ordering::Relaxed),
            max_executing_futures: self
                .max_executing_futures
                .swap(executing_futures as u64, Ordering::Relaxed),
            executing_tasks: executing_tasks as u64,
            executing_futures: executing_futures as u64,
        }
    }

    /// Get a snapshot of current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_received: self.tasks_received.load(Ordering::Relaxed),
            tasks_duplicate: self.tasks_duplicate.load(Ordering::Relaxed),
            tasks_rejected: self.tasks_rejected.load(Ordering::Relaxed),
            tasks_acquired: self.tasks_acquired.load(Ordering::Relaxed),
            acquire_misses: self.acquire_misses.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            report_failures: self.report_failures.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tasks_received: u64,
    pub tasks_duplicate: u64,
    pub tasks_rejected: u64,
    pub tasks_acquired: u64,
    pub acquire_misses: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub tasks_cancelled: u64,
    pub report_failures: u64,
    pub heartbeats_sent: u64,
    pub heartbeat_failures: u64,
    pub reconnect_attempts: u64,
}

/// Load observed since the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceSnapshot {
    pub max_executing_tasks: u64,
    pub max_executing_futures: u64,
    pub executing_tasks: u64,
    pub executing_futures: u64,
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
