//! Process-wide call and execution counters.
//!
//! Counters are bumped at the call site; [`Metrics::flush`] emits the current
//! values as one `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    intercepted_calls: AtomicU64,
    tool_calls: AtomicU64,
    tool_call_failures: AtomicU64,
    executions: AtomicU64,
    execution_failures: AtomicU64,
    timeouts: AtomicU64,
    resource_kills: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub intercepted_calls: u64,
    pub tool_calls: u64,
    pub tool_call_failures: u64,
    pub executions: u64,
    pub execution_failures: u64,
    pub timeouts: u64,
    pub resource_kills: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            intercepted_calls: AtomicU64::new(0),
            tool_calls: AtomicU64::new(0),
            tool_call_failures: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            execution_failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            resource_kills: AtomicU64::new(0),
        }
    }

    pub fn inc_intercepted_calls(&self) {
        self.intercepted_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tool_calls(&self) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tool_call_failures(&self) {
        self.tool_call_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_executions(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_execution_failures(&self) {
        self.execution_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "timeouts", "counter incremented");
    }

    pub fn inc_resource_kills(&self) {
        self.resource_kills.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "resource_kills", "counter incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            intercepted_calls: self.intercepted_calls.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            tool_call_failures: self.tool_call_failures.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            execution_failures: self.execution_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            resource_kills: self.resource_kills.load(Ordering::Relaxed),
        }
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            intercepted_calls = s.intercepted_calls,
            tool_calls = s.tool_calls,
            tool_call_failures = s.tool_call_failures,
            executions = s.executions,
            execution_failures = s.execution_failures,
            timeouts = s.timeouts,
            resource_kills = s.resource_kills,
        );
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        self.intercepted_calls.store(0, Ordering::Relaxed);
        self.tool_calls.store(0, Ordering::Relaxed);
        self.tool_call_failures.store(0, Ordering::Relaxed);
        self.executions.store(0, Ordering::Relaxed);
        self.execution_failures.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.resource_kills.store(0, Ordering::Relaxed);
    }
}
