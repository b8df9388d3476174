//! Bridge metrics for monitoring and observability.
//!
//! This module collects counters about dispatched calls, pending operations,
//! handles and the call invoker, and renders them in Prometheus text format.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time statistics for a registered module
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    /// Total dispatched calls
    pub calls_total: u64,

    /// Dispatched calls that failed
    pub calls_failed: u64,

    /// Async operations started
    pub futures_started: u64,

    /// Async operations completed with a value or an error
    pub futures_completed: u64,

    /// Async operations cancelled
    pub futures_cancelled: u64,

    /// Completions discarded because cancellation won the race
    pub futures_discarded: u64,

    /// Pending operations currently alive
    pub pending_operations: usize,

    /// Handles created by constructors
    pub handles_created: u64,

    /// Handles whose object was destroyed
    pub handles_destroyed: u64,

    /// Handles currently alive
    pub live_handles: usize,

    /// Continuations dropped because the host was torn down
    pub continuations_dropped: u64,
}

/// Metrics collector for a registered module
pub struct BridgeMetrics {
    calls_total: AtomicU64,
    calls_failed: AtomicU64,
    futures_started: AtomicU64,
    futures_completed: AtomicU64,
    futures_cancelled: AtomicU64,
    futures_discarded: AtomicU64,
    handles_created: AtomicU64,
    handles_destroyed: AtomicU64,
    continuations_dropped: AtomicU64,
    method_calls: parking_lot::Mutex<HashMap<String, u64>>,
    error_counts: parking_lot::Mutex<HashMap<ErrorCode, u64>>,
}

impl BridgeMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            calls_total: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            futures_started: AtomicU64::new(0),
            futures_completed: AtomicU64::new(0),
            futures_cancelled: AtomicU64::new(0),
            futures_discarded: AtomicU64::new(0),
            handles_created: AtomicU64::new(0),
            handles_destroyed: AtomicU64::new(0),
            continuations_dropped: AtomicU64::new(0),
            method_calls: parking_lot::Mutex::new(HashMap::new()),
            error_counts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record a dispatched call
    pub fn record_call(&self, method: &str, error: Option<ErrorCode>) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        *self.method_calls.lock().entry(method.to_string()).or_insert(0) += 1;

        if let Some(code) = error {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
            self.record_error(code);
        }
    }

    /// Record an error
    pub fn record_error(&self, code: ErrorCode) {
        *self.error_counts.lock().entry(code).or_insert(0) += 1;
    }

    /// Record a started async operation
    pub fn record_future_started(&self) {
        self.futures_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed async operation
    pub fn record_future_completed(&self) {
        self.futures_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cancelled async operation
    pub fn record_future_cancelled(&self) {
        self.futures_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completion that lost the race against cancellation
    pub fn record_future_discarded(&self) {
        self.futures_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handle created by a constructor
    pub fn record_handle_created(&self) {
        self.handles_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a destroyed handle
    pub fn record_handle_destroyed(&self) {
        self.handles_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a continuation dropped by a closed invoker
    pub fn record_continuation_dropped(&self) {
        self.continuations_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total dispatched calls
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get failed dispatched calls
    pub fn calls_failed(&self) -> u64 {
        self.calls_failed.load(Ordering::Relaxed)
    }

    /// Get dropped continuations
    pub fn continuations_dropped(&self) -> u64 {
        self.continuations_dropped.load(Ordering::Relaxed)
    }

    /// Get per-method call counts
    pub fn method_calls(&self) -> HashMap<String, u64> {
        self.method_calls.lock().clone()
    }

    /// Get error counts
    pub fn error_counts(&self) -> HashMap<ErrorCode, u64> {
        self.error_counts.lock().clone()
    }

    /// Build a stats snapshot, given the current table sizes
    pub fn snapshot(&self, pending_operations: usize, live_handles: usize) -> BridgeStats {
        BridgeStats {
            calls_total: self.calls_total(),
            calls_failed: self.calls_failed(),
            futures_started: self.futures_started.load(Ordering::Relaxed),
            futures_completed: self.futures_completed.load(Ordering::Relaxed),
            futures_cancelled: self.futures_cancelled.load(Ordering::Relaxed),
            futures_discarded: self.futures_discarded.load(Ordering::Relaxed),
            pending_operations,
            handles_created: self.handles_created.load(Ordering::Relaxed),
            handles_destroyed: self.handles_destroyed.load(Ordering::Relaxed),
            live_handles,
            continuations_dropped: self.continuations_dropped(),
        }
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP lni_bridge_calls_total Dispatched calls\n");
        output.push_str("# TYPE lni_bridge_calls_total counter\n");
        output.push_str(&format!(
            "lni_bridge_calls_total{{status=\"success\"}} {}\n",
            self.calls_total() - self.calls_failed()
        ));
        output.push_str(&format!(
            "lni_bridge_calls_total{{status=\"error\"}} {}\n",
            self.calls_failed()
        ));

        output.push_str("\n# HELP lni_bridge_futures_total Async operations by terminal state\n");
        output.push_str("# TYPE lni_bridge_futures_total counter\n");
        for (state, counter) in [
            ("started", &self.futures_started),
            ("completed", &self.futures_completed),
            ("cancelled", &self.futures_cancelled),
            ("discarded", &self.futures_discarded),
        ] {
            output.push_str(&format!(
                "lni_bridge_futures_total{{state=\"{}\"}} {}\n",
                state,
                counter.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP lni_bridge_handles_total Native object handles\n");
        output.push_str("# TYPE lni_bridge_handles_total counter\n");
        output.push_str(&format!(
            "lni_bridge_handles_total{{event=\"created\"}} {}\n",
            self.handles_created.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "lni_bridge_handles_total{{event=\"destroyed\"}} {}\n",
            self.handles_destroyed.load(Ordering::Relaxed)
        ));

        output.push_str("\n# HELP lni_bridge_continuations_dropped_total Continuations dropped after teardown\n");
        output.push_str("# TYPE lni_bridge_continuations_dropped_total counter\n");
        output.push_str(&format!(
            "lni_bridge_continuations_dropped_total {}\n",
            self.continuations_dropped()
        ));

        output.push_str("\n# HELP lni_bridge_method_calls_total Calls per method\n");
        output.push_str("# TYPE lni_bridge_method_calls_total counter\n");
        let mut methods: Vec<_> = self.method_calls().into_iter().collect();
        methods.sort();
        for (name, count) in methods {
            output.push_str(&format!(
                "lni_bridge_method_calls_total{{method=\"{}\"}} {}\n",
                name, count
            ));
        }

        output.push_str("\n# HELP lni_bridge_errors_total Error counts by code\n");
        output.push_str("# TYPE lni_bridge_errors_total counter\n");
        for (code, count) in self.error_counts() {
            output.push_str(&format!(
                "lni_bridge_errors_total{{code=\"{}\"}} {}\n",
                code, count
            ));
        }

        output
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
