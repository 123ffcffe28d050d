//! Client runtime metrics.
//!
//! Prometheus-style counters and gauges updated by the session as it
//! schedules, retries and completes work.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ClientMetrics                         │
//! │  ┌────────────────────┐ ┌───────────────┐ ┌───────────────┐  │
//! │  │ Counters           │ │ Gauges        │ │ By category   │  │
//! │  │ - ops scheduled    │ │ - in flight   │ │ - retries by  │  │
//! │  │ - retried / failed │ │ - retry queue │ │   reason      │  │
//! │  │ - configs adopted  │ │ - dur. sets   │ │               │  │
//! │  └────────────────────┘ └───────────────┘ └───────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::{CategoryCounter, Counter};
pub use gauges::Gauge;

use crate::error::ErrorCategory;
use std::fmt::Write;

/// Metrics of one session.
#[derive(Debug)]
pub struct ClientMetrics {
    /// Operations accepted by `schedule`.
    pub operations_scheduled: Counter,
    /// Operations put back on the retry queue.
    pub operations_retried: Counter,
    /// Operations completed with an error other than a timeout.
    pub operations_failed: Counter,
    /// Operations failed because their deadline passed.
    pub operations_timed_out: Counter,
    /// Configurations adopted.
    pub configs_adopted: Counter,
    /// Refresh requests skipped by throttling.
    pub refreshes_throttled: Counter,
    /// Durability keys that met their requirement.
    pub durability_completed: Counter,
    /// Durability keys that ended with an error.
    pub durability_failed: Counter,

    /// Operations sent and awaiting a response.
    pub inflight_operations: Gauge,
    /// Operations waiting on the retry queue.
    pub retry_queue_depth: Gauge,
    /// Live durability sets.
    pub durability_sets: Gauge,

    /// Retries by error category.
    pub retries_by_reason: CategoryCounter,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self {
            operations_scheduled: Counter::new(
                "vbc_operations_scheduled_total",
                "Operations scheduled",
            ),
            operations_retried: Counter::new("vbc_operations_retried_total", "Operations retried"),
            operations_failed: Counter::new("vbc_operations_failed_total", "Operations failed"),
            operations_timed_out: Counter::new(
                "vbc_operations_timed_out_total",
                "Operations timed out",
            ),
            configs_adopted: Counter::new("vbc_configs_adopted_total", "Configurations adopted"),
            refreshes_throttled: Counter::new(
                "vbc_refreshes_throttled_total",
                "Configuration refreshes skipped by throttling",
            ),
            durability_completed: Counter::new(
                "vbc_durability_completed_total",
                "Durability keys satisfied",
            ),
            durability_failed: Counter::new(
                "vbc_durability_failed_total",
                "Durability keys failed or timed out",
            ),
            inflight_operations: Gauge::new("vbc_inflight_operations", "Operations in flight"),
            retry_queue_depth: Gauge::new("vbc_retry_queue_depth", "Operations awaiting retry"),
            durability_sets: Gauge::new("vbc_durability_sets", "Live durability requests"),
            retries_by_reason: CategoryCounter::new("vbc_retries_total", "Retries by error category"),
        }
    }

    /// Record one retry for `reason`.
    pub fn record_retry(&self, reason: ErrorCategory) {
        self.operations_retried.inc();
        self.retries_by_reason.inc(reason);
    }

    /// Record a final failure.
    pub fn record_failure(&self, timed_out: bool) {
        if timed_out {
            self.operations_timed_out.inc();
        } else {
            self.operations_failed.inc();
        }
    }

    /// Get a snapshot of current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations_scheduled: self.operations_scheduled.get(),
            operations_retried: self.operations_retried.get(),
            operations_failed: self.operations_failed.get(),
            operations_timed_out: self.operations_timed_out.get(),
            configs_adopted: self.configs_adopted.get(),
            refreshes_throttled: self.refreshes_throttled.get(),
            durability_completed: self.durability_completed.get(),
            durability_failed: self.durability_failed.get(),
            inflight_operations: self.inflight_operations.get(),
            retry_queue_depth: self.retry_queue_depth.get(),
            durability_sets: self.durability_sets.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        for counter in [
            &self.operations_scheduled,
            &self.operations_retried,
            &self.operations_failed,
            &self.operations_timed_out,
            &self.configs_adopted,
            &self.refreshes_throttled,
            &self.durability_completed,
            &self.durability_failed,
        ] {
            let _ = write!(
                output,
                "# HELP {name} {}\n# TYPE {name} counter\n{name} {}\n",
                counter.help(),
                counter.get(),
                name = counter.name(),
            );
        }

        for gauge in [
            &self.inflight_operations,
            &self.retry_queue_depth,
            &self.durability_sets,
        ] {
            let _ = write!(
                output,
                "# HELP {name} {}\n# TYPE {name} gauge\n{name} {}\n",
                gauge.help(),
                gauge.get(),
                name = gauge.name(),
            );
        }

        let retries = &self.retries_by_reason;
        let _ = write!(
            output,
            "# HELP {name} {}\n# TYPE {name} counter\n",
            retries.help(),
            name = retries.name(),
        );
        for (reason, value) in retries.nonzero() {
            let _ = writeln!(
                output,
                "{}{{reason=\"{}\"}} {}",
                retries.name(),
                reason.as_str(),
                value
            );
        }

        output
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ClientMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub operations_scheduled: u64,
    pub operations_retried: u64,
    pub operations_failed: u64,
    pub operations_timed_out: u64,
    pub configs_adopted: u64,
    pub refreshes_throttled: u64,
    pub durability_completed: u64,
    pub durability_failed: u64,
    pub inflight_operations: i64,
    pub retry_queue_depth: i64,
    pub durability_sets: i64,
}

impl MetricsSnapshot {
    /// Share of scheduled operations that needed at least one retry.
    pub fn retry_rate(&self) -> f64 {
        if self.operations_scheduled == 0 {
            0.0
        } else {
            self.operations_retried as f64 / self.operations_scheduled as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_retry() {
        let metrics = ClientMetrics::new();
        for _ in 0..4 {
            metrics.operations_scheduled.inc();
        }
        metrics.record_retry(ErrorCategory::VbucketMap);
        metrics.record_retry(ErrorCategory::Network);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations_retried, 2);
        assert!((snapshot.retry_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(metrics.retries_by_reason.get(ErrorCategory::VbucketMap), 1);
        assert_eq!(metrics.retries_by_reason.total(), snapshot.operations_retried);
    }

    #[test]
    fn test_record_failure() {
        let metrics = ClientMetrics::new();
        metrics.record_failure(true);
        metrics.record_failure(false);
        metrics.record_failure(false);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations_timed_out, 1);
        assert_eq!(snapshot.operations_failed, 2);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = ClientMetrics::new();
        metrics.configs_adopted.inc();
        metrics.record_retry(ErrorCategory::Auth);

        let output = metrics.to_prometheus();
        assert!(output.contains("# TYPE vbc_configs_adopted_total counter"));
        assert!(output.contains("vbc_configs_adopted_total 1"));
        assert!(output.contains("# TYPE vbc_retry_queue_depth gauge"));
        assert!(output.contains("vbc_retries_total{reason=\"auth\"} 1"));
    }
}
