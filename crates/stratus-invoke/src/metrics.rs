//! Observability metrics for remote invocation.
//!
//! Complements the in-process [`FunctionLedger`](crate::ledger::FunctionLedger)
//! with Prometheus-compatible series exported through the `metrics` facade.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `stratus_calls_total` | Counter | `function`, `outcome` | Completed calls |
//! | `stratus_call_latency_seconds` | Histogram | `function`, `phase` | Start, execution and return latency |
//! | `stratus_funnel_running` | Gauge | `funnel` | Operations running in a funnel |
//! | `stratus_funnel_pending` | Gauge | `funnel` | Operations queued in a funnel |
//! | `stratus_unmatched_returns_total` | Counter | - | Returns with no outstanding call |
//! | `stratus_gc_resources_deleted_total` | Counter | `kind` | Orphaned resources reclaimed |
//! | `stratus_gc_errors_total` | Counter | `phase` | Garbage collection failures |
//! | `stratus_gc_run_duration_seconds` | Histogram | - | Duration of a collection pass |
//!
//! Recording is a no-op until the host installs a recorder, e.g.
//! `metrics_exporter_prometheus::PrometheusBuilder`.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

use crate::envelope::Response;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Completed calls.
    pub const CALLS_TOTAL: &str = "stratus_calls_total";
    /// Histogram: Call latency by phase in seconds.
    pub const CALL_LATENCY_SECONDS: &str = "stratus_call_latency_seconds";
    /// Gauge: Operations running in a funnel.
    pub const FUNNEL_RUNNING: &str = "stratus_funnel_running";
    /// Gauge: Operations queued in a funnel.
    pub const FUNNEL_PENDING: &str = "stratus_funnel_pending";
    /// Counter: Returns that matched no outstanding call.
    pub const UNMATCHED_RETURNS_TOTAL: &str = "stratus_unmatched_returns_total";
    /// Counter: Orphaned resources deleted by garbage collection.
    pub const GC_RESOURCES_DELETED_TOTAL: &str = "stratus_gc_resources_deleted_total";
    /// Counter: Garbage collection failures.
    pub const GC_ERRORS_TOTAL: &str = "stratus_gc_errors_total";
    /// Histogram: Garbage collection pass duration in seconds.
    pub const GC_RUN_DURATION_SECONDS: &str = "stratus_gc_run_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Function name.
    pub const FUNCTION: &str = "function";
    /// Call outcome (value, error).
    pub const OUTCOME: &str = "outcome";
    /// Latency phase (start, execution, return).
    pub const PHASE: &str = "phase";
    /// Funnel name.
    pub const FUNNEL: &str = "funnel";
    /// Resource kind.
    pub const KIND: &str = "kind";
}

/// Records a completed call and its latencies.
#[allow(clippy::cast_precision_loss)]
pub fn record_call(function: &str, response: &Response) {
    let outcome = if response.is_error() { "error" } else { "value" };
    counter!(
        names::CALLS_TOTAL,
        labels::FUNCTION => function.to_string(),
        labels::OUTCOME => outcome,
    )
    .increment(1);

    let phases = [
        ("start", response.start_latency),
        ("execution", response.execution_latency),
        ("return", response.return_latency),
    ];
    for (phase, latency) in phases {
        if let Some(ms) = latency {
            histogram!(
                names::CALL_LATENCY_SECONDS,
                labels::FUNCTION => function.to_string(),
                labels::PHASE => phase,
            )
            .record(ms as f64 / 1000.0);
        }
    }
}

/// Sets the running and pending gauges of a named funnel.
#[allow(clippy::cast_precision_loss)]
pub fn record_funnel_depth(funnel: &str, running: usize, pending: usize) {
    gauge!(names::FUNNEL_RUNNING, labels::FUNNEL => funnel.to_string()).set(running as f64);
    gauge!(names::FUNNEL_PENDING, labels::FUNNEL => funnel.to_string()).set(pending as f64);
}

/// Counts a return that matched no outstanding call.
pub fn record_unmatched_return() {
    counter!(names::UNMATCHED_RETURNS_TOTAL).increment(1);
}

/// Counts one reclaimed resource.
pub fn record_gc_deletion(kind: &str) {
    counter!(
        names::GC_RESOURCES_DELETED_TOTAL,
        labels::KIND => kind.to_string(),
    )
    .increment(1);
}

/// Counts one garbage collection failure.
pub fn record_gc_error(phase: &'static str) {
    counter!(names::GC_ERRORS_TOTAL, labels::PHASE => phase).increment(1);
}

/// RAII guard for timing operations.
///
/// Calls `on_drop` with the elapsed duration when dropped.
///
/// ```rust
/// use stratus_invoke::metrics::TimingGuard;
///
/// {
///     let _guard = TimingGuard::new(|duration| {
///         assert!(duration.as_secs() < 60);
///     });
///     // Do work...
/// }
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for a garbage collection pass.
#[must_use]
pub fn time_gc_run() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| {
        histogram!(names::GC_RUN_DURATION_SECONDS).record(duration.as_secs_f64());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        let response = Response {
            value: Some(serde_json::json!(1)),
            error: None,
            raw: None,
            start_latency: Some(5),
            execution_latency: Some(10),
            return_latency: None,
        };
        record_call("f", &response);
        record_funnel_depth("local", 2, 3);
        record_unmatched_return();
        record_gc_deletion("queue");
        record_gc_error("discover");
    }

    #[test]
    fn timing_guard_measures_duration() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(10)));
    }

    #[test]
    fn gc_timer_records_on_drop() {
        let guard = time_gc_run();
        assert!(guard.elapsed() < Duration::from_secs(60));
    }
}
