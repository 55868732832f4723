//! Per-function counters and latency statistics.
//!
//! One [`FunctionLedger`] belongs to one facade instance. Counters only ever
//! increase; a fresh ledger comes with a fresh facade.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::envelope::Response;

/// Running mean, standard deviation, minimum and maximum of a series.
///
/// Uses Welford's online algorithm so samples are never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningStats {
    samples: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// Adds one sample.
    #[allow(clippy::cast_precision_loss)]
    pub fn update(&mut self, value: f64) {
        if self.samples == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.samples += 1;
        let delta = value - self.mean;
        self.mean += delta / self.samples as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Number of samples seen.
    #[must_use]
    pub const fn samples(&self) -> u64 {
        self.samples
    }

    /// Arithmetic mean, 0 when empty.
    #[must_use]
    pub const fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation, 0 with fewer than two samples.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stdev(&self) -> f64 {
        if self.samples < 2 {
            0.0
        } else {
            (self.m2 / self.samples as f64).sqrt()
        }
    }

    /// Smallest sample, 0 when empty.
    #[must_use]
    pub const fn min(&self) -> f64 {
        self.min
    }

    /// Largest sample, 0 when empty.
    #[must_use]
    pub const fn max(&self) -> f64 {
        self.max
    }
}

impl fmt::Display for RunningStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.samples == 0 {
            return write!(f, "n/a");
        }
        write!(
            f,
            "{:.1}ms ±{:.1} [{:.0}..{:.0}]",
            self.mean,
            self.stdev(),
            self.min,
            self.max
        )
    }
}

/// Counters and latency statistics for one function name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMetrics {
    /// Calls submitted.
    pub invocations: u64,
    /// Calls that produced a response, successful or not.
    pub completed: u64,
    /// Completed calls whose outcome was an error.
    pub errors: u64,
    /// Dispatch and queueing delay, in milliseconds.
    pub start_latency: RunningStats,
    /// Remote compute time, in milliseconds.
    pub execution_latency: RunningStats,
    /// Result transit delay, in milliseconds.
    pub return_latency: RunningStats,
}

impl FunctionMetrics {
    /// Number of calls submitted but not yet completed.
    #[must_use]
    pub const fn in_flight(&self) -> u64 {
        self.invocations.saturating_sub(self.completed)
    }
}

impl fmt::Display for FunctionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invocations: {}, completed: {}, errors: {}, start: {}, execution: {}, return: {}",
            self.invocations,
            self.completed,
            self.errors,
            self.start_latency,
            self.execution_latency,
            self.return_latency
        )
    }
}

/// Metrics for every function invoked through one facade.
#[derive(Debug, Default)]
pub struct FunctionLedger {
    functions: Mutex<BTreeMap<String, FunctionMetrics>>,
}

impl FunctionLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, FunctionMetrics>> {
        self.functions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts a submitted call.
    pub fn record_invocation(&self, function: &str) {
        self.entries()
            .entry(function.to_string())
            .or_default()
            .invocations += 1;
    }

    /// Counts a completed call and merges its latencies.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_completion(&self, function: &str, response: &Response) {
        let mut entries = self.entries();
        let metrics = entries.entry(function.to_string()).or_default();
        metrics.completed += 1;
        if response.is_error() {
            metrics.errors += 1;
        }
        if let Some(ms) = response.start_latency {
            metrics.start_latency.update(ms as f64);
        }
        if let Some(ms) = response.execution_latency {
            metrics.execution_latency.update(ms as f64);
        }
        if let Some(ms) = response.return_latency {
            metrics.return_latency.update(ms as f64);
        }
    }

    /// Returns the metrics for one function, if it was ever invoked.
    #[must_use]
    pub fn get(&self, function: &str) -> Option<FunctionMetrics> {
        self.entries().get(function).copied()
    }

    /// Returns a copy of every function's metrics, ordered by name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, FunctionMetrics> {
        self.entries().clone()
    }

    /// Returns the sum of counters across all functions. Latency
    /// statistics are not aggregated.
    #[must_use]
    pub fn totals(&self) -> FunctionMetrics {
        self.entries()
            .values()
            .fold(FunctionMetrics::default(), |mut acc, m| {
                acc.invocations += m.invocations;
                acc.completed += m.completed;
                acc.errors += m.errors;
                acc
            })
    }
}
