//! Facade and lifecycle configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use stratus_core::{Error, Result};

use crate::gc::RetentionPolicy;
use crate::provider::http::HttpProviderConfig;

/// How calls travel to the backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Use the backend's native transport.
    #[default]
    Auto,
    /// The send operation yields the return.
    Direct,
    /// Calls and returns travel on separate queues.
    Queue,
}

/// When garbage collection runs for a new facade.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GcMode {
    /// Run one pass in the background; `cleanup` waits for it.
    #[default]
    Auto,
    /// Run one pass to completion before the facade is returned.
    Force,
    /// Never collect.
    Off,
}

fn default_concurrency() -> usize {
    100
}

fn default_retention_in_days() -> u32 {
    RetentionPolicy::default().retention_in_days
}

/// Options for a [`FunctionFacade`](crate::facade::FunctionFacade).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use stratus_invoke::config::{FacadeOptions, GcMode};
///
/// let options = FacadeOptions::default()
///     .with_concurrency(10)
///     .with_gc(GcMode::Off)
///     .with_call_timeout(Duration::from_secs(30));
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FacadeOptions {
    /// Maximum calls in flight at once; 0 means unbounded.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Transport selection.
    #[serde(default)]
    pub mode: TransportMode,
    /// Garbage collection on start.
    #[serde(default)]
    pub gc: GcMode,
    /// Minimum age before another instance's resources are reclaimed.
    #[serde(default = "default_retention_in_days")]
    pub retention_in_days: u32,
    /// How long a queue-relayed call waits for its return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout: Option<Duration>,
    /// Starts periodic stats reporting at this interval when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_interval: Option<Duration>,
    /// Settings for the HTTP backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpProviderConfig>,
}

impl Default for FacadeOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            mode: TransportMode::default(),
            gc: GcMode::default(),
            retention_in_days: default_retention_in_days(),
            call_timeout: None,
            stats_interval: None,
            http: None,
        }
    }
}

impl FacadeOptions {
    /// Sets the concurrency cap; 0 means unbounded.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the transport mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the garbage collection mode.
    #[must_use]
    pub const fn with_gc(mut self, gc: GcMode) -> Self {
        self.gc = gc;
        self
    }

    /// Sets the retention threshold in days.
    #[must_use]
    pub const fn with_retention_in_days(mut self, days: u32) -> Self {
        self.retention_in_days = days;
        self
    }

    /// Sets the call timeout.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Enables periodic stats reporting.
    #[must_use]
    pub const fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = Some(interval);
        self
    }

    /// Sets the HTTP backend configuration.
    #[must_use]
    pub fn with_http(mut self, http: HttpProviderConfig) -> Self {
        self.http = Some(http);
        self
    }

    /// Returns the retention policy these options describe.
    #[must_use]
    pub const fn retention(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.retention_in_days)
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for zero durations or an invalid HTTP
    /// configuration.
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::configuration("callTimeout must be greater than zero"));
        }
        if self.stats_interval.is_some_and(|i| i.is_zero()) {
            return Err(Error::configuration(
                "statsInterval must be greater than zero",
            ));
        }
        if let Some(http) = &self.http {
            http.validate()?;
        }
        Ok(())
    }
}

/// Options for [`FunctionFacade::cleanup`](crate::facade::FunctionFacade::cleanup).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOptions {
    /// Delete backend resources. When false the instance only drops its
    /// handle, leaving the resources for a later garbage collection pass.
    pub delete_resources: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            delete_resources: true,
        }
    }
}

impl CleanupOptions {
    /// Cleanup that leaves backend resources in place.
    #[must_use]
    pub const fn retain_resources() -> Self {
        Self {
            delete_resources: false,
        }
    }
}
