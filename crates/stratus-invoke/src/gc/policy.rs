//! Retention policy configuration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long another instance's resources are left alone before they count
/// as orphaned.
///
/// The grace period keeps the collector from racing an instance that has
/// allocated resources but not yet finished registering them.
///
/// # Example
///
/// ```rust
/// use stratus_invoke::gc::RetentionPolicy;
///
/// let policy = RetentionPolicy::default();
/// assert_eq!(policy.retention_in_days, 1);
///
/// // No grace period, for deterministic tests.
/// let policy = RetentionPolicy::immediate();
/// assert_eq!(policy.threshold(), chrono::Duration::zero());
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    /// Minimum age, in days, of a reclaimable record.
    pub retention_in_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_in_days: 1,
        }
    }
}

impl RetentionPolicy {
    /// Creates a policy with the given threshold.
    #[must_use]
    pub const fn new(retention_in_days: u32) -> Self {
        Self { retention_in_days }
    }

    /// Creates a policy with no grace period.
    #[must_use]
    pub const fn immediate() -> Self {
        Self::new(0)
    }

    /// Returns the retention threshold.
    #[must_use]
    pub fn threshold(&self) -> Duration {
        Duration::days(i64::from(self.retention_in_days))
    }

    /// Returns true once a record created at `created_at` is at least as old
    /// as the threshold.
    #[must_use]
    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - created_at >= self.threshold()
    }
}
