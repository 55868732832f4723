//! Strongly-typed identifiers for stratus entities.
//!
//! All identifiers are ULIDs:
//! - **Strongly typed**: a `CallId` cannot be passed where an `InstanceId` is expected
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: no coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use stratus_core::id::{CallId, InstanceId};
//!
//! let call = CallId::generate();
//! let instance = InstanceId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: CallId = instance;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Correlates a `Return` with the `Call` that produced it.
///
/// Unique for the lifetime of the facade that generated it. Queue-relayed
/// transports deliver results out of order on shared channels, so this is
/// the only key used to match a result to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Ulid);

impl CallId {
    /// Generates a new unique call ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a call ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CallId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid call ID '{s}': {e}"),
            })
    }
}

/// Identifies one deployed backend instance.
///
/// Every cloud resource an instance creates is tagged with its instance ID,
/// which is how the garbage collector tells its own resources apart from
/// those abandoned by other instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Ulid);

impl InstanceId {
    /// Generates a new unique instance ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates an instance ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid instance ID '{s}': {e}"),
            })
    }
}
