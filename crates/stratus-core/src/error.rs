//! Error types and result aliases for stratus.
//!
//! Errors are structured for programmatic handling. Every variant maps to a
//! stable error name (see [`Error::name`]) so that a local failure can be
//! carried across the call/return boundary in the same shape as an error
//! raised by a remote function.

/// The result type used throughout stratus.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in stratus operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Dispatching a call to a backend failed before any result existed.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Configuration was invalid or incomplete.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// The requested resource or function was not found.
    #[error("not found: {resource_type} {id}")]
    NotFound {
        /// The type of thing that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// The operation was cancelled before it started.
    #[error("cancelled: {message}")]
    Cancelled {
        /// Why the operation was cancelled.
        message: String,
    },

    /// No result arrived within the allotted time.
    #[error("timed out after {millis}ms")]
    Timeout {
        /// The timeout that elapsed, in milliseconds.
        millis: u64,
    },

    /// The instance has been stopped and no longer accepts work.
    #[error("instance stopped")]
    Stopped,

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new transport error with the given message.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new transport error with a source cause.
    #[must_use]
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new cancellation error.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the stable error name used when this error crosses the
    /// call/return boundary.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InvalidId { .. } => "InvalidIdError",
            Self::Transport { .. } => "TransportError",
            Self::Serialization { .. } => "SerializationError",
            Self::Configuration { .. } => "ConfigurationError",
            Self::NotFound { .. } => "NotFoundError",
            Self::Cancelled { .. } => "CancelledError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Stopped => "StoppedError",
            Self::Internal { .. } => "InternalError",
        }
    }

    /// Returns true if the error means the target is already absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
