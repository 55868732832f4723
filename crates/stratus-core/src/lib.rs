//! # stratus-core
//!
//! Shared primitives for the stratus remote invocation engine.
//!
//! - **Identifiers**: ULID-backed `CallId` and `InstanceId`
//! - **Error Types**: The shared error enum and result alias
//! - **Observability**: Logging initialization and span constructors
//!
//! ## Example
//!
//! ```rust
//! use stratus_core::prelude::*;
//!
//! let instance = InstanceId::generate();
//! let call = CallId::generate();
//! assert_ne!(instance.to_string(), call.to_string());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{CallId, InstanceId};
}

pub use error::{Error, Result};
pub use id::{CallId, InstanceId};
pub use observability::{init_logging, LogFormat};
