//! # stratus-invoke
//!
//! Backend-agnostic engine for invoking functions as remote compute units.
//!
//! This crate provides:
//!
//! - **Funnel**: A concurrency-bounded FIFO admission queue
//! - **Envelope & Correlator**: The call/return wire shapes and the matching
//!   of asynchronously delivered returns to their calls
//! - **Ledger**: Per-function counters and latency statistics
//! - **Facade**: Remotely invocable proxies over one backend instance
//! - **Providers**: Local, queue-relayed and HTTP backends behind one
//!   capability interface
//! - **Garbage Collector**: Decentralized reclamation of resources abandoned
//!   by other instances
//!
//! ## Guarantees
//!
//! - **Every call settles**: Transport failures, timeouts and cancellations
//!   become error responses, never hangs or panics
//! - **Faithful errors**: Remote error name, message and stack survive the
//!   boundary unchanged
//! - **Idempotent cleanup**: Deleting an absent resource is success
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use stratus_invoke::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> stratus_core::Result<()> {
//! let module = FunctionModule::new()
//!     .function("add", |args: Vec<Value>| async move {
//!         Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
//!     })
//!     .constant("VERSION", json!(2));
//!
//! let store = Arc::new(InMemoryResourceStore::new());
//! let options = FacadeOptions::default().with_concurrency(4);
//! let facade = FunctionFacade::start(module.clone(), ProviderKind::Queue, options, store).await?;
//!
//! let remote = facade.wrap_all(&module);
//! assert_eq!(remote["add"].call(vec![json!(1), json!(2)]).await.unwrap(), json!(3));
//! assert!(!remote.contains_key("VERSION"));
//!
//! facade.cleanup(CleanupOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod correlator;
pub mod envelope;
pub mod facade;
pub mod funnel;
pub mod gc;
pub mod ledger;
pub mod metrics;
pub mod module;
pub mod provider;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{CleanupOptions, FacadeOptions, GcMode, TransportMode};
    pub use crate::envelope::{Call, RemoteError, Response, Return};
    pub use crate::facade::{FunctionFacade, RemoteFunction, ResponseFunction};
    pub use crate::funnel::{Funnel, FunnelError};
    pub use crate::gc::{InMemoryResourceStore, ResourceStore, RetentionPolicy};
    pub use crate::ledger::FunctionMetrics;
    pub use crate::module::FunctionModule;
    pub use crate::provider::{Provider, ProviderKind};
}
