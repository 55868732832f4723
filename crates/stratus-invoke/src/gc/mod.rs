//! Garbage collection for resources abandoned by other instances.
//!
//! An instance that crashes, exits early or is cleaned up with
//! [`CleanupOptions::retain_resources`](crate::config::CleanupOptions::retain_resources)
//! leaves its backend resources behind. Any later instance reclaims them:
//!
//! - **Discover**: list every [`ResourceRecord`] the framework created
//! - **Partition**: split into owned, retained (too young) and orphaned
//! - **Reclaim**: hand each orphan to a [`ReclaimWorker`]
//!
//! There is no coordinator and no lease. Deletes are idempotent, so two
//! instances reclaiming the same orphan both succeed.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stratus_invoke::gc::{GarbageCollector, RetentionPolicy};
//!
//! let collector = GarbageCollector::new(store, instance_id, RetentionPolicy::default());
//!
//! // Dry run first
//! let report = collector.collect_dry_run().await?;
//! println!("Would delete {} resources", report.resources_to_delete());
//!
//! // Actually collect
//! let result = collector.collect().await;
//! println!("Deleted {} resources", result.resources_deleted);
//! ```

mod collector;
mod policy;
mod store;

pub use collector::{
    delete_descriptors, DeleteAllWorker, GarbageCollector, GcReport, GcResult, Partition,
    ReclaimOutcome, ReclaimWorker,
};
pub use policy::RetentionPolicy;
pub use store::{
    DeleteOutcome, InMemoryResourceStore, ResourceDescriptor, ResourceKind, ResourceRecord,
    ResourceStore,
};
