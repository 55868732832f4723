//! Garbage collector implementation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::Instrument;

use stratus_core::{InstanceId, Result};

use super::store::{DeleteOutcome, ResourceDescriptor, ResourceRecord, ResourceStore};
use super::RetentionPolicy;

/// Result of a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcResult {
    /// Records returned by discovery.
    pub records_discovered: u64,
    /// Records classified as orphans.
    pub orphans_found: u64,
    /// Resources deleted.
    pub resources_deleted: u64,
    /// Resources that were already gone.
    pub already_absent: u64,
    /// Errors encountered (GC continues on non-fatal errors).
    pub errors: Vec<String>,
}

impl GcResult {
    /// Merges another result into this one.
    pub fn merge(&mut self, other: Self) {
        self.records_discovered += other.records_discovered;
        self.orphans_found += other.orphans_found;
        self.resources_deleted += other.resources_deleted;
        self.already_absent += other.already_absent;
        self.errors.extend(other.errors);
    }

    /// Returns true if any errors were encountered.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Dry-run report showing what would be collected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Records owned by the collecting instance.
    pub owned: Vec<ResourceRecord>,
    /// Other instances' records still inside the retention window.
    pub retained: Vec<ResourceRecord>,
    /// Records that would be reclaimed.
    pub orphans: Vec<ResourceRecord>,
}

impl GcReport {
    /// Total resources a real run would try to delete.
    #[must_use]
    pub fn resources_to_delete(&self) -> usize {
        self.orphans.iter().map(|r| r.descriptors.len()).sum()
    }
}

/// Discovered records split by ownership and age.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Owned by the collecting instance; never touched.
    pub owned: Vec<ResourceRecord>,
    /// Owned by another instance and younger than the threshold; never
    /// touched, the owner may still be initializing.
    pub retained: Vec<ResourceRecord>,
    /// Owned by another instance and at least as old as the threshold.
    pub orphans: Vec<ResourceRecord>,
}

/// What a [`ReclaimWorker`] did with one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimOutcome {
    /// Resources deleted.
    pub deleted: u64,
    /// Resources that were already gone.
    pub already_absent: u64,
    /// Failures, one per resource.
    pub errors: Vec<String>,
}

impl ReclaimOutcome {
    fn merge_into(self, result: &mut GcResult) {
        result.resources_deleted += self.deleted;
        result.already_absent += self.already_absent;
        result.errors.extend(self.errors);
    }
}

/// Reclaims the resources of one orphaned record.
///
/// Implementations must try every descriptor and must not stop at the first
/// failure.
#[async_trait]
pub trait ReclaimWorker: Send + Sync {
    /// Deletes the resources of `record` through `store`.
    async fn reclaim(&self, store: &dyn ResourceStore, record: &ResourceRecord) -> ReclaimOutcome;
}

/// Worker that deletes every resource of a record.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteAllWorker;

#[async_trait]
impl ReclaimWorker for DeleteAllWorker {
    async fn reclaim(&self, store: &dyn ResourceStore, record: &ResourceRecord) -> ReclaimOutcome {
        delete_descriptors(store, &record.descriptors).await
    }
}

/// Deletes each descriptor, logging and skipping individual failures.
///
/// Absence is success: it is logged at `debug` only. Any other failure is
/// logged at `warn` and recorded in the outcome.
pub async fn delete_descriptors(
    store: &dyn ResourceStore,
    descriptors: &[ResourceDescriptor],
) -> ReclaimOutcome {
    let mut outcome = ReclaimOutcome::default();
    for descriptor in descriptors {
        match store.delete_resource(descriptor).await {
            Ok(DeleteOutcome::Deleted) => {
                tracing::debug!(resource = %descriptor, "deleted resource");
                crate::metrics::record_gc_deletion(descriptor.kind.as_str());
                outcome.deleted += 1;
            }
            Ok(DeleteOutcome::AlreadyAbsent) => {
                tracing::debug!(resource = %descriptor, "resource already absent");
                outcome.already_absent += 1;
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(resource = %descriptor, "resource already absent");
                outcome.already_absent += 1;
            }
            Err(e) => {
                tracing::warn!(
                    resource = %descriptor,
                    error = %e,
                    metric = "stratus_gc_errors_total",
                    "failed to delete resource; continuing"
                );
                crate::metrics::record_gc_error("reclaim");
                outcome.errors.push(format!("delete {descriptor}: {e}"));
            }
        }
    }
    outcome
}

/// Decentralized collector for resources abandoned by other instances.
///
/// A pass runs Discover, Partition and Reclaim. Nothing coordinates passes
/// across instances: several collectors may reclaim the same orphan at once,
/// and idempotent deletes keep that safe.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use stratus_core::InstanceId;
/// use stratus_invoke::gc::{GarbageCollector, InMemoryResourceStore, RetentionPolicy};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = Arc::new(InMemoryResourceStore::new());
/// let collector = GarbageCollector::new(store, InstanceId::generate(), RetentionPolicy::default());
///
/// // Dry run first
/// let report = collector.collect_dry_run().await.unwrap();
/// assert!(report.orphans.is_empty());
///
/// // Actually collect
/// let result = collector.collect().await;
/// assert!(!result.has_errors());
/// # }
/// ```
pub struct GarbageCollector {
    store: Arc<dyn ResourceStore>,
    current: InstanceId,
    policy: RetentionPolicy,
    worker: Arc<dyn ReclaimWorker>,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("current", &self.current)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl GarbageCollector {
    /// Creates a collector running on behalf of `current`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        current: InstanceId,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            store,
            current,
            policy,
            worker: Arc::new(DeleteAllWorker),
        }
    }

    /// Replaces the reclamation worker.
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<dyn ReclaimWorker>) -> Self {
        self.worker = worker;
        self
    }

    /// Splits `records` by owner and age as of `now`.
    #[must_use]
    pub fn partition(&self, records: Vec<ResourceRecord>, now: DateTime<Utc>) -> Partition {
        let mut partition = Partition::default();
        for record in records {
            if record.owner == self.current {
                partition.owned.push(record);
            } else if self.policy.is_expired(record.created_at, now) {
                partition.orphans.push(record);
            } else {
                partition.retained.push(record);
            }
        }
        partition
    }

    /// Runs Discover and Partition without deleting anything.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails.
    pub async fn collect_dry_run(&self) -> Result<GcReport> {
        let records = self.store.list_owned_resources().await?;
        let Partition {
            owned,
            retained,
            orphans,
        } = self.partition(records, Utc::now());
        Ok(GcReport {
            owned,
            retained,
            orphans,
        })
    }

    /// Runs a full pass.
    ///
    /// Never fails: a discovery failure or individual deletion failures are
    /// recorded in the result's `errors` field.
    pub async fn collect(&self) -> GcResult {
        let span = stratus_core::observability::gc_span(&self.current.to_string());
        self.collect_inner().instrument(span).await
    }

    async fn collect_inner(&self) -> GcResult {
        let _timer = crate::metrics::time_gc_run();
        let start = Instant::now();
        let mut result = GcResult::default();

        tracing::info!(
            retention_in_days = self.policy.retention_in_days,
            metric = "stratus_gc_run_started",
            "starting garbage collection"
        );

        let records = match self.store.list_owned_resources().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(
                    phase = "discover",
                    error = %e,
                    metric = "stratus_gc_errors_total",
                    "GC phase failed"
                );
                crate::metrics::record_gc_error("discover");
                result.errors.push(format!("discover: {e}"));
                return result;
            }
        };
        result.records_discovered = records.len() as u64;

        let partition = self.partition(records, Utc::now());
        tracing::info!(
            phase = "partition",
            owned = partition.owned.len(),
            retained = partition.retained.len(),
            orphans = partition.orphans.len(),
            metric = "stratus_gc_phase_completed",
            "GC phase completed"
        );

        result.merge(self.reclaim(&partition.orphans).await);

        tracing::info!(
            records_discovered = result.records_discovered,
            orphans_found = result.orphans_found,
            resources_deleted = result.resources_deleted,
            already_absent = result.already_absent,
            errors_count = result.errors.len(),
            duration_secs = start.elapsed().as_secs_f64(),
            metric = "stratus_gc_run_completed",
            "garbage collection completed"
        );
        result
    }

    /// Hands each orphan to the worker. Safe to call again over the same
    /// records: resources already deleted count as `already_absent`.
    pub async fn reclaim(&self, orphans: &[ResourceRecord]) -> GcResult {
        let mut result = GcResult {
            orphans_found: orphans.len() as u64,
            ..GcResult::default()
        };
        for record in orphans {
            let outcome = self.worker.reclaim(self.store.as_ref(), record).await;
            tracing::info!(
                owner = %record.owner,
                deleted = outcome.deleted,
                already_absent = outcome.already_absent,
                errors = outcome.errors.len(),
                "reclaimed orphaned instance"
            );
            outcome.merge_into(&mut result);
        }
        result
    }
}
