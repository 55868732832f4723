//! Discovery and deletion surface for framework-owned resources.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stratus_core::{Error, InstanceId, Result};

/// Kind of a backend resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    /// A message queue.
    Queue,
    /// A deployed function.
    Function,
    /// A log group.
    LogGroup,
    /// An execution role.
    Role,
    /// Any other provider-specific kind.
    Other(String),
}

impl ResourceKind {
    /// Returns the kind as a metrics label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queue => "queue",
            Self::Function => "function",
            Self::LogGroup => "logGroup",
            Self::Role => "role",
            Self::Other(kind) => kind,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backend resource: its kind and provider-specific identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-specific identifier.
    pub id: String,
}

impl ResourceDescriptor {
    /// Creates a descriptor.
    #[must_use]
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// The resources one instance created, registered once setup completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    /// Instance that created the resources.
    pub owner: InstanceId,
    /// Every resource belonging to the instance.
    pub descriptors: Vec<ResourceDescriptor>,
    /// When the record was registered.
    pub created_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(owner: InstanceId, descriptors: Vec<ResourceDescriptor>) -> Self {
        Self {
            owner,
            descriptors,
            created_at: Utc::now(),
        }
    }

    /// Overrides the registration time.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Outcome of a successful delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The resource existed and was removed.
    Deleted,
    /// The resource was already gone.
    AlreadyAbsent,
}

/// Backend surface for discovering and deleting framework-owned resources.
///
/// Listing only ever returns resources tagged as created by this framework.
/// Deletes are idempotent: a missing resource yields
/// [`DeleteOutcome::AlreadyAbsent`], never an error.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Registers an instance's resources. The record becomes visible to
    /// listings all at once.
    async fn register(&self, record: ResourceRecord) -> Result<()>;

    /// Lists every record that still has at least one live resource.
    async fn list_owned_resources(&self) -> Result<Vec<ResourceRecord>>;

    /// Deletes one resource.
    async fn delete_resource(&self, descriptor: &ResourceDescriptor) -> Result<DeleteOutcome>;
}

#[derive(Debug, Default)]
struct StoreState {
    records: BTreeMap<InstanceId, ResourceRecord>,
    live: HashSet<ResourceDescriptor>,
    delete_failures: HashMap<String, String>,
    list_failure: Option<String>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("resource store lock poisoned")
}

/// In-memory resource store.
///
/// Stands in for a provider account shared by several instances: every
/// facade handed the same store sees the same records. Failures can be
/// injected per resource ID to exercise partial-cleanup paths.
#[derive(Debug, Default)]
pub struct InMemoryResourceStore {
    state: RwLock<StoreState>,
}

impl InMemoryResourceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every delete of the resource with `id` fail with `message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_deletes_of(&self, id: impl Into<String>, message: impl Into<String>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.delete_failures.insert(id.into(), message.into());
        Ok(())
    }

    /// Makes every listing fail with `message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_listing(&self, message: impl Into<String>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.list_failure = Some(message.into());
        Ok(())
    }

    /// Removes all injected failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clear_failures(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.delete_failures.clear();
        state.list_failure = None;
        Ok(())
    }

    /// Returns true if `descriptor` has not been deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn contains(&self, descriptor: &ResourceDescriptor) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.live.contains(descriptor))
    }

    /// Returns the number of resources not yet deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn live_count(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.live.len())
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn register(&self, record: ResourceRecord) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.live.extend(record.descriptors.iter().cloned());
        state.records.insert(record.owner, record);
        Ok(())
    }

    async fn list_owned_resources(&self) -> Result<Vec<ResourceRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        if let Some(message) = &state.list_failure {
            return Err(Error::transport(message.clone()));
        }
        Ok(state
            .records
            .values()
            .filter(|record| record.descriptors.iter().any(|d| state.live.contains(d)))
            .cloned()
            .collect())
    }

    async fn delete_resource(&self, descriptor: &ResourceDescriptor) -> Result<DeleteOutcome> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(message) = state.delete_failures.get(&descriptor.id) {
            return Err(Error::transport(message.clone()));
        }
        if state.live.remove(descriptor) {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::AlreadyAbsent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ResourceRecord {
        ResourceRecord::new(
            InstanceId::generate(),
            vec![
                ResourceDescriptor::new(ResourceKind::Queue, "requests"),
                ResourceDescriptor::new(ResourceKind::Function, "fn"),
            ],
        )
    }

    #[tokio::test]
    async fn deletes_are_idempotent() {
        let store = InMemoryResourceStore::new();
        let record = record();
        store.register(record.clone()).await.unwrap();

        let queue = &record.descriptors[0];
        assert_eq!(store.delete_resource(queue).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(
            store.delete_resource(queue).await.unwrap(),
            DeleteOutcome::AlreadyAbsent
        );
    }

    #[tokio::test]
    async fn record_disappears_when_all_resources_are_gone() {
        let store = InMemoryResourceStore::new();
        let record = record();
        store.register(record.clone()).await.unwrap();

        store.delete_resource(&record.descriptors[0]).await.unwrap();
        assert_eq!(store.list_owned_resources().await.unwrap(), vec![record.clone()]);

        store.delete_resource(&record.descriptors[1]).await.unwrap();
        assert!(store.list_owned_resources().await.unwrap().is_empty());
        assert_eq!(store.live_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let store = InMemoryResourceStore::new();
        let record = record();
        store.register(record.clone()).await.unwrap();
        store.fail_deletes_of("fn", "permission denied").unwrap();
        store.fail_listing("throttled").unwrap();

        assert!(store.delete_resource(&record.descriptors[1]).await.is_err());
        assert!(store.list_owned_resources().await.is_err());

        store.clear_failures().unwrap();
        assert!(store.contains(&record.descriptors[1]).unwrap());
        assert_eq!(store.list_owned_resources().await.unwrap().len(), 1);
    }

    #[test]
    fn descriptor_display() {
        let d = ResourceDescriptor::new(ResourceKind::LogGroup, "/stratus/abc");
        assert_eq!(d.to_string(), "logGroup:/stratus/abc");
        let other = ResourceDescriptor::new(ResourceKind::Other("bucket".into()), "b");
        assert_eq!(other.to_string(), "bucket:b");
    }
}
