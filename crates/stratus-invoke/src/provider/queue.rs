//! Queue-relayed backend.
//!
//! Calls are published to a per-instance request queue. Worker tasks consume
//! them, execute the function and publish returns to a response queue
//! shared by every call of the instance. A pump task reads that queue and
//! settles each return through the [`Correlator`], so returns may arrive in
//! any order.
//!
//! ```text
//! call_function ──► request queue ──► workers ──► response queue ──► pump
//!       ▲                                                              │
//!       └─────────────────── Correlator (by call ID) ◄─────────────────┘
//! ```
//!
//! The queues and the function are registered as a [`ResourceRecord`] in
//! the shared [`ResourceStore`] once setup completes. Cleanup deletes them
//! unless resources are retained, in which case a later garbage collection
//! pass reclaims them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use stratus_core::{Error, InstanceId, Result};

use super::{Provider, ProviderKind};
use crate::config::{CleanupOptions, FacadeOptions};
use crate::correlator::Correlator;
use crate::envelope::{Call, Return};
use crate::funnel::Funnel;
use crate::gc::{delete_descriptors, ResourceDescriptor, ResourceKind, ResourceRecord, ResourceStore};
use crate::module::FunctionModule;

/// A message channel between the caller and the workers.
///
/// Messages are wire-format JSON values.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Returns the queue's name.
    fn name(&self) -> &str;

    /// Appends a message.
    async fn publish(&self, message: Value) -> Result<()>;

    /// Waits for the next message. Returns `None` once the queue is closed
    /// and drained.
    async fn receive(&self) -> Option<Value>;

    /// Closes the queue; later publishes fail.
    fn close(&self);
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Value>,
    closed: bool,
}

/// In-memory message queue.
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    state: Mutex<QueueState>,
    available: Notify,
}

impl InMemoryQueue {
    /// Creates an open, empty queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of undelivered messages.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.lock().messages.len()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: Value) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::transport(format!("queue '{}' is closed", self.name)));
            }
            state.messages.push_back(message);
        }
        self.available.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Option<Value> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(message) = state.messages.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }
}

/// Settings for a [`QueueProvider`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Worker concurrency; 0 means unbounded.
    pub concurrency: usize,
    /// How long a call waits for its return.
    pub call_timeout: Option<Duration>,
}

impl QueueOptions {
    /// Extracts the queue settings from facade options.
    #[must_use]
    pub const fn from_facade(options: &FacadeOptions) -> Self {
        Self {
            concurrency: options.concurrency,
            call_timeout: options.call_timeout,
        }
    }
}

#[derive(Debug, Default)]
struct Tasks {
    dispatcher: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

/// Queue-relayed backend.
pub struct QueueProvider {
    instance_id: InstanceId,
    requests: Arc<dyn MessageQueue>,
    responses: Arc<dyn MessageQueue>,
    correlator: Correlator,
    workers: Funnel,
    store: Arc<dyn ResourceStore>,
    record: ResourceRecord,
    call_timeout: Option<Duration>,
    stopped: AtomicBool,
    tasks: Mutex<Tasks>,
}

impl std::fmt::Debug for QueueProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProvider")
            .field("instance_id", &self.instance_id)
            .field("requests", &self.requests.name())
            .field("responses", &self.responses.name())
            .field("outstanding", &self.correlator.outstanding())
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl QueueProvider {
    /// Creates the queues, starts the workers and registers the instance's
    /// resources in `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if registering the resources fails; nothing is left
    /// running in that case.
    pub async fn initialize(
        module: FunctionModule,
        store: Arc<dyn ResourceStore>,
        options: QueueOptions,
    ) -> Result<Self> {
        let instance_id = InstanceId::generate();
        let requests: Arc<dyn MessageQueue> =
            Arc::new(InMemoryQueue::new(format!("stratus-{instance_id}-requests")));
        let responses: Arc<dyn MessageQueue> =
            Arc::new(InMemoryQueue::new(format!("stratus-{instance_id}-responses")));
        let record = ResourceRecord::new(
            instance_id,
            vec![
                ResourceDescriptor::new(ResourceKind::Function, format!("stratus-{instance_id}")),
                ResourceDescriptor::new(ResourceKind::Queue, requests.name()),
                ResourceDescriptor::new(ResourceKind::Queue, responses.name()),
            ],
        );
        store.register(record.clone()).await?;

        let correlator = Correlator::new();
        let workers = Funnel::named(format!("queue-workers-{instance_id}"), options.concurrency);
        let tasks = Tasks {
            dispatcher: Some(tokio::spawn(dispatch_requests(
                Arc::new(module),
                Arc::clone(&requests),
                Arc::clone(&responses),
                workers.clone(),
            ))),
            pump: Some(tokio::spawn(pump_responses(
                Arc::clone(&responses),
                correlator.clone(),
            ))),
        };

        tracing::debug!(instance = %instance_id, "queue provider initialized");
        Ok(Self {
            instance_id,
            requests,
            responses,
            correlator,
            workers,
            store,
            record,
            call_timeout: options.call_timeout,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        })
    }

    /// Returns the resources this instance registered.
    #[must_use]
    pub const fn record(&self) -> &ResourceRecord {
        &self.record
    }

    /// Returns the number of calls awaiting a return.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.correlator.outstanding()
    }

    fn take_tasks(&self) -> Tasks {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for QueueProvider {
    // Relay tasks hold the queues and the module until they exit.
    fn drop(&mut self) {
        let tasks = self.take_tasks();
        if tasks.dispatcher.is_none() && tasks.pump.is_none() {
            return;
        }
        self.requests.close();
        self.responses.close();
        for task in [tasks.dispatcher, tasks.pump].into_iter().flatten() {
            task.abort();
        }
        let cancelled = self.workers.clear_pending();
        tracing::debug!(
            instance = %self.instance_id,
            cancelled,
            "dropped queue provider without stopping it"
        );
    }
}

/// Consumes the request queue, running each call on the worker funnel.
async fn dispatch_requests(
    module: Arc<FunctionModule>,
    requests: Arc<dyn MessageQueue>,
    responses: Arc<dyn MessageQueue>,
    workers: Funnel,
) {
    while let Some(message) = requests.receive().await {
        let call: Call = match serde_json::from_value(message) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(queue = requests.name(), error = %e, "dropping malformed call");
                continue;
            }
        };
        let module = Arc::clone(&module);
        let responses = Arc::clone(&responses);
        drop(workers.push(move || async move {
            let ret = module.execute(&call).await;
            let published = match serde_json::to_value(&ret) {
                Ok(message) => responses.publish(message).await,
                Err(e) => Err(Error::from(e)),
            };
            if let Err(e) = published {
                tracing::warn!(call_id = %call.call_id, error = %e, "failed to publish return");
            }
        }));
    }
}

/// Settles every return on the response queue.
async fn pump_responses(responses: Arc<dyn MessageQueue>, correlator: Correlator) {
    while let Some(message) = responses.receive().await {
        match serde_json::from_value::<Return>(message.clone()) {
            Ok(ret) => {
                correlator.settle(ret.with_raw(message));
            }
            Err(e) => {
                tracing::warn!(queue = responses.name(), error = %e, "dropping malformed return");
            }
        }
    }
}

#[async_trait]
impl Provider for QueueProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Queue
    }

    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    async fn call_function(&self, call: Call) -> Result<Return> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let call_id = call.call_id;
        let message = serde_json::to_value(&call)?;
        // Registered before publishing so a fast return finds its entry.
        let pending = self.correlator.register(call_id);
        if let Err(e) = self.requests.publish(message).await {
            self.correlator.forget(call_id);
            return Err(e);
        }
        Ok(pending.wait(self.call_timeout).await)
    }

    fn set_concurrency(&self, max_concurrency: usize) {
        self.workers.set_max_concurrency(max_concurrency);
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = self.take_tasks();

        self.requests.close();
        if let Some(dispatcher) = tasks.dispatcher {
            dispatcher.abort();
            let _ = dispatcher.await;
        }
        let cancelled = self.workers.clear_pending();
        self.workers.idle().await;

        // Running work has published its returns; drain them before closing.
        self.responses.close();
        if let Some(pump) = tasks.pump {
            let _ = pump.await;
        }
        let failed = self.correlator.fail_all(&Error::Stopped);
        tracing::debug!(
            instance = %self.instance_id,
            cancelled,
            failed,
            "stopped queue provider"
        );
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<()> {
        self.stop().await;
        if options.delete_resources {
            let outcome = delete_descriptors(self.store.as_ref(), &self.record.descriptors).await;
            tracing::info!(
                instance = %self.instance_id,
                deleted = outcome.deleted,
                already_absent = outcome.already_absent,
                errors = outcome.errors.len(),
                "deleted instance resources"
            );
        } else {
            tracing::info!(
                instance = %self.instance_id,
                resources = self.record.descriptors.len(),
                "retaining instance resources for later collection"
            );
        }
        Ok(())
    }

    fn resource_list(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.record)?)
    }

    fn resource_store(&self) -> Option<Arc<dyn ResourceStore>> {
        Some(Arc::clone(&self.store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Outcome, RemoteError};
    use crate::gc::InMemoryResourceStore;
    use serde_json::json;

    fn module() -> FunctionModule {
        FunctionModule::new()
            .function("square", |args: Vec<Value>| async move {
                let n = args.first().and_then(Value::as_i64).unwrap_or_default();
                Ok(json!(n * n))
            })
            .function("reject", |_| async {
                Err(RemoteError::new("ValidationError", "bad input").with_stack("at reject"))
            })
            .function("hang", |_| std::future::pending())
    }

    async fn provider(store: Arc<InMemoryResourceStore>, options: QueueOptions) -> QueueProvider {
        QueueProvider::initialize(module(), store, options).await.unwrap()
    }

    #[tokio::test]
    async fn in_memory_queue_delivers_in_order_then_closes() {
        let queue = InMemoryQueue::new("q");
        queue.publish(json!(1)).await.unwrap();
        queue.publish(json!(2)).await.unwrap();
        queue.close();

        assert_eq!(queue.receive().await, Some(json!(1)));
        assert_eq!(queue.receive().await, Some(json!(2)));
        assert_eq!(queue.receive().await, None);
        assert!(queue.publish(json!(3)).await.is_err());
    }

    #[tokio::test]
    async fn relays_calls_and_correlates_returns() {
        let store = Arc::new(InMemoryResourceStore::new());
        let provider = Arc::new(provider(store, QueueOptions::default()).await);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let provider = Arc::clone(&provider);
                tokio::spawn(async move {
                    let call = Call::new("square", vec![json!(i)]);
                    (i, provider.call_function(call).await.unwrap())
                })
            })
            .collect();

        for handle in handles {
            let (i, ret) = handle.await.unwrap();
            assert_eq!(ret.outcome, Outcome::Value(json!(i * i)));
            assert!(ret.raw.is_some());
        }
        assert_eq!(provider.outstanding(), 0);
        provider.cleanup(CleanupOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn remote_errors_cross_the_queue_intact() {
        let store = Arc::new(InMemoryResourceStore::new());
        let provider = provider(store, QueueOptions::default()).await;

        let ret = provider.call_function(Call::new("reject", vec![])).await.unwrap();
        assert_eq!(
            ret.outcome,
            Outcome::Error(RemoteError::new("ValidationError", "bad input").with_stack("at reject"))
        );
        provider.stop().await;
    }

    #[tokio::test]
    async fn call_timeout_yields_timeout_error() {
        let store = Arc::new(InMemoryResourceStore::new());
        let provider = provider(
            store,
            QueueOptions {
                concurrency: 0,
                call_timeout: Some(Duration::from_millis(20)),
            },
        )
        .await;

        let ret = provider.call_function(Call::new("hang", vec![])).await.unwrap();
        match ret.outcome {
            Outcome::Error(e) => assert_eq!(e.name, "TimeoutError"),
            Outcome::Value(_) => panic!("expected timeout"),
        }
        assert_eq!(provider.outstanding(), 0);
    }

    #[tokio::test]
    async fn cleanup_deletes_or_retains_resources() {
        let store = Arc::new(InMemoryResourceStore::new());

        let deleted = provider(store.clone(), QueueOptions::default()).await;
        deleted.cleanup(CleanupOptions::default()).await.unwrap();
        assert!(!store.contains(&deleted.record().descriptors[0]).unwrap());

        let retained = provider(store.clone(), QueueOptions::default()).await;
        retained.cleanup(CleanupOptions::retain_resources()).await.unwrap();
        let listed = store.list_owned_resources().await.unwrap();
        assert_eq!(listed, vec![retained.record().clone()]);
    }

    #[tokio::test]
    async fn dropping_without_stop_closes_the_relay() {
        let store = Arc::new(InMemoryResourceStore::new());
        let provider = provider(store, QueueOptions::default()).await;
        let requests = Arc::clone(&provider.requests);
        let responses = Arc::clone(&provider.responses);
        provider
            .call_function(Call::new("square", vec![json!(3)]))
            .await
            .unwrap();

        drop(provider);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(requests.publish(json!(1)).await.is_err());
        assert!(responses.publish(json!(1)).await.is_err());
        assert_eq!(Arc::strong_count(&requests), 1);
        assert_eq!(Arc::strong_count(&responses), 1);
    }

    #[tokio::test]
    async fn calls_after_stop_are_rejected() {
        let store = Arc::new(InMemoryResourceStore::new());
        let provider = provider(store, QueueOptions::default()).await;
        provider.stop().await;
        provider.stop().await;
        assert!(matches!(
            provider.call_function(Call::new("square", vec![json!(2)])).await,
            Err(Error::Stopped)
        ));
    }
}
