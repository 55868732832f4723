//! Remotely invocable proxies over a backend instance.
//!
//! A [`FunctionFacade`] is bound to one backend instance. It hands out
//! proxies for named functions:
//!
//! - [`ResponseFunction`]: returns a [`Response`] envelope and never fails
//! - [`RemoteFunction`]: returns the value or the reconstructed
//!   [`RemoteError`]
//!
//! Every invocation builds a [`Call`], passes through the facade's own
//! [`Funnel`] to throttle client-side fan-out, and is recorded in the
//! instance's [`FunctionLedger`].
//!
//! ## Lifecycle
//!
//! ```text
//! start ──► (gc pass) ──► calls ... ──► stop ──► cleanup
//! ```
//!
//! `stop` and `cleanup` are idempotent. Calls made after `stop` fail with a
//! `StoppedError` without reaching the backend.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::Instrument;

use stratus_core::observability::invocation_span;
use stratus_core::{Error, InstanceId, Result};

use crate::config::{CleanupOptions, FacadeOptions, GcMode};
use crate::envelope::{now_ms, Call, RemoteError, Response, Return};
use crate::funnel::Funnel;
use crate::gc::{GarbageCollector, GcResult, ReclaimWorker, ResourceStore};
use crate::ledger::{FunctionLedger, FunctionMetrics};
use crate::module::FunctionModule;
use crate::provider::{self, Provider, ProviderKind};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One function's metrics at a reporting tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsEvent {
    /// Reporting instance.
    pub instance: InstanceId,
    /// Function name.
    pub function: String,
    /// Metrics accumulated so far.
    pub metrics: FunctionMetrics,
}

/// Receives periodic stats.
pub trait StatsSink: Send + Sync {
    /// Called once per function per tick.
    fn report(&self, event: StatsEvent);
}

/// Sink that logs each event at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn report(&self, event: StatsEvent) {
        let m = &event.metrics;
        tracing::info!(
            instance = %event.instance,
            function = %event.function,
            invocations = m.invocations,
            completed = m.completed,
            errors = m.errors,
            start_latency = %m.start_latency,
            execution_latency = %m.execution_latency,
            return_latency = %m.return_latency,
            "function stats"
        );
    }
}

struct Inner {
    provider: Arc<dyn Provider>,
    ledger: FunctionLedger,
    funnel: Funnel,
    stopped: AtomicBool,
    cleaned_up: AtomicBool,
    gc_task: Mutex<Option<JoinHandle<GcResult>>>,
    gc_result: Mutex<Option<GcResult>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    async fn invoke(&self, name: &str, args: Vec<Value>) -> Response {
        let call = Call::new(name, args);
        let span = invocation_span(
            &call.name,
            &call.call_id.to_string(),
            &self.provider.instance_id().to_string(),
        );
        self.invoke_call(call).instrument(span).await
    }

    async fn invoke_call(&self, call: Call) -> Response {
        self.ledger.record_invocation(&call.name);

        let ret = if self.stopped.load(Ordering::Acquire) {
            let now = now_ms();
            Return::transport_failure(call.call_id, &Error::Stopped, now, now)
        } else {
            self.dispatch(&call).await
        };

        let response = Response::from_return(&call, ret, now_ms());
        self.ledger.record_completion(&call.name, &response);
        crate::metrics::record_call(&call.name, &response);
        if let Some(error) = &response.error {
            tracing::debug!(error = %error, "call completed with error");
        }
        response
    }

    /// Sends `call` through the throttling funnel. Backend failures become
    /// error returns bounded by the attempt's timestamps.
    async fn dispatch(&self, call: &Call) -> Return {
        let provider = Arc::clone(&self.provider);
        let outbound = call.clone();
        let attempt_start = now_ms();

        let error = match self
            .funnel
            .push(move || async move { provider.call_function(outbound).await })
            .await
        {
            Ok(Ok(ret)) if ret.call_id == call.call_id => return ret,
            Ok(Ok(ret)) => Error::internal(format!(
                "backend returned call ID {} for call {}",
                ret.call_id, call.call_id
            )),
            Ok(Err(e)) => e,
            Err(e) => Error::from(e),
        };
        tracing::warn!(error = %error, "dispatch failed before a return was obtained");
        Return::transport_failure(call.call_id, &error, attempt_start, now_ms())
    }

    fn stop_reporting(&self) {
        if let Some(handle) = lock(&self.reporter).take() {
            handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_reporting();
    }
}

/// Configures how a [`FunctionFacade`] starts.
pub struct FacadeBuilder {
    options: FacadeOptions,
    worker: Option<Arc<dyn ReclaimWorker>>,
}

impl fmt::Debug for FacadeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacadeBuilder")
            .field("options", &self.options)
            .field("custom_worker", &self.worker.is_some())
            .finish()
    }
}

impl FacadeBuilder {
    /// Creates a builder with the given options.
    #[must_use]
    pub fn new(options: FacadeOptions) -> Self {
        Self {
            options,
            worker: None,
        }
    }

    /// Replaces the worker used to reclaim orphaned resources.
    #[must_use]
    pub fn reclaim_worker(mut self, worker: Arc<dyn ReclaimWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Creates a backend of `kind` for `module` and binds a facade to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or the backend fails to
    /// initialize.
    pub async fn start(
        self,
        module: FunctionModule,
        kind: ProviderKind,
        store: Arc<dyn ResourceStore>,
    ) -> Result<FunctionFacade> {
        let provider = provider::create(kind, module, &self.options, store).await?;
        self.build(provider).await
    }

    /// Binds a facade to an already initialized backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub async fn build(self, provider: Arc<dyn Provider>) -> Result<FunctionFacade> {
        self.options.validate()?;
        let Self { options, worker } = self;

        let instance = provider.instance_id();
        let inner = Arc::new(Inner {
            funnel: Funnel::named(format!("facade-{instance}"), options.concurrency),
            provider,
            ledger: FunctionLedger::new(),
            stopped: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            gc_task: Mutex::new(None),
            gc_result: Mutex::new(None),
            reporter: Mutex::new(None),
        });
        let facade = FunctionFacade { inner };

        if let Some(collector) = facade.collector(&options, worker) {
            match options.gc {
                GcMode::Force => {
                    let result = collector.collect().await;
                    *lock(&facade.inner.gc_result) = Some(result);
                }
                GcMode::Auto => {
                    let handle = tokio::spawn(async move { collector.collect().await });
                    *lock(&facade.inner.gc_task) = Some(handle);
                }
                GcMode::Off => {}
            }
        }

        if let Some(interval) = options.stats_interval {
            facade.start_stats_reporting(interval, Arc::new(LogStatsSink))?;
        }

        tracing::info!(
            instance = %instance,
            provider = %facade.inner.provider.kind(),
            concurrency = options.concurrency,
            gc = ?options.gc,
            "function facade started"
        );
        Ok(facade)
    }
}

/// Facade bound to one backend instance.
///
/// Cloning yields another handle to the same instance.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use serde_json::{json, Value};
/// use stratus_invoke::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> stratus_core::Result<()> {
/// let module = FunctionModule::new().function("hello", |args: Vec<Value>| async move {
///     let name = args.first().and_then(Value::as_str).unwrap_or("world").to_string();
///     Ok(json!(format!("hello {name}")))
/// });
///
/// let store = Arc::new(InMemoryResourceStore::new());
/// let facade =
///     FunctionFacade::start(module, ProviderKind::Local, FacadeOptions::default(), store).await?;
///
/// let hello = facade.call("hello");
/// assert_eq!(hello.call(vec![json!("stratus")]).await.unwrap(), json!("hello stratus"));
///
/// facade.cleanup(CleanupOptions::default()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FunctionFacade {
    inner: Arc<Inner>,
}

impl fmt::Debug for FunctionFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionFacade")
            .field("provider", &self.inner.provider)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl FunctionFacade {
    /// Creates a backend of `kind` for `module` and binds a facade to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or the backend fails to
    /// initialize.
    pub async fn start(
        module: FunctionModule,
        kind: ProviderKind,
        options: FacadeOptions,
        store: Arc<dyn ResourceStore>,
    ) -> Result<Self> {
        FacadeBuilder::new(options).start(module, kind, store).await
    }

    /// Binds a facade to an already initialized backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub async fn with_provider(provider: Arc<dyn Provider>, options: FacadeOptions) -> Result<Self> {
        FacadeBuilder::new(options).build(provider).await
    }

    /// Returns a builder for customizing startup.
    #[must_use]
    pub fn builder(options: FacadeOptions) -> FacadeBuilder {
        FacadeBuilder::new(options)
    }

    fn collector(
        &self,
        options: &FacadeOptions,
        worker: Option<Arc<dyn ReclaimWorker>>,
    ) -> Option<GarbageCollector> {
        if options.gc == GcMode::Off {
            return None;
        }
        let Some(store) = self.inner.provider.resource_store() else {
            tracing::debug!("backend owns no resources; skipping garbage collection");
            return None;
        };
        let collector =
            GarbageCollector::new(store, self.instance_id(), options.retention());
        Some(match worker {
            Some(worker) => collector.with_worker(worker),
            None => collector,
        })
    }

    /// Returns the bound backend instance's ID.
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.inner.provider.instance_id()
    }

    /// Returns the backend tag.
    #[must_use]
    pub fn provider_kind(&self) -> ProviderKind {
        self.inner.provider.kind()
    }

    /// Returns a proxy yielding full [`Response`] envelopes.
    #[must_use]
    pub fn call_with_response(&self, name: impl Into<String>) -> ResponseFunction {
        ResponseFunction {
            inner: Arc::clone(&self.inner),
            name: name.into(),
        }
    }

    /// Returns a proxy yielding values and raising remote errors.
    #[must_use]
    pub fn call(&self, name: impl Into<String>) -> RemoteFunction {
        RemoteFunction {
            inner: Arc::clone(&self.inner),
            name: name.into(),
        }
    }

    /// Wraps every function export of `module`. Constants are omitted.
    #[must_use]
    pub fn wrap_all(&self, module: &FunctionModule) -> BTreeMap<String, RemoteFunction> {
        module
            .function_names()
            .map(|name| (name.to_string(), self.call(name)))
            .collect()
    }

    /// Wraps every function export of `module` with envelope-returning
    /// proxies. Constants are omitted.
    #[must_use]
    pub fn wrap_all_with_response(
        &self,
        module: &FunctionModule,
    ) -> BTreeMap<String, ResponseFunction> {
        module
            .function_names()
            .map(|name| (name.to_string(), self.call_with_response(name)))
            .collect()
    }

    /// Returns a snapshot of every function's metrics.
    #[must_use]
    pub fn stats(&self) -> BTreeMap<String, FunctionMetrics> {
        self.inner.ledger.snapshot()
    }

    /// Returns counters summed across every function.
    #[must_use]
    pub fn totals(&self) -> FunctionMetrics {
        self.inner.ledger.totals()
    }

    /// Returns the metrics of one function.
    #[must_use]
    pub fn function_stats(&self, name: &str) -> Option<FunctionMetrics> {
        self.inner.ledger.get(name)
    }

    /// Sets the concurrency cap of the facade and its backend; 0 means
    /// unbounded.
    pub fn set_concurrency(&self, max_concurrency: usize) {
        self.inner.funnel.set_max_concurrency(max_concurrency);
        self.inner.provider.set_concurrency(max_concurrency);
    }

    /// Returns an opaque description of the backend's resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot describe its resources.
    pub fn resource_list(&self) -> Result<String> {
        self.inner.provider.resource_list()
    }

    /// Returns true once [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Starts periodic stats reporting to `sink`, replacing any previous
    /// schedule.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `interval` is zero.
    pub fn start_stats_reporting(&self, interval: Duration, sink: Arc<dyn StatsSink>) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::configuration("stats interval must be greater than zero"));
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let instance = self.instance_id();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                for (function, metrics) in inner.ledger.snapshot() {
                    sink.report(StatsEvent {
                        instance,
                        function,
                        metrics,
                    });
                }
            }
        });
        if let Some(previous) = lock(&self.inner.reporter).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stops periodic stats reporting. No-op when not reporting.
    pub fn stop_stats_reporting(&self) {
        self.inner.stop_reporting();
    }

    /// Waits for a background garbage collection pass, if one is running,
    /// and returns the most recent pass's result.
    pub async fn wait_for_gc(&self) -> Option<GcResult> {
        let task = lock(&self.inner.gc_task).take();
        if let Some(task) = task {
            match task.await {
                Ok(result) => *lock(&self.inner.gc_result) = Some(result),
                Err(e) => tracing::warn!(error = %e, "garbage collection task failed"),
            }
        }
        lock(&self.inner.gc_result).clone()
    }

    /// Stops accepting calls. Queued calls are cancelled and the backend
    /// waits for in-flight local work. Resources are left in place.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop_reporting();
        let cancelled = self.inner.funnel.clear_pending();
        self.inner.provider.stop().await;
        tracing::info!(instance = %self.instance_id(), cancelled, "function facade stopped");
    }

    /// Stops, waits for any background garbage collection, then releases
    /// backend resources according to `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend's cleanup fails outright; individual
    /// resource deletion failures are logged instead.
    pub async fn cleanup(&self, options: CleanupOptions) -> Result<()> {
        if self.inner.cleaned_up.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop().await;
        self.wait_for_gc().await;
        if let Err(e) = self.inner.provider.cleanup(options).await {
            // Let a later cleanup retry the backend.
            self.inner.cleaned_up.store(false, Ordering::Release);
            return Err(e);
        }
        tracing::info!(
            instance = %self.instance_id(),
            delete_resources = options.delete_resources,
            "function facade cleaned up"
        );
        Ok(())
    }
}

/// Proxy returning full [`Response`] envelopes.
#[derive(Clone)]
pub struct ResponseFunction {
    inner: Arc<Inner>,
    name: String,
}

impl fmt::Debug for ResponseFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ResponseFunction {
    /// Returns the wrapped function's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the function. Never fails: errors are carried in the
    /// response.
    pub async fn call(&self, args: Vec<Value>) -> Response {
        self.inner.invoke(&self.name, args).await
    }
}

/// Proxy with a conventional value-or-error contract.
#[derive(Clone)]
pub struct RemoteFunction {
    inner: Arc<Inner>,
    name: String,
}

impl fmt::Debug for RemoteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RemoteFunction {
    /// Returns the wrapped function's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the function.
    ///
    /// # Errors
    ///
    /// Returns the remote error, or a synthesized one for transport
    /// failures, with name, message and stack preserved.
    pub async fn call(&self, args: Vec<Value>) -> std::result::Result<Value, RemoteError> {
        self.inner.invoke(&self.name, args).await.into_result()
    }

    /// Invokes the function and decodes its value as `R`.
    ///
    /// # Errors
    ///
    /// Returns the remote error, or a `SerializationError` if the value does
    /// not decode as `R`.
    pub async fn call_as<R: DeserializeOwned>(
        &self,
        args: Vec<Value>,
    ) -> std::result::Result<R, RemoteError> {
        let value = self.call(args).await?;
        serde_json::from_value(value).map_err(|e| RemoteError::from(Error::from(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::InMemoryResourceStore;
    use serde_json::json;

    fn module() -> FunctionModule {
        FunctionModule::new()
            .function("inc", |args: Vec<Value>| async move {
                Ok(json!(args.first().and_then(Value::as_i64).unwrap_or_default() + 1))
            })
            .function("fail", |_| async {
                Err(RemoteError::new("ValidationError", "bad input"))
            })
    }

    async fn facade() -> FunctionFacade {
        let store = Arc::new(InMemoryResourceStore::new());
        FunctionFacade::start(
            module(),
            ProviderKind::Local,
            FacadeOptions::default().with_gc(GcMode::Off),
            store,
        )
        .await
        .unwrap()
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<StatsEvent>>);

    impl StatsSink for CollectingSink {
        fn report(&self, event: StatsEvent) {
            lock(&self.0).push(event);
        }
    }

    #[tokio::test]
    async fn response_function_carries_latencies() {
        let facade = facade().await;
        let response = facade.call_with_response("inc").call(vec![json!(41)]).await;

        assert_eq!(response.value, Some(json!(42)));
        assert!(response.error.is_none());
        assert!(response.execution_latency.is_some_and(|ms| ms >= 0));
    }

    #[tokio::test]
    async fn call_as_decodes_typed_values() {
        let facade = facade().await;
        let n: i64 = facade.call("inc").call_as(vec![json!(1)]).await.unwrap();
        assert_eq!(n, 2);

        let err = facade
            .call("inc")
            .call_as::<String>(vec![json!(1)])
            .await
            .unwrap_err();
        assert_eq!(err.name, "SerializationError");
    }

    #[tokio::test]
    async fn unknown_function_is_an_error_response() {
        let facade = facade().await;
        let response = facade.call_with_response("missing").call(vec![]).await;
        assert_eq!(response.error.unwrap().name, "NotFoundError");
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reporting_is_owned_by_the_instance() {
        let facade = facade().await;
        facade.call("inc").call(vec![json!(0)]).await.unwrap();

        let sink = Arc::new(CollectingSink::default());
        facade
            .start_stats_reporting(Duration::from_secs(1), sink.clone())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let reported = lock(&sink.0).len();
        assert_eq!(reported, 2);
        assert_eq!(lock(&sink.0)[0].function, "inc");

        facade.stop_stats_reporting();
        facade.stop_stats_reporting();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(lock(&sink.0).len(), reported);
    }

    #[tokio::test]
    async fn zero_stats_interval_is_rejected() {
        let facade = facade().await;
        assert!(facade
            .start_stats_reporting(Duration::ZERO, Arc::new(LogStatsSink))
            .is_err());
    }

    /// Backend whose first cleanup fails.
    #[derive(Debug, Default)]
    struct FlakyCleanup {
        attempts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Provider for FlakyCleanup {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Http
        }

        fn instance_id(&self) -> InstanceId {
            InstanceId::generate()
        }

        async fn call_function(&self, call: Call) -> Result<Return> {
            Ok(Return::value(call.call_id, Value::Null))
        }

        fn set_concurrency(&self, _max_concurrency: usize) {}

        async fn stop(&self) {}

        async fn cleanup(&self, _options: CleanupOptions) -> Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::transport("endpoint unavailable"))
            } else {
                Ok(())
            }
        }

        fn resource_list(&self) -> Result<String> {
            Ok("{}".to_string())
        }
    }

    #[tokio::test]
    async fn failed_cleanup_can_be_retried() {
        let provider = Arc::new(FlakyCleanup::default());
        let facade = FunctionFacade::with_provider(provider.clone(), FacadeOptions::default())
            .await
            .unwrap();

        assert!(facade.cleanup(CleanupOptions::default()).await.is_err());
        facade.cleanup(CleanupOptions::default()).await.unwrap();
        facade.cleanup(CleanupOptions::default()).await.unwrap();
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn funnel_gauges_are_labelled_per_instance() {
        let a = facade().await;
        let b = facade().await;
        let name_a = a.inner.funnel.name().unwrap().to_string();
        assert_eq!(name_a, format!("facade-{}", a.instance_id()));
        assert_ne!(Some(name_a.as_str()), b.inner.funnel.name());
    }

    #[tokio::test]
    async fn totals_sum_every_function() {
        let facade = facade().await;
        facade.call("inc").call(vec![json!(1)]).await.unwrap();
        facade.call("inc").call(vec![json!(2)]).await.unwrap();
        facade.call("fail").call(vec![]).await.unwrap_err();

        let totals = facade.totals();
        assert_eq!(totals.invocations, 3);
        assert_eq!(totals.completed, 3);
        assert_eq!(totals.errors, 1);
    }

    #[tokio::test]
    async fn stop_and_cleanup_are_idempotent() {
        let facade = facade().await;
        facade.stop().await;
        facade.stop().await;
        facade.cleanup(CleanupOptions::default()).await.unwrap();
        facade.cleanup(CleanupOptions::default()).await.unwrap();
        assert!(facade.is_stopped());
    }
}
