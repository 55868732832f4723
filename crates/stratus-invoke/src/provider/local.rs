//! In-process backend with a bounded worker pool.
//!
//! Calls execute on tokio tasks admitted through a [`Funnel`], so the pool
//! size is exactly the funnel's concurrency cap. Transport is direct: the
//! call operation itself yields the return.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use stratus_core::{Error, InstanceId, Result};

use super::{Provider, ProviderKind};
use crate::config::CleanupOptions;
use crate::envelope::{Call, Return};
use crate::funnel::Funnel;
use crate::module::FunctionModule;

/// Local worker-pool backend.
#[derive(Debug)]
pub struct LocalProvider {
    instance_id: InstanceId,
    module: Arc<FunctionModule>,
    pool: Funnel,
    stopped: AtomicBool,
}

impl LocalProvider {
    /// Creates a backend running at most `max_concurrency` calls at once;
    /// 0 means unbounded.
    #[must_use]
    pub fn new(module: FunctionModule, max_concurrency: usize) -> Self {
        let instance_id = InstanceId::generate();
        Self {
            instance_id,
            module: Arc::new(module),
            pool: Funnel::named(format!("local-{instance_id}"), max_concurrency),
            stopped: AtomicBool::new(false),
        }
    }

    /// Returns the number of calls currently executing.
    #[must_use]
    pub fn running(&self) -> usize {
        self.pool.running()
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    async fn call_function(&self, call: Call) -> Result<Return> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let module = Arc::clone(&self.module);
        self.pool
            .push(move || async move { module.execute(&call).await })
            .await
            .map_err(Error::from)
    }

    fn set_concurrency(&self, max_concurrency: usize) {
        self.pool.set_max_concurrency(max_concurrency);
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.pool.clear_pending();
        self.pool.idle().await;
        tracing::debug!(instance = %self.instance_id, cancelled, "stopped local provider");
    }

    async fn cleanup(&self, _options: CleanupOptions) -> Result<()> {
        self.stop().await;
        Ok(())
    }

    fn resource_list(&self) -> Result<String> {
        Ok(serde_json::json!({
            "provider": ProviderKind::Local,
            "instanceId": self.instance_id,
        })
        .to_string())
    }
}
