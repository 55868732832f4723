//! Backend capability interface.
//!
//! This module provides:
//!
//! - [`Provider`]: The capability set every backend implements
//! - [`ProviderKind`]: The backend tag a facade is started with
//! - [`create`]: Factory selecting a backend by tag
//!
//! Built-in backends:
//!
//! | Kind | Transport | Module |
//! |------|-----------|--------|
//! | `local` | direct, in-process worker pool | [`local`] |
//! | `queue` | queue-relayed with call ID correlation | [`queue`] |
//! | `http` | direct HTTP request/response | [`http`] |

pub mod http;
pub mod local;
pub mod queue;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stratus_core::{Error, InstanceId, Result};

use crate::config::{CleanupOptions, FacadeOptions, TransportMode};
use crate::envelope::{Call, Return};
use crate::gc::ResourceStore;
use crate::module::FunctionModule;

/// Backend tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process worker pool.
    Local,
    /// Queue-relayed workers.
    Queue,
    /// Remote HTTP endpoint.
    Http,
}

impl ProviderKind {
    /// Returns the tag as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Queue => "queue",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "queue" => Ok(Self::Queue),
            "http" => Ok(Self::Http),
            other => Err(Error::configuration(format!("unknown provider '{other}'"))),
        }
    }
}

/// Capability set a backend exposes to the facade.
///
/// One value is bound to exactly one backend instance.
///
/// ## Thread Safety
///
/// All methods take `&self`; a facade shares its provider across every
/// in-flight call.
#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    /// Returns the backend tag.
    fn kind(&self) -> ProviderKind;

    /// Returns the ID of the bound backend instance.
    fn instance_id(&self) -> InstanceId;

    /// Sends `call` and yields its return.
    ///
    /// An `Err` means no return was obtained at all; the facade turns it
    /// into an error return. Errors raised by the function itself arrive as
    /// `Ok` error returns.
    async fn call_function(&self, call: Call) -> Result<Return>;

    /// Sets the backend's concurrency limit; 0 means unbounded.
    fn set_concurrency(&self, max_concurrency: usize);

    /// Stops accepting calls and waits for in-flight local work to exit.
    async fn stop(&self);

    /// Stops, then releases backend resources. With
    /// [`CleanupOptions::retain_resources`] the resources are left for a
    /// later garbage collection pass.
    async fn cleanup(&self, options: CleanupOptions) -> Result<()>;

    /// Returns an opaque description of the instance's resources.
    fn resource_list(&self) -> Result<String>;

    /// Returns the discovery and deletion surface used by the garbage
    /// collector, if the backend owns any resources.
    fn resource_store(&self) -> Option<Arc<dyn ResourceStore>> {
        None
    }
}

/// Creates and initializes a backend.
///
/// `mode` picks the transport: `auto` uses the backend's native one, and
/// `queue` on the local backend relays calls over in-memory queues. `store`
/// is where queue-relayed backends register their resources.
///
/// # Errors
///
/// Returns a configuration error for an unsupported kind/mode pairing or
/// invalid options, and any error raised while initializing the backend.
pub async fn create(
    kind: ProviderKind,
    module: FunctionModule,
    options: &FacadeOptions,
    store: Arc<dyn ResourceStore>,
) -> Result<Arc<dyn Provider>> {
    options.validate()?;
    let provider: Arc<dyn Provider> = match (kind, options.mode) {
        (ProviderKind::Local, TransportMode::Auto | TransportMode::Direct) => {
            Arc::new(local::LocalProvider::new(module, options.concurrency))
        }
        (ProviderKind::Local | ProviderKind::Queue, TransportMode::Queue)
        | (ProviderKind::Queue, TransportMode::Auto) => Arc::new(
            queue::QueueProvider::initialize(
                module,
                store,
                queue::QueueOptions::from_facade(options),
            )
            .await?,
        ),
        (ProviderKind::Http, TransportMode::Auto | TransportMode::Direct) => {
            let config = options.http.clone().ok_or_else(|| {
                Error::configuration("the http provider requires an http configuration")
            })?;
            Arc::new(http::HttpProvider::new(config)?)
        }
        (kind, mode) => {
            return Err(Error::configuration(format!(
                "provider '{kind}' does not support {mode:?} transport"
            )));
        }
    };
    tracing::info!(
        provider = %provider.kind(),
        instance = %provider.instance_id(),
        "initialized provider"
    );
    Ok(provider)
}
