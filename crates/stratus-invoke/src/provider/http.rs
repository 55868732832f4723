//! HTTP backend.
//!
//! Direct transport: each call is POSTed as a wire-format [`Call`] to a
//! configured endpoint, and the response body is parsed as the wire-format
//! [`Return`]. Non-2xx statuses and network failures are transport
//! failures.
//!
//! ## Usage
//!
//! The client is only compiled when the `http` feature is enabled:
//!
//! ```toml
//! [dependencies]
//! stratus-invoke = { version = "0.1", features = ["http"] }
//! ```
//!
//! Without the feature, [`HttpProvider`] validates its configuration and
//! rejects every call with a configuration error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use stratus_core::{Error, Result};

#[cfg(feature = "http")]
use crate::envelope::Return;

/// Configuration for the HTTP backend.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpProviderConfig {
    /// URL the calls are POSTed to.
    pub endpoint: String,
    /// Bearer token sent with every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    /// Per-request timeout (default: 60 seconds).
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

impl std::fmt::Debug for HttpProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProviderConfig")
            .field("endpoint", &self.endpoint)
            .field(
                "bearer_token",
                &self.bearer_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpProviderConfig {
    /// Creates a config for `endpoint` with no authentication.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer_token: None,
            timeout: default_timeout(),
        }
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the endpoint is not an http(s) URL,
    /// the token is blank or the timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(Error::configuration(format!(
                "endpoint must be an http(s) URL, got '{}'",
                self.endpoint
            )));
        }
        if self
            .bearer_token
            .as_deref()
            .is_some_and(|token| token.trim().is_empty())
        {
            return Err(Error::configuration("bearer token cannot be blank"));
        }
        if self.timeout.is_zero() {
            return Err(Error::configuration("timeout must be greater than zero"));
        }
        Ok(())
    }
}

// ============================================================================
// HTTP Feature-Gated Implementation
// ============================================================================

#[cfg(feature = "http")]
mod http_impl {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;

    use stratus_core::InstanceId;

    use super::{Error, HttpProviderConfig, Result, Return};
    use crate::config::CleanupOptions;
    use crate::envelope::Call;
    use crate::provider::{Provider, ProviderKind};

    /// HTTP backend.
    #[derive(Debug)]
    pub struct HttpProvider {
        instance_id: InstanceId,
        config: HttpProviderConfig,
        client: reqwest::Client,
        stopped: AtomicBool,
    }

    impl HttpProvider {
        /// Creates a backend for the configured endpoint.
        ///
        /// # Errors
        ///
        /// Returns an error if the configuration is invalid or the HTTP
        /// client cannot be built.
        pub fn new(config: HttpProviderConfig) -> Result<Self> {
            config.validate()?;
            let client = reqwest::Client::builder()
                .timeout(config.timeout)
                .build()
                .map_err(|e| Error::transport_with_source("failed to build HTTP client", e))?;
            Ok(Self {
                instance_id: InstanceId::generate(),
                config,
                client,
                stopped: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Provider for HttpProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Http
        }

        fn instance_id(&self) -> InstanceId {
            self.instance_id
        }

        async fn call_function(&self, call: Call) -> Result<Return> {
            if self.stopped.load(Ordering::Acquire) {
                return Err(Error::Stopped);
            }

            let mut request = self.client.post(&self.config.endpoint).json(&call);
            if let Some(token) = &self.config.bearer_token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await.map_err(|e| {
                Error::transport_with_source(
                    format!("request to {} failed", self.config.endpoint),
                    e,
                )
            })?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(Error::transport(format!("endpoint returned {status}: {body}")));
            }

            let raw: Value = response
                .json()
                .await
                .map_err(|e| Error::transport_with_source("failed to read response body", e))?;
            let ret: Return = serde_json::from_value(raw.clone())?;
            if ret.call_id != call.call_id {
                return Err(Error::transport(format!(
                    "response carried call ID {} for call {}",
                    ret.call_id, call.call_id
                )));
            }
            Ok(ret.with_raw(raw))
        }

        fn set_concurrency(&self, max_concurrency: usize) {
            // The endpoint enforces its own limit; client-side fan-out is
            // throttled by the facade.
            tracing::debug!(max_concurrency, "http provider ignores concurrency changes");
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::Release);
        }

        async fn cleanup(&self, _options: CleanupOptions) -> Result<()> {
            self.stop().await;
            Ok(())
        }

        fn resource_list(&self) -> Result<String> {
            Ok(serde_json::json!({
                "provider": ProviderKind::Http,
                "instanceId": self.instance_id,
                "endpoint": self.config.endpoint,
            })
            .to_string())
        }
    }
}

// ============================================================================
// Placeholder Implementation
// ============================================================================

#[cfg(not(feature = "http"))]
mod placeholder_impl {
    use async_trait::async_trait;

    use stratus_core::InstanceId;

    use super::{Error, HttpProviderConfig, Result};
    use crate::config::CleanupOptions;
    use crate::envelope::{Call, Return};
    use crate::provider::{Provider, ProviderKind};

    const FEATURE_REQUIRED: &str = "HttpProvider requires the 'http' feature to be enabled. \
         Add `stratus-invoke = { features = [\"http\"] }` to your Cargo.toml.";

    /// Placeholder HTTP backend (`http` feature not enabled).
    #[derive(Debug)]
    pub struct HttpProvider {
        instance_id: InstanceId,
        config: HttpProviderConfig,
    }

    impl HttpProvider {
        /// Creates a placeholder backend.
        ///
        /// # Errors
        ///
        /// Returns an error if configuration is invalid.
        pub fn new(config: HttpProviderConfig) -> Result<Self> {
            config.validate()?;
            Ok(Self {
                instance_id: InstanceId::generate(),
                config,
            })
        }
    }

    #[async_trait]
    impl Provider for HttpProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Http
        }

        fn instance_id(&self) -> InstanceId {
            self.instance_id
        }

        async fn call_function(&self, _call: Call) -> Result<Return> {
            Err(Error::configuration(FEATURE_REQUIRED))
        }

        fn set_concurrency(&self, _max_concurrency: usize) {}

        async fn stop(&self) {}

        async fn cleanup(&self, _options: CleanupOptions) -> Result<()> {
            Ok(())
        }

        fn resource_list(&self) -> Result<String> {
            Ok(serde_json::json!({
                "provider": ProviderKind::Http,
                "instanceId": self.instance_id,
                "endpoint": self.config.endpoint,
            })
            .to_string())
        }
    }
}

#[cfg(feature = "http")]
pub use http_impl::HttpProvider;

#[cfg(not(feature = "http"))]
pub use placeholder_impl::HttpProvider;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(HttpProviderConfig::new("https://fn.example.com/invoke")
            .validate()
            .is_ok());
        assert!(HttpProviderConfig::new("ftp://example.com").validate().is_err());
        assert!(HttpProviderConfig::new("http://localhost:8080")
            .with_bearer_token("  ")
            .validate()
            .is_err());
        assert!(HttpProviderConfig::new("http://localhost:8080")
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn debug_redacts_token() {
        let config = HttpProviderConfig::new("https://example.com").with_bearer_token("s3cret");
        let rendered = format!("{config:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn deserializes_with_default_timeout() {
        let config: HttpProviderConfig =
            serde_json::from_value(serde_json::json!({"endpoint": "https://example.com"})).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.bearer_token, None);
    }

    #[cfg(not(feature = "http"))]
    mod placeholder_tests {
        use super::super::HttpProvider;
        use super::HttpProviderConfig;
        use crate::envelope::Call;
        use crate::provider::Provider;

        #[tokio::test]
        async fn placeholder_rejects_calls() {
            assert!(HttpProvider::new(HttpProviderConfig::new("")).is_err());

            let provider = HttpProvider::new(HttpProviderConfig::new("https://example.com")).unwrap();
            let err = provider
                .call_function(Call::new("f", vec![]))
                .await
                .unwrap_err();
            assert_eq!(err.name(), "ConfigurationError");
        }
    }
}
