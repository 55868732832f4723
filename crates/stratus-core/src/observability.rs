//! Observability infrastructure for stratus.
//!
//! Structured logging with consistent spans. This module provides the
//! subscriber initialization helper and the span constructors used by the
//! invocation engine and the garbage collector.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `stratus_invoke=debug`)
///
/// # Example
///
/// ```rust
/// use stratus_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // A subscriber may already be installed by the host application.
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
    });
}

/// Creates a span for a single remote invocation.
///
/// # Example
///
/// ```rust
/// use stratus_core::observability::invocation_span;
///
/// let span = invocation_span("resize_image", "01HZX3", "01HZX0");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn invocation_span(function: &str, call_id: &str, instance: &str) -> Span {
    tracing::info_span!(
        "invoke",
        function = function,
        call_id = call_id,
        instance = instance,
    )
}

/// Creates a span for one garbage collection pass.
#[must_use]
pub fn gc_span(instance: &str) -> Span {
    tracing::info_span!("gc", instance = instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn invocation_span_can_be_entered() {
        let span = invocation_span("double", "call", "instance");
        let _guard = span.enter();
        tracing::info!("inside invocation span");
    }

    #[test]
    fn gc_span_can_be_entered() {
        let span = gc_span("instance");
        let _guard = span.enter();
        tracing::debug!("inside gc span");
    }
}
