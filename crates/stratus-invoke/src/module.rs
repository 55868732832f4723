//! Explicit namespaces of remotely invocable functions.
//!
//! A [`FunctionModule`] maps names to exports. Function exports share one
//! calling convention: they take the already-encoded positional arguments
//! and produce an encoded value or a [`RemoteError`]. Constant exports exist
//! so a module can describe its whole namespace; they have no remote-call
//! semantics and are skipped when wrapping.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::envelope::{now_ms, Call, RemoteError, Return};

/// Boxed future produced by a [`Handler`].
pub type HandlerFuture = BoxFuture<'static, Result<Value, RemoteError>>;

/// A function export with the uniform calling convention.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// One named entry of a [`FunctionModule`].
#[derive(Clone)]
pub enum Export {
    /// A callable.
    Function(Handler),
    /// A plain value.
    Constant(Value),
}

impl Export {
    /// Returns true for function exports.
    #[must_use]
    pub const fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("Function(<handler>)"),
            Self::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
        }
    }
}

/// A namespace of exports, ordered by name.
///
/// ```rust
/// use serde_json::{json, Value};
/// use stratus_invoke::module::FunctionModule;
///
/// let module = FunctionModule::new()
///     .function("double", |args: Vec<Value>| async move {
///         let n = args.first().and_then(Value::as_i64).unwrap_or_default();
///         Ok(json!(n * 2))
///     })
///     .constant("VERSION", json!("1.0"));
///
/// assert_eq!(module.function_names().collect::<Vec<_>>(), ["double"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FunctionModule {
    exports: BTreeMap<String, Export>,
}

impl FunctionModule {
    /// Creates an empty module.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a function export.
    #[must_use]
    pub fn function<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| f(args).boxed());
        self.exports.insert(name.into(), Export::Function(handler));
        self
    }

    /// Adds a constant export.
    #[must_use]
    pub fn constant(mut self, name: impl Into<String>, value: Value) -> Self {
        self.exports.insert(name.into(), Export::Constant(value));
        self
    }

    /// Returns the export registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    /// Iterates over all exports.
    pub fn exports(&self) -> impl Iterator<Item = (&str, &Export)> {
        self.exports.iter().map(|(name, export)| (name.as_str(), export))
    }

    /// Iterates over the names of function exports.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.exports()
            .filter(|(_, export)| export.is_function())
            .map(|(name, _)| name)
    }

    /// Executes `call` against this module, the way a worker on the remote
    /// side would, stamping the execution window on the return.
    ///
    /// Unknown names, constants and panicking handlers all become error
    /// returns.
    pub async fn execute(&self, call: &Call) -> Return {
        let started = now_ms();
        let outcome = match self.exports.get(&call.name) {
            Some(Export::Function(handler)) => {
                let handler = Arc::clone(handler);
                let args = call.args.clone();
                AssertUnwindSafe(async move { handler(args).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(RemoteError::new(
                            "PanicError",
                            format!("function '{}' panicked", call.name),
                        ))
                    })
            }
            Some(Export::Constant(_)) => Err(RemoteError::new(
                "TypeError",
                format!("'{}' is not a function", call.name),
            )),
            None => Err(RemoteError::from(stratus_core::Error::not_found(
                "function",
                &call.name,
            ))),
        };

        let ret = match outcome {
            Ok(value) => Return::value(call.call_id, value),
            Err(error) => Return::error(call.call_id, error),
        };
        ret.with_execution(started, now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Outcome;
    use serde_json::json;

    fn module() -> FunctionModule {
        FunctionModule::new()
            .function("echo", |args: Vec<Value>| async move { Ok(Value::Array(args)) })
            .function("fail", |_| async {
                Err(RemoteError::new("ValidationError", "bad input"))
            })
            .function("explode", |_| async { panic!("kaboom") })
            .constant("LIMIT", json!(10))
    }

    #[test]
    fn function_names_skip_constants() {
        let module = module();
        let names: Vec<_> = module.function_names().collect();
        assert_eq!(names, ["echo", "explode", "fail"]);
    }

    #[tokio::test]
    async fn execute_stamps_execution_window() {
        let call = Call::new("echo", vec![json!(1), json!("two")]);
        let ret = module().execute(&call).await;

        assert_eq!(ret.call_id, call.call_id);
        assert_eq!(ret.outcome, Outcome::Value(json!([1, "two"])));
        let (start, end) = (ret.execution_start.unwrap(), ret.execution_end.unwrap());
        assert!(start <= end);
    }

    #[tokio::test]
    async fn execute_reports_handler_errors() {
        let ret = module().execute(&Call::new("fail", vec![])).await;
        assert_eq!(
            ret.outcome,
            Outcome::Error(RemoteError::new("ValidationError", "bad input"))
        );
    }

    #[tokio::test]
    async fn execute_contains_panics() {
        let ret = module().execute(&Call::new("explode", vec![])).await;
        match ret.outcome {
            Outcome::Error(e) => assert_eq!(e.name, "PanicError"),
            Outcome::Value(_) => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn execute_rejects_unknown_and_constant_names() {
        let module = module();
        for (name, expected) in [("missing", "NotFoundError"), ("LIMIT", "TypeError")] {
            match module.execute(&Call::new(name, vec![])).await.outcome {
                Outcome::Error(e) => assert_eq!(e.name, expected),
                Outcome::Value(_) => panic!("expected error for {name}"),
            }
        }
    }
}
