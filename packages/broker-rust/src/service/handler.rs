//! Locally implemented operations and their execution.
//!
//! A [`Handler`] is a type-erased async callable taking the call's params.
//! [`HandlerTable::execute`] is the single place where a handler runs, in the
//! broker context and in satellites alike: handler errors and panics are
//! caught here and turned into `CallError::HandlerFailed`.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use xpc_core::Value;

use super::operation::{CallError, CallResult};

/// What a handler body returns. Handler bodies use `anyhow` for errors.
pub type HandlerResult = anyhow::Result<Option<Value>>;

/// A locally implemented operation.
pub type Handler = Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wraps an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |params| -> BoxFuture<'static, HandlerResult> { Box::pin(f(params)) })
}

/// Map from operation name to the handler implementing it in this context.
///
/// Cloning is cheap and shares the underlying map.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<DashMap<String, Handler>>,
}

impl HandlerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handler` under `name`, returning the handler it replaced.
    pub fn insert(&self, name: impl Into<String>, handler: Handler) -> Option<Handler> {
        self.handlers.insert(name.into(), handler)
    }

    pub fn remove(&self, name: &str) -> Option<Handler> {
        self.handlers.remove(name).map(|(_, handler)| handler)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered operation names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns `CallError::MissingHandler` when nothing is registered and
    /// `CallError::HandlerFailed` when the handler returns an error or panics.
    pub async fn execute(&self, name: &str, params: Option<Value>) -> CallResult {
        let Some(handler) = self.get(name) else {
            return Err(CallError::MissingHandler {
                name: name.to_string(),
            });
        };

        // The handler may panic while building its future or while running it.
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(params))) {
            Ok(fut) => fut,
            Err(panic) => return Err(failed(name, panic_message(panic.as_ref()))),
        };

        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(failed(name, format!("{e:#}"))),
            Err(panic) => Err(failed(name, panic_message(panic.as_ref()))),
        }
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("operations", &self.names())
            .finish()
    }
}

fn failed(name: &str, reason: String) -> CallError {
    CallError::HandlerFailed {
        name: name.to_string(),
        reason,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
