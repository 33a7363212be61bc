use async_trait::async_trait;
use xpc_core::Value;

use crate::service::{CallError, CallResult, Handler};
use crate::transport::ContextId;

/// A context's entry point into the broker.
/// Implementations: `Broker` (the broker context) and `Satellite`.
///
/// `invoke` is the only call surface: callers never learn which context owns
/// an operation.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Identifier of the context this dispatcher lives in.
    fn context_id(&self) -> ContextId;

    /// Stores `handler` under `name` and announces this context as its owner.
    ///
    /// Registering a name again replaces the handler; the broker's registry
    /// keeps the last owner announced.
    ///
    /// # Errors
    ///
    /// `CallError::InvalidName` for empty or reserved names; a satellite
    /// also fails with `CallError::Send` once the broker is gone.
    fn register_handler(&self, name: &str, handler: Handler) -> Result<(), CallError>;

    fn get_handler(&self, name: &str) -> Option<Handler>;

    /// Forgets the local handler. The broker's registry still names this
    /// context, so later calls resolve to "no result".
    fn remove_handler(&self, name: &str) -> Option<Handler>;

    /// Runs operation `name` wherever it is owned.
    ///
    /// # Errors
    ///
    /// Only under `FailurePolicy::Propagate`; otherwise failures resolve to
    /// `Ok(None)`.
    async fn invoke(&self, name: &str, params: Option<Value>) -> CallResult;
}
