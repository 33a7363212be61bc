//! Calling another type's operations by method name.
//!
//! A [`CallEmitter`] turns `call("double", params)` into
//! `dispatcher.invoke("Calculator/double", params)`. It holds no state beyond
//! the type name, so typed clients are thin wrappers around one.

use std::sync::Arc;

use xpc_core::names::is_private_method;
use xpc_core::{operation_name, Value};

use crate::binder::Exposed;
use crate::service::{CallError, CallResult};
use crate::traits::Dispatcher;

#[derive(Clone)]
pub struct CallEmitter {
    type_name: String,
    dispatcher: Arc<dyn Dispatcher>,
}

impl CallEmitter {
    /// Emitter for the operations `T` exposes.
    #[must_use]
    pub fn new<T: Exposed>(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self::named(T::type_name(), dispatcher)
    }

    /// Emitter for a type known only by name, e.g. one implemented in
    /// another crate.
    #[must_use]
    pub fn named(type_name: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            type_name: type_name.into(),
            dispatcher,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Invokes `<type>/<method>` with `params`.
    ///
    /// # Errors
    ///
    /// `CallError::NotExposed` for private (`_`-prefixed) methods, whatever
    /// the failure policy; otherwise as `Dispatcher::invoke`.
    pub async fn call(&self, method: &str, params: Option<Value>) -> CallResult {
        self.method(method).invoke(params).await
    }

    /// A callable handle for one method.
    #[must_use]
    pub fn method(&self, name: &str) -> EmittedMethod {
        EmittedMethod {
            type_name: self.type_name.clone(),
            method: name.to_string(),
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

impl std::fmt::Debug for CallEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEmitter")
            .field("type_name", &self.type_name)
            .field("context", &self.dispatcher.context_id())
            .finish()
    }
}

/// One method of an emitter's type.
#[derive(Clone)]
pub struct EmittedMethod {
    type_name: String,
    method: String,
    dispatcher: Arc<dyn Dispatcher>,
}

impl EmittedMethod {
    /// The operation this method invokes.
    #[must_use]
    pub fn operation_name(&self) -> String {
        operation_name(&self.type_name, &self.method)
    }

    /// # Errors
    ///
    /// Same as [`CallEmitter::call`].
    pub async fn invoke(&self, params: Option<Value>) -> CallResult {
        if is_private_method(&self.method) {
            return Err(CallError::NotExposed {
                type_name: self.type_name.clone(),
                method: self.method.clone(),
            });
        }
        self.dispatcher.invoke(&self.operation_name(), params).await
    }
}
