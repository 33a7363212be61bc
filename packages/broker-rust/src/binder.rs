//! Binding a type's methods as operations.
//!
//! A type declares its call surface by implementing [`Exposed`]; the
//! [`HandlerBinder`] registers every exposed method with a dispatcher under
//! `"<TypeName>/<method>"`.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tracing::debug;
use xpc_core::names::{is_private_method, SEPARATOR};
use xpc_core::{operation_name, Value};

use crate::service::{CallError, Handler, HandlerResult};
use crate::traits::Dispatcher;

/// Name treated as a constructor and never exposed.
const CONSTRUCTOR: &str = "new";

/// A type whose methods can be called from any context.
///
/// ```ignore
/// impl Exposed for Calculator {
///     fn type_name() -> &'static str { "Calculator" }
///     fn methods() -> MethodTable<Self> {
///         MethodTable::new()
///             .method("double", |this, params| async move { this.double(params) })
///             .method_without_params("reset", |this| async move { this.reset() })
///             .method("debug_dump", |this, _| async move { this.dump() })
///             .ignore()
///     }
/// }
/// ```
pub trait Exposed: Send + Sync + Sized + 'static {
    /// First half of every operation name this type registers.
    fn type_name() -> &'static str;

    /// The methods this type declares.
    fn methods() -> MethodTable<Self>;
}

type BoundMethod<T> =
    Arc<dyn Fn(Arc<T>, Option<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

struct MethodEntry<T> {
    name: String,
    call: BoundMethod<T>,
    ignored: bool,
}

impl<T> MethodEntry<T> {
    fn is_exposed(&self) -> bool {
        !self.ignored && self.name != CONSTRUCTOR && !is_private_method(&self.name)
    }
}

/// Declaration table of a type's methods, in declaration order.
///
/// Methods take at most one argument, the call's params.
pub struct MethodTable<T> {
    entries: Vec<MethodEntry<T>>,
}

impl<T: Send + Sync + 'static> MethodTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Declares a method taking the call's params.
    #[must_use]
    pub fn method<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Arc<T>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.entries.push(MethodEntry {
            name: name.to_string(),
            call: Arc::new(move |this, params| -> BoxFuture<'static, HandlerResult> {
                Box::pin(f(this, params))
            }),
            ignored: false,
        });
        self
    }

    /// Declares a method that takes no argument; params are discarded.
    #[must_use]
    pub fn method_without_params<F, Fut>(self, name: &str, f: F) -> Self
    where
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.method(name, move |this, _params| f(this))
    }

    /// Opts the most recently declared method out of binding.
    #[must_use]
    pub fn ignore(mut self) -> Self {
        if let Some(last) = self.entries.last_mut() {
            last.ignored = true;
        }
        self
    }

    /// Every declared method name, exposed or not.
    #[must_use]
    pub fn declared(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Method names the binder registers.
    #[must_use]
    pub fn exposed(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.is_exposed())
            .map(|e| e.name.as_str())
            .collect()
    }
}

impl<T: Send + Sync + 'static> Default for MethodTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A type's declaration that cannot be bound.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("{type_name} declares a method with an empty name")]
    EmptyMethodName { type_name: String },
    #[error("type name {type_name:?} is empty or contains '/'")]
    InvalidTypeName { type_name: String },
    #[error("method {type_name}.{method} contains '/'")]
    InvalidMethodName { type_name: String, method: String },
    #[error("{type_name} declares {method} more than once")]
    DuplicateMethod { type_name: String, method: String },
    #[error("failed to register {name}: {source}")]
    Register {
        name: String,
        #[source]
        source: CallError,
    },
}

/// Registers a type's exposed methods with a dispatcher.
pub struct HandlerBinder;

impl HandlerBinder {
    /// Binds every exposed method of `target`, returning the registered
    /// operation names in declaration order.
    ///
    /// The whole declaration is checked before anything is registered, and a
    /// registration refused part-way removes the handlers bound before it.
    ///
    /// # Errors
    ///
    /// Returns `BindError` for empty, duplicate or `/`-containing names, or
    /// when the dispatcher refuses a registration.
    pub fn bind<T: Exposed>(
        dispatcher: &dyn Dispatcher,
        target: Arc<T>,
    ) -> Result<Vec<String>, BindError> {
        let type_name = T::type_name();
        let table = T::methods();
        validate(type_name, &table)?;

        let mut bound: Vec<String> = Vec::new();
        for entry in table.entries.iter().filter(|e| e.is_exposed()) {
            let name = operation_name(type_name, &entry.name);
            let this = Arc::clone(&target);
            let call = Arc::clone(&entry.call);
            let handler: Handler = Arc::new(move |params| call(Arc::clone(&this), params));

            if let Err(source) = dispatcher.register_handler(&name, handler) {
                // All or nothing: forget what this call already registered.
                for done in &bound {
                    dispatcher.remove_handler(done);
                }
                return Err(BindError::Register { name, source });
            }
            bound.push(name);
        }

        debug!(
            type_name,
            context = %dispatcher.context_id(),
            bound = bound.len(),
            declared = table.entries.len(),
            "type bound"
        );
        Ok(bound)
    }
}

fn validate<T>(type_name: &str, table: &MethodTable<T>) -> Result<(), BindError> {
    if type_name.is_empty() || type_name.contains(SEPARATOR) {
        return Err(BindError::InvalidTypeName {
            type_name: type_name.to_string(),
        });
    }

    let mut seen = std::collections::HashSet::new();
    for entry in &table.entries {
        if entry.name.is_empty() {
            return Err(BindError::EmptyMethodName {
                type_name: type_name.to_string(),
            });
        }
        if entry.name.contains(SEPARATOR) {
            return Err(BindError::InvalidMethodName {
                type_name: type_name.to_string(),
                method: entry.name.clone(),
            });
        }
        if !seen.insert(entry.name.as_str()) {
            return Err(BindError::DuplicateMethod {
                type_name: type_name.to_string(),
                method: entry.name.clone(),
            });
        }
    }
    Ok(())
}
