//! Operation names and the reserved protocol channels.
//!
//! Operation names are free-form strings, conventionally
//! `"<TypeName>/<MethodName>"`. The `__xpc_` prefix belongs to the protocol
//! and can never name an application operation.

use thiserror::Error;

/// Prefix shared by every protocol channel.
pub const RESERVED_PREFIX: &str = "__xpc_";

/// Satellite announces that it serves an operation.
pub const REGISTER_CHANNEL: &str = "__xpc_register__";

/// Satellite asks the broker to route a call (request/response).
pub const EXEC_CHANNEL: &str = "__xpc_exec__";

/// Owning context returns the result of a forwarded call.
pub const FINISH_CHANNEL: &str = "__xpc_finish__";

/// Satellite leaves; the broker abandons calls waiting on it.
pub const DETACH_CHANNEL: &str = "__xpc_detach__";

/// Separator between type name and method name.
pub const SEPARATOR: char = '/';

/// Rejected operation name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("operation name is empty")]
    Empty,
    #[error("operation name {0:?} uses the reserved prefix \"__xpc_\"")]
    Reserved(String),
}

/// Builds the conventional operation name for a method of a type.
#[must_use]
pub fn operation_name(type_name: &str, method_name: &str) -> String {
    format!("{type_name}{SEPARATOR}{method_name}")
}

/// Splits a conventional name into `(type, method)`.
///
/// Returns `None` for names without a separator. Only the first separator
/// counts, so the method part may itself contain `/`.
#[must_use]
pub fn split_operation_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(SEPARATOR)
}

/// Checks that `name` may be registered by an application.
///
/// # Errors
///
/// Returns `NameError::Empty` for an empty name and `NameError::Reserved`
/// for names in the protocol's namespace.
pub fn validate_operation_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(NameError::Reserved(name.to_string()));
    }
    Ok(())
}

/// Methods whose name starts with `_` are private by convention.
#[must_use]
pub fn is_private_method(method_name: &str) -> bool {
    method_name.starts_with('_')
}
