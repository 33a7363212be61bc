use std::time::Duration;

use tracing::{debug, warn};
use xpc_core::{CodecError, CorrelationId, NameError, Value};

use crate::transport::{ContextId, SendError};

/// Outcome of a call: the result value, or `None` for "no result".
pub type CallResult = Result<Option<Value>, CallError>;

/// Context that issued a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerOrigin {
    /// Code running in the broker context.
    Broker,
    /// A satellite, through the `__xpc_exec__` exchange.
    Satellite(ContextId),
}

impl CallerOrigin {
    #[must_use]
    pub fn context_id(self) -> ContextId {
        match self {
            CallerOrigin::Broker => ContextId::BROKER,
            CallerOrigin::Satellite(id) => id,
        }
    }
}

/// Context carried with every call through the pipeline.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub call_id: CorrelationId,
    pub operation_name: String,
    pub caller: CallerOrigin,
    /// Deadline for the whole call. `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl CallContext {
    #[must_use]
    pub fn new(
        call_id: CorrelationId,
        operation_name: impl Into<String>,
        caller: CallerOrigin,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            call_id,
            operation_name: operation_name.into(),
            caller,
            call_timeout,
        }
    }
}

/// A call travelling through the broker's pipeline.
#[derive(Debug, Clone)]
pub struct Call {
    pub ctx: CallContext,
    pub params: Option<Value>,
}

impl Call {
    #[must_use]
    pub fn ctx(&self) -> &CallContext {
        &self.ctx
    }
}

/// Everything that can go wrong between invoking an operation and getting
/// its result.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("no owner registered for operation {name}")]
    UnknownOperation { name: String },
    #[error("operation {name} is owned locally but has no handler")]
    MissingHandler { name: String },
    #[error("owner {context} of operation {name} is unreachable")]
    Unreachable { name: String, context: ContextId },
    #[error("handler for {name} failed: {reason}")]
    HandlerFailed { name: String, reason: String },
    #[error("operation {name} timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },
    #[error("{context} went away before answering {name}")]
    Abandoned { name: String, context: ContextId },
    #[error("too many pending calls (limit {limit})")]
    TooManyPending { limit: usize },
    #[error("correlation id {id} is already in flight")]
    DuplicateId { id: CorrelationId },
    #[error("{name} shed: {limit} calls already in flight")]
    Overloaded { name: String, limit: u32 },
    #[error("broker is shutting down")]
    ShuttingDown,
    #[error("invalid operation name: {0}")]
    InvalidName(#[from] NameError),
    #[error("method {method} of {type_name} is not part of its call surface")]
    NotExposed { type_name: String, method: String },
    #[error("transport send failed: {0}")]
    Send(#[from] SendError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CallError {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::UnknownOperation { .. } => "unknown_operation",
            CallError::MissingHandler { .. } => "missing_handler",
            CallError::Unreachable { .. } => "unreachable",
            CallError::HandlerFailed { .. } => "handler_failed",
            CallError::Timeout { .. } => "timeout",
            CallError::Abandoned { .. } => "abandoned",
            CallError::TooManyPending { .. } => "too_many_pending",
            CallError::DuplicateId { .. } => "duplicate_id",
            CallError::Overloaded { .. } => "overloaded",
            CallError::ShuttingDown => "shutting_down",
            CallError::InvalidName(_) => "invalid_name",
            CallError::NotExposed { .. } => "not_exposed",
            CallError::Send(_) => "send",
            CallError::Codec(_) => "codec",
        }
    }
}

/// How routing failures are reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Every failure resolves to "no result"; the cause is only logged.
    #[default]
    Suppress,
    /// The caller receives the `CallError`.
    Propagate,
}

impl FailurePolicy {
    /// Applies the policy to the outcome of a call to `operation`.
    pub fn apply(self, operation: &str, result: CallResult) -> CallResult {
        match (self, result) {
            (_, Ok(value)) => Ok(value),
            (FailurePolicy::Propagate, Err(e)) => Err(e),
            (FailurePolicy::Suppress, Err(e)) => {
                match &e {
                    CallError::UnknownOperation { .. } | CallError::MissingHandler { .. } => {
                        debug!(operation, error = %e, "call resolved to no result");
                    }
                    _ => warn!(operation, error = %e, "call failed, resolving to no result"),
                }
                Ok(None)
            }
        }
    }

    #[must_use]
    pub fn propagates(self) -> bool {
        self == FailurePolicy::Propagate
    }
}
