//! Timeout middleware for calls.
//!
//! Fails calls that exceed their `call_timeout` with `CallError::Timeout`.
//! Dropping the inner future on expiry also drops any pending-call waiter,
//! which removes its record.

use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tower::{Layer, Service};
use xpc_core::Value;

use crate::service::operation::{Call, CallError};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps services with per-call deadline enforcement.
///
/// The deadline is read from each call's `ctx.call_timeout`; calls without
/// one pass straight through.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<Call> for TimeoutService<S>
where
    S: Service<Call, Response = Option<Value>, Error = CallError> + Send,
    S::Future: Send + 'static,
{
    type Response = Option<Value>;
    type Error = CallError;
    type Future = BoxFuture<'static, Result<Option<Value>, CallError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: Call) -> Self::Future {
        let deadline = call.ctx().call_timeout;
        let name = call.ctx().operation_name.clone();
        let fut = self.inner.call(call);
        Box::pin(async move {
            let Some(duration) = deadline else {
                return fut.await;
            };
            match tokio::time::timeout(duration, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(CallError::Timeout {
                    name,
                    timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
