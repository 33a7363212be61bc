//! Failure-policy middleware.
//!
//! Outermost layer of the pipeline: applies the broker's [`FailurePolicy`]
//! to whatever the inner layers produced, so under `Suppress` every failure
//! (including load shedding and timeouts) reaches the caller as "no result".

use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tower::{Layer, Service};
use xpc_core::Value;

use crate::service::operation::{Call, CallError, FailurePolicy};

#[derive(Debug, Clone)]
pub struct SuppressLayer {
    policy: FailurePolicy,
}

impl SuppressLayer {
    #[must_use]
    pub fn new(policy: FailurePolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for SuppressLayer {
    type Service = SuppressService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SuppressService {
            inner,
            policy: self.policy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SuppressService<S> {
    inner: S,
    policy: FailurePolicy,
}

impl<S> Service<Call> for SuppressService<S>
where
    S: Service<Call, Response = Option<Value>, Error = CallError> + Send,
    S::Future: Send + 'static,
{
    type Response = Option<Value>;
    type Error = CallError;
    type Future = BoxFuture<'static, Result<Option<Value>, CallError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness errors are not suppressed: no call has been made yet.
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: Call) -> Self::Future {
        let policy = self.policy;
        let name = call.ctx().operation_name.clone();
        let fut = self.inner.call(call);
        Box::pin(async move { policy.apply(&name, fut.await) })
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;
    use xpc_core::CorrelationId;

    use super::*;
    use crate::service::operation::{CallContext, CallerOrigin};

    fn make_call() -> Call {
        Call {
            ctx: CallContext::new(CorrelationId::new("s-1"), "Fail/go", CallerOrigin::Broker, None),
            params: None,
        }
    }

    fn failing(_call: Call) -> BoxFuture<'static, Result<Option<Value>, CallError>> {
        Box::pin(async {
            Err(CallError::HandlerFailed {
                name: "Fail/go".to_string(),
                reason: "boom".to_string(),
            })
        })
    }

    #[tokio::test]
    async fn suppress_resolves_failures_to_no_result() {
        let svc = SuppressLayer::new(FailurePolicy::Suppress).layer(tower::service_fn(failing));
        assert_eq!(svc.oneshot(make_call()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn propagate_returns_the_error() {
        let svc = SuppressLayer::new(FailurePolicy::Propagate).layer(tower::service_fn(failing));
        let err = svc.oneshot(make_call()).await.unwrap_err();
        assert!(matches!(err, CallError::HandlerFailed { reason, .. } if reason == "boom"));
    }
}
