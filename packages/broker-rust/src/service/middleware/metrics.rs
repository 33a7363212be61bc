//! Metrics middleware for calls.
//!
//! Runs every call inside a `call` tracing span and records the
//! `xpc_calls_total{outcome}` counter and the `xpc_call_duration_ms`
//! histogram. No exporter is installed here; the embedding application
//! picks one.

use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};
use xpc_core::Value;

use crate::service::operation::{Call, CallError};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments calls with timing and counting.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records call duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// Outcome label: `ok`, `empty` ("no result") or the error kind.
fn outcome(result: &Result<Option<Value>, CallError>) -> &'static str {
    match result {
        Ok(Some(_)) => "ok",
        Ok(None) => "empty",
        Err(e) => e.kind(),
    }
}

impl<S> Service<Call> for MetricsService<S>
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
        let span = info_span!(
            "call",
            operation = %call.ctx().operation_name,
            call_id = %call.ctx().call_id,
            caller = %call.ctx().caller.context_id(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(call);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = outcome(&result);
                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!("xpc_calls_total", "outcome" => outcome).increment(1);
                metrics::histogram!("xpc_call_duration_ms").record(elapsed.as_secs_f64() * 1000.0);

                tracing::debug!(duration_ms, outcome, "call complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tower::ServiceExt;
    use xpc_core::CorrelationId;

    use super::*;
    use crate::service::operation::{CallContext, CallerOrigin};

    fn make_call(params: Option<Value>) -> Call {
        Call {
            ctx: CallContext::new(
                CorrelationId::new("m-42"),
                "Echo/ping",
                CallerOrigin::Satellite(crate::transport::ContextId(2)),
                None,
            ),
            params,
        }
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_response() {
        let inner = tower::service_fn(|call: Call| async move { Ok::<_, CallError>(call.params) });
        let svc = MetricsLayer.layer(inner);

        let result = svc.oneshot(make_call(Some(Value::Int(42)))).await.unwrap();
        assert_eq!(result, Some(Value::Int(42)));
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_errors() {
        let inner = tower::service_fn(|_call: Call| async move {
            Err::<Option<Value>, _>(CallError::Overloaded {
                name: "Any/op".to_string(),
                limit: 1,
            })
        });
        let svc = MetricsLayer.layer(inner);

        let err = svc.oneshot(make_call(None)).await.unwrap_err();
        assert!(matches!(err, CallError::Overloaded { .. }));
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome(&Ok(Some(Value::Null))), "ok");
        assert_eq!(outcome(&Ok(None)), "empty");
        assert_eq!(outcome(&Err(CallError::ShuttingDown)), "shutting_down");
    }
}
