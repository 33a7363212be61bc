//! Pipeline composition: combines all middleware layers into a single service stack.

use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder};
use xpc_core::Value;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::suppress::SuppressLayer;
use super::timeout::TimeoutLayer;
use crate::config::BrokerConfig;
use crate::service::operation::{Call, CallError};

/// The boxed call pipeline held by the broker.
pub type CallPipeline = BoxCloneService<Call, Option<Value>, CallError>;

/// Build the call pipeline by wrapping `router` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `SuppressLayer` -- apply the failure policy to every outcome
/// 2. `MetricsLayer` -- span, counter and histogram, so shed and timed-out
///    calls are recorded too
/// 3. `LoadShedLayer` -- reject when overloaded before doing any work
/// 4. `TimeoutLayer` -- enforce the per-call deadline
#[must_use]
pub fn build_call_pipeline<S>(router: S, config: &BrokerConfig) -> CallPipeline
where
    S: Service<Call, Response = Option<Value>, Error = CallError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    let service = ServiceBuilder::new()
        .layer(SuppressLayer::new(config.failure_policy))
        .layer(MetricsLayer)
        .layer(LoadShedLayer::new(config.max_concurrent_calls))
        .layer(TimeoutLayer)
        .service(router);
    BoxCloneService::new(service)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use tower::ServiceExt;
    use xpc_core::CorrelationId;

    use super::*;
    use crate::service::operation::{CallContext, CallerOrigin, FailurePolicy};

    fn stall(_call: Call) -> BoxFuture<'static, Result<Option<Value>, CallError>> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Some(Value::Null))
        })
    }

    fn make_call(params: Option<Value>, timeout: Option<Duration>) -> Call {
        Call {
            ctx: CallContext::new(CorrelationId::new("p-1"), "Echo/ping", CallerOrigin::Broker, timeout),
            params,
        }
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let echo = tower::service_fn(|call: Call| async move { Ok::<_, CallError>(call.params) });
        let svc = build_call_pipeline(echo, &BrokerConfig::default());

        let result = svc.oneshot(make_call(Some(Value::Int(1)), None)).await.unwrap();
        assert_eq!(result, Some(Value::Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_suppressed_by_default() {
        let svc = build_call_pipeline(tower::service_fn(stall), &BrokerConfig::default());
        let result = svc
            .oneshot(make_call(None, Some(Duration::from_millis(20))))
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reaches_caller_when_propagating() {
        let config = BrokerConfig {
            failure_policy: FailurePolicy::Propagate,
            ..BrokerConfig::default()
        };
        let svc = build_call_pipeline(tower::service_fn(stall), &config);
        let err = svc
            .oneshot(make_call(None, Some(Duration::from_millis(20))))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn zero_capacity_sheds_every_call() {
        let config = BrokerConfig {
            failure_policy: FailurePolicy::Propagate,
            max_concurrent_calls: 0,
            ..BrokerConfig::default()
        };
        let echo = tower::service_fn(|call: Call| async move { Ok::<_, CallError>(call.params) });
        let svc = build_call_pipeline(echo, &config);
        let err = svc.oneshot(make_call(None, None)).await.unwrap_err();
        assert!(matches!(err, CallError::Overloaded { limit: 0, .. }));
    }
}
