//! Concurrency cap on routed calls.
//!
//! A call that finds every permit taken is shed on the spot with
//! `CallError::Overloaded` naming the operation; calls never queue here.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::debug;
use xpc_core::Value;

use crate::service::operation::{Call, CallError};

/// Shares one permit pool between every service it wraps, so all clones of
/// the pipeline count against the same limit.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    permits: Arc<Semaphore>,
    limit: u32,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit as usize)),
            limit,
        }
    }

    /// Calls currently holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        (self.limit as usize).saturating_sub(self.permits.available_permits())
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            permits: Arc::clone(&self.permits),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    permits: Arc<Semaphore>,
    limit: u32,
}

impl<S> Service<Call> for LoadShedService<S>
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
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            let name = call.ctx.operation_name.clone();
            debug!(operation = %name, call_id = %call.ctx.call_id, limit = self.limit, "call shed");
            let limit = self.limit;
            return Box::pin(async move { Err(CallError::Overloaded { name, limit }) });
        };

        let fut = self.inner.call(call);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tower::ServiceExt;
    use xpc_core::CorrelationId;

    use super::*;
    use crate::service::operation::{CallContext, CallerOrigin};

    fn call_to(name: &str) -> Call {
        Call {
            ctx: CallContext::new(CorrelationId::new("l-1"), name, CallerOrigin::Broker, None),
            params: None,
        }
    }

    #[tokio::test]
    async fn calls_under_the_limit_pass() {
        let layer = LoadShedLayer::new(10);
        let svc = layer.layer(tower::service_fn(|call: Call| async move {
            Ok::<_, CallError>(call.params)
        }));
        assert_eq!(svc.oneshot(call_to("Any/op")).await.unwrap(), None);
        assert_eq!(layer.in_flight(), 0);
    }

    #[tokio::test]
    async fn shed_call_names_its_operation() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(parking_lot::Mutex::new(Some(release_rx)));
        let layer = LoadShedLayer::new(1);
        let mut svc = layer.layer(tower::service_fn(move |_call: Call| {
            let rx = release_rx.lock().take();
            async move {
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok::<_, CallError>(None)
            }
        }));

        let _ = ServiceExt::ready(&mut svc).await.unwrap();
        let parked = tokio::spawn(svc.call(call_to("Slow/op")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(layer.in_flight(), 1);

        let err = svc.call(call_to("Db/query")).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Overloaded { name, limit: 1 } if name == "Db/query"
        ));

        release_tx.send(()).unwrap();
        parked.await.unwrap().unwrap();
        assert_eq!(layer.in_flight(), 0);
        assert!(svc.call(call_to("Db/query")).await.is_ok());
    }
}
