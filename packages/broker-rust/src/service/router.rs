//! Call routing: dispatches a `Call` to its owner by operation name.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tower::Service;
use tracing::debug;
use xpc_core::{encode_frame, CallEnvelope, Frame, Value};

use super::handler::HandlerTable;
use super::operation::{Call, CallError};
use super::pending::PendingCallTable;
use super::registry::{OperationRegistry, Owner};
use crate::transport::{ContextRegistry, OutboundMessage};

// ---------------------------------------------------------------------------
// CallRouter
// ---------------------------------------------------------------------------

/// Innermost service of the broker's pipeline.
///
/// Looks the operation up in the [`OperationRegistry`] and either runs the
/// local handler inline or forwards the call to the owning satellite and
/// suspends until its `Finish` frame arrives. Failures are returned as
/// `CallError`; the outer `SuppressLayer` decides what the caller sees.
#[derive(Debug, Clone)]
pub struct CallRouter {
    registry: Arc<OperationRegistry>,
    handlers: HandlerTable,
    pending: PendingCallTable,
    contexts: Arc<ContextRegistry>,
    send_timeout: Duration,
}

impl CallRouter {
    #[must_use]
    pub fn new(
        registry: Arc<OperationRegistry>,
        handlers: HandlerTable,
        pending: PendingCallTable,
        contexts: Arc<ContextRegistry>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            handlers,
            pending,
            contexts,
            send_timeout,
        }
    }

    async fn dispatch(self, call: Call) -> Result<Option<Value>, CallError> {
        let Call { ctx, params } = call;
        let name = ctx.operation_name;

        let Some(owner) = self.registry.owner(&name) else {
            return Err(CallError::UnknownOperation { name });
        };

        let target = match owner {
            Owner::Local => return self.handlers.execute(&name, params).await,
            Owner::Remote(target) => target,
        };

        let Some(handle) = self.contexts.get_connected(target) else {
            return Err(CallError::Unreachable {
                name,
                context: target,
            });
        };

        let envelope = CallEnvelope::request(ctx.call_id, name, params);
        let waiter = self.pending.register(&envelope, target)?;
        let bytes = encode_frame(&Frame::Call(envelope))?;

        debug!(call_id = %waiter.id(), target = %target, "forwarding call");
        // On a send failure the waiter is dropped here, removing its record.
        handle
            .send_timeout(OutboundMessage::Binary(bytes), self.send_timeout)
            .await?;

        waiter.wait().await
    }
}

impl Service<Call> for CallRouter {
    type Response = Option<Value>;
    type Error = CallError;
    type Future = BoxFuture<'static, Result<Option<Value>, CallError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: Call) -> Self::Future {
        Box::pin(self.clone().dispatch(call))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tower::ServiceExt;
    use xpc_core::{decode_frame, CorrelationId};

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::service::handler::handler_fn;
    use crate::service::operation::{CallContext, CallerOrigin};
    use crate::transport::ContextId;

    struct Fixture {
        registry: Arc<OperationRegistry>,
        handlers: HandlerTable,
        pending: PendingCallTable,
        contexts: Arc<ContextRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(OperationRegistry::new()),
                handlers: HandlerTable::new(),
                pending: PendingCallTable::new(16),
                contexts: Arc::new(ContextRegistry::new()),
            }
        }

        fn router(&self) -> CallRouter {
            CallRouter::new(
                Arc::clone(&self.registry),
                self.handlers.clone(),
                self.pending.clone(),
                Arc::clone(&self.contexts),
                Duration::from_secs(1),
            )
        }
    }

    fn call(id: &str, name: &str, params: Option<Value>) -> Call {
        Call {
            ctx: CallContext::new(CorrelationId::new(id), name, CallerOrigin::Broker, None),
            params,
        }
    }

    #[tokio::test]
    async fn unknown_operation_is_an_error() {
        let fx = Fixture::new();
        let err = fx.router().oneshot(call("c-1", "NoSuchOp/x", None)).await.unwrap_err();
        assert!(matches!(err, CallError::UnknownOperation { name } if name == "NoSuchOp/x"));
    }

    #[tokio::test]
    async fn local_owner_runs_handler_inline() {
        let fx = Fixture::new();
        fx.registry.register_local("Echo/ping");
        fx.handlers
            .insert("Echo/ping", handler_fn(|params| async move { Ok(params) }));

        let result = fx
            .router()
            .oneshot(call("c-1", "Echo/ping", Some(Value::Int(3))))
            .await
            .unwrap();
        assert_eq!(result, Some(Value::Int(3)));
    }

    #[tokio::test]
    async fn local_owner_without_handler() {
        let fx = Fixture::new();
        fx.registry.register_local("Ghost/op");
        let err = fx.router().oneshot(call("c-1", "Ghost/op", None)).await.unwrap_err();
        assert!(matches!(err, CallError::MissingHandler { .. }));
    }

    #[tokio::test]
    async fn remote_owner_that_never_attached_is_unreachable() {
        let fx = Fixture::new();
        fx.registry.register_remote("Db/query", ContextId(9));
        let err = fx.router().oneshot(call("c-1", "Db/query", None)).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Unreachable { context: ContextId(9), .. }
        ));
        assert!(fx.pending.is_empty());
    }

    #[tokio::test]
    async fn remote_call_is_forwarded_and_resolved() {
        let fx = Fixture::new();
        let (handle, mut rx) = fx.contexts.register(&ConnectionConfig::default());
        fx.registry.register_remote("Math/double", handle.id);

        let router = fx.router();
        let task = tokio::spawn(router.oneshot(call("c-7", "Math/double", Some(Value::Int(21)))));

        let Some(OutboundMessage::Binary(bytes)) = rx.recv().await else {
            panic!("expected a binary frame");
        };
        let Frame::Call(envelope) = decode_frame(&bytes).unwrap() else {
            panic!("expected a call frame");
        };
        assert_eq!(envelope.id, CorrelationId::new("c-7"));
        assert_eq!(envelope.operation_name, "Math/double");
        assert!(fx.pending.contains(&envelope.id));

        assert!(fx.pending.resolve(envelope.into_response(Some(Value::Int(42)))));
        assert_eq!(task.await.unwrap().unwrap(), Some(Value::Int(42)));
        assert!(fx.pending.is_empty());
    }

    #[tokio::test]
    async fn closed_satellite_is_unreachable() {
        let fx = Fixture::new();
        let (handle, rx) = fx.contexts.register(&ConnectionConfig::default());
        fx.registry.register_remote("Db/query", handle.id);
        drop(rx);

        let err = fx.router().oneshot(call("c-1", "Db/query", None)).await.unwrap_err();
        assert!(matches!(err, CallError::Unreachable { .. }));
    }
}
