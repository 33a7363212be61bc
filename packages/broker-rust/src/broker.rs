//! The broker context: owner registry, call routing and satellite lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, info};
use xpc_core::{validate_operation_name, CallEnvelope, IdGenerator, Value};

use crate::config::BrokerConfig;
use crate::inbound::run_inbound_loop;
use crate::service::{
    build_call_pipeline, Call, CallContext, CallError, CallPipeline, CallResult, CallRouter,
    CallerOrigin, Handler, HandlerTable, OperationRegistry, Owner, PendingCallTable,
};
use crate::traits::Dispatcher;
use crate::transport::{
    BrokerLink, ContextId, ContextRegistry, InboundMessage, LifecycleController, OutboundMessage,
    Phase, SatelliteLink,
};

/// The broker context.
///
/// Knows which context owns every operation and routes each call to it.
/// Cloning is cheap; every clone drives the same broker. Several brokers may
/// coexist in one process.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    registry: Arc<OperationRegistry>,
    handlers: HandlerTable,
    pending: PendingCallTable,
    contexts: Arc<ContextRegistry>,
    ids: IdGenerator,
    lifecycle: LifecycleController,
    /// `BoxCloneService` is `Send` but not `Sync`; each call clones it.
    pipeline: Mutex<CallPipeline>,
    inbox_tx: mpsc::Sender<InboundMessage>,
    inbox_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl Broker {
    /// Allocates the broker's state. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(OperationRegistry::new());
        let handlers = HandlerTable::new();
        let pending = PendingCallTable::new(config.max_pending_calls);
        let contexts = Arc::new(ContextRegistry::new());

        let router = CallRouter::new(
            Arc::clone(&registry),
            handlers.clone(),
            pending.clone(),
            Arc::clone(&contexts),
            config.connection.send_timeout,
        );
        let pipeline = build_call_pipeline(router, &config);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));

        Self {
            inner: Arc::new(BrokerInner {
                config,
                registry,
                handlers,
                pending,
                contexts,
                ids: IdGenerator::new(),
                lifecycle: LifecycleController::new(),
                pipeline: Mutex::new(pipeline),
                inbox_tx,
                inbox_rx: Mutex::new(Some(inbox_rx)),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Marks `name` as served by the broker context itself.
    pub fn register_local_owner(&self, name: &str) {
        self.inner.registry.register_local(name);
    }

    /// Marks `name` as served by satellite `context`, replacing any owner.
    pub fn register_remote_owner(&self, name: &str, context: ContextId) {
        self.inner.registry.register_remote(name, context);
    }

    /// Routes a call made from the broker context.
    ///
    /// # Errors
    ///
    /// Never fails under `FailurePolicy::Suppress`; under `Propagate` returns
    /// the `CallError` that stopped the call.
    pub async fn route(&self, name: &str, params: Option<Value>) -> CallResult {
        self.route_as(CallerOrigin::Broker, name, params).await
    }

    /// Routes a call on behalf of `caller`.
    ///
    /// # Errors
    ///
    /// Same as [`route`](Self::route).
    pub async fn route_as(
        &self,
        caller: CallerOrigin,
        name: &str,
        params: Option<Value>,
    ) -> CallResult {
        let inner = &self.inner;
        if !inner.lifecycle.accepts_calls() {
            return inner
                .config
                .failure_policy
                .apply(name, Err(CallError::ShuttingDown));
        }
        let _guard = inner.lifecycle.call_guard();

        let call = Call {
            ctx: CallContext::new(inner.ids.next_id(), name, caller, inner.config.call_timeout),
            params,
        };
        let pipeline = inner.pipeline.lock().clone();
        pipeline.oneshot(call).await
    }

    /// Delivers the answer to a forwarded call.
    ///
    /// Returns `false` for unknown or already resolved ids.
    pub fn on_response_received(&self, response: CallEnvelope) -> bool {
        self.inner.pending.resolve(response)
    }

    /// Registers a new satellite context and returns its channel ends.
    #[must_use]
    pub fn attach(&self) -> SatelliteLink {
        let (handle, inbox) = self.inner.contexts.register(&self.inner.config.connection);
        info!(context = %handle.id, "satellite attached");
        SatelliteLink {
            broker: BrokerLink::new(handle.id, self.inner.inbox_tx.clone()),
            inbox,
        }
    }

    /// Forgets `context` and abandons every call waiting on it.
    ///
    /// Registry entries naming the context are kept; calls to them resolve
    /// as unreachable. Returns the number of abandoned calls.
    pub fn detach(&self, context: ContextId) -> usize {
        if let Some(handle) = self.inner.contexts.remove(context) {
            // The satellite may have stopped listening already.
            let _ = handle.try_send(OutboundMessage::Close(Some("detached".to_string())));
        }
        let abandoned = self.inner.pending.abandon_target(context);
        info!(context = %context, abandoned, "satellite detached");
        abandoned
    }

    /// Starts the loop processing frames from satellites.
    ///
    /// # Errors
    ///
    /// Fails if the broker was already started.
    pub fn start(&self) -> anyhow::Result<JoinHandle<()>> {
        let Some(inbox) = self.inner.inbox_rx.lock().take() else {
            bail!("broker already started");
        };
        self.inner.lifecycle.set_ready();
        let shutdown = self.inner.lifecycle.shutdown_receiver();
        info!(prefix = self.inner.ids.prefix(), "broker started");
        Ok(tokio::spawn(run_inbound_loop(self.clone(), inbox, shutdown)))
    }

    /// Starts the broker and runs until it is shut down.
    ///
    /// # Errors
    ///
    /// Fails if the broker was already started or its loop panicked.
    pub async fn serve(&self) -> anyhow::Result<()> {
        self.start()?.await?;
        Ok(())
    }

    /// Stops accepting calls, waits up to `drain_timeout` for in-flight calls,
    /// abandons whatever is left and closes every satellite.
    ///
    /// Returns `true` when every call finished on its own.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        let inner = &self.inner;
        info!(in_flight = inner.lifecycle.in_flight_count(), "broker draining");
        inner.lifecycle.trigger_shutdown();

        let drained = inner.lifecycle.wait_for_drain(drain_timeout).await;
        let abandoned = inner.pending.abandon_all();

        let satellites = inner.contexts.drain_all();
        for handle in &satellites {
            let _ = handle.try_send(OutboundMessage::Close(Some("broker shutting down".to_string())));
        }
        inner.lifecycle.mark_stopped();
        info!(
            drained,
            abandoned,
            satellites = satellites.len(),
            "broker stopped"
        );
        drained
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.inner.lifecycle.phase()
    }

    #[must_use]
    pub fn owner_of(&self, name: &str) -> Option<Owner> {
        self.inner.registry.owner(name)
    }

    /// Every registered operation with its owner, sorted by name.
    #[must_use]
    pub fn operations(&self) -> Vec<(String, Owner)> {
        self.inner.registry.entries()
    }

    /// Number of forwarded calls awaiting an answer.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Ids of the attached satellites, sorted.
    #[must_use]
    pub fn satellites(&self) -> Vec<ContextId> {
        self.inner.contexts.ids()
    }

    #[cfg(test)]
    pub(crate) fn handlers(&self) -> &HandlerTable {
        &self.inner.handlers
    }

    pub(crate) fn contexts(&self) -> &ContextRegistry {
        &self.inner.contexts
    }

    #[cfg(test)]
    pub(crate) fn inbox_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inner.inbox_tx.clone()
    }
}

#[async_trait]
impl Dispatcher for Broker {
    fn context_id(&self) -> ContextId {
        ContextId::BROKER
    }

    fn register_handler(&self, name: &str, handler: Handler) -> Result<(), CallError> {
        validate_operation_name(name)?;
        self.inner.handlers.insert(name, handler);
        self.register_local_owner(name);
        debug!(operation = name, "local handler registered");
        Ok(())
    }

    fn get_handler(&self, name: &str) -> Option<Handler> {
        self.inner.handlers.get(name)
    }

    fn remove_handler(&self, name: &str) -> Option<Handler> {
        self.inner.handlers.remove(name)
    }

    async fn invoke(&self, name: &str, params: Option<Value>) -> CallResult {
        self.route(name, params).await
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("phase", &self.phase())
            .field("operations", &self.inner.registry.len())
            .field("satellites", &self.inner.contexts.count())
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}
