//! A satellite context: owns some operations, reaches everything else
//! through the broker.
//!
//! The satellite keeps its own handler table and its own pending-call table
//! for the `__xpc_exec__` request/response exchange. A listener task drains
//! the frames the broker sends it:
//!
//! - `Call`: run the local handler on a separate task and answer with a
//!   `Finish` frame carrying the same id
//! - `ExecReply`: resolve the matching entry of the satellite's pending table
//! - `Close`: stop listening

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xpc_core::{decode_frame, validate_operation_name, CallEnvelope, Frame, IdGenerator, Value};

use crate::config::SatelliteConfig;
use crate::service::{CallError, CallResult, Handler, HandlerTable, PendingCallTable};
use crate::traits::Dispatcher;
use crate::transport::{BrokerLink, ContextId, OutboundMessage, SatelliteLink, SendError};

/// Handle to a running satellite context. Cloning is cheap.
///
/// Dropping the last handle stops the listener and detaches from the broker,
/// as [`shutdown`](Self::shutdown) does.
#[derive(Clone)]
pub struct Satellite {
    inner: Arc<SatelliteInner>,
}

struct SatelliteInner {
    state: SatelliteState,
    ids: IdGenerator,
    stop: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    detached: AtomicBool,
}

/// What the listener and forwarded calls need. Holds no reference back to
/// the `Satellite`, so dropping the last handle ends the listener.
#[derive(Clone)]
struct SatelliteState {
    config: SatelliteConfig,
    link: BrokerLink,
    handlers: HandlerTable,
    pending: PendingCallTable,
}

impl Satellite {
    /// Wraps a link obtained from `Broker::attach` and starts listening.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn connect(link: SatelliteLink, config: SatelliteConfig) -> Self {
        let SatelliteLink { broker, inbox } = link;
        let (stop, stop_rx) = watch::channel(false);

        let state = SatelliteState {
            pending: PendingCallTable::new(config.max_pending_calls),
            config,
            link: broker,
            handlers: HandlerTable::new(),
        };
        let handle = tokio::spawn(listen(state.clone(), inbox, stop_rx));

        let satellite = Self {
            inner: Arc::new(SatelliteInner {
                state,
                ids: IdGenerator::with_tag("r"),
                stop,
                listener: Mutex::new(Some(handle)),
                detached: AtomicBool::new(false),
            }),
        };
        info!(context = %satellite.context_id(), "satellite connected");
        satellite
    }

    #[must_use]
    pub fn config(&self) -> &SatelliteConfig {
        &self.inner.state.config
    }

    /// Whether the listener is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .listener
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of calls awaiting the broker's reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.state.pending.len()
    }

    /// Tells the broker this context is leaving and stops the listener.
    ///
    /// Calls the broker was forwarding here are abandoned by the broker;
    /// calls this satellite was waiting on are abandoned locally.
    pub async fn shutdown(&self) {
        self.inner.detach();

        let handle = self.inner.listener.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(context = %self.context_id(), error = %e, "satellite listener failed");
            }
        }
    }

    /// One `__xpc_exec__` round trip without the failure policy applied.
    async fn exec(&self, name: &str, params: Option<Value>) -> CallResult {
        // Without a listener the reply could never be received.
        if !self.is_running() {
            return Err(CallError::Send(SendError::Disconnected));
        }
        let state = &self.inner.state;
        let request = CallEnvelope::request(self.inner.ids.next_id(), name, params);
        let waiter = state.pending.register(&request, ContextId::BROKER)?;
        state
            .link
            .send_frame(&Frame::Exec(request), state.config.send_timeout)
            .await?;

        let Some(deadline) = state.config.call_timeout else {
            return waiter.wait().await;
        };
        match tokio::time::timeout(deadline, waiter.wait()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(CallError::Timeout {
                name: name.to_string(),
                timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl SatelliteInner {
    /// Sends `Detach` once and stops the listener.
    fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        let context = self.state.link.context_id();
        if let Err(e) = self.state.link.post_frame(&Frame::Detach) {
            debug!(context = %context, error = %e, "detach not delivered");
        }
        let _ = self.stop.send(true);
    }
}

impl Drop for SatelliteInner {
    fn drop(&mut self) {
        self.detach();
    }
}

impl SatelliteState {
    fn context_id(&self) -> ContextId {
        self.link.context_id()
    }

    fn on_frame(&self, bytes: &[u8]) {
        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(context = %self.context_id(), error = %e, "dropping undecodable frame");
                return;
            }
        };
        debug!(context = %self.context_id(), kind = frame.kind(), channel = frame.channel(), "frame from broker");

        match frame {
            Frame::Call(request) => {
                tokio::spawn(self.clone().execute_forwarded(request));
            }
            Frame::ExecReply(response) => {
                self.pending.resolve(response);
            }
            other => {
                warn!(context = %self.context_id(), kind = other.kind(), "unexpected frame from broker");
            }
        }
    }

    /// Runs a forwarded call and answers with a `Finish` frame.
    async fn execute_forwarded(self, request: CallEnvelope) {
        let outcome = self
            .handlers
            .execute(&request.operation_name, request.params.clone())
            .await;
        let response = match self.config.failure_policy.apply(&request.operation_name, outcome) {
            Ok(result) => request.into_response(result),
            Err(e) => request.into_failure(e.to_string()),
        };

        if let Err(e) = self
            .link
            .send_frame(&Frame::Finish(response), self.config.send_timeout)
            .await
        {
            warn!(context = %self.context_id(), error = %e, "failed to send finish frame");
        }
    }
}

async fn listen(
    state: SatelliteState,
    mut inbox: mpsc::Receiver<OutboundMessage>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            msg = inbox.recv() => match msg {
                Some(OutboundMessage::Binary(bytes)) => state.on_frame(&bytes),
                Some(OutboundMessage::Close(reason)) => {
                    info!(context = %state.context_id(), reason = reason.as_deref().unwrap_or(""), "closed by broker");
                    break;
                }
                None => break,
            },
            _ = stop.changed() => break,
        }
    }

    let abandoned = state.pending.abandon_all();
    debug!(context = %state.context_id(), abandoned, "satellite listener stopped");
}

#[async_trait]
impl Dispatcher for Satellite {
    fn context_id(&self) -> ContextId {
        self.inner.state.context_id()
    }

    /// Stores the handler and announces it to the broker without waiting.
    ///
    /// A busy broker inbox delays the announcement rather than failing it.
    fn register_handler(&self, name: &str, handler: Handler) -> Result<(), CallError> {
        validate_operation_name(name)?;
        let state = &self.inner.state;
        let previous = state.handlers.insert(name, handler);

        let announce = Frame::Register {
            operation_name: name.to_string(),
        };
        if let Err(e) = state.link.post_frame(&announce) {
            // Leave the table as it was: the broker never learned about it.
            match previous {
                Some(previous) => {
                    state.handlers.insert(name, previous);
                }
                None => {
                    state.handlers.remove(name);
                }
            }
            return Err(e);
        }
        debug!(context = %self.context_id(), operation = name, "handler registered");
        Ok(())
    }

    fn get_handler(&self, name: &str) -> Option<Handler> {
        self.inner.state.handlers.get(name)
    }

    fn remove_handler(&self, name: &str) -> Option<Handler> {
        self.inner.state.handlers.remove(name)
    }

    async fn invoke(&self, name: &str, params: Option<Value>) -> CallResult {
        let outcome = self.exec(name, params).await;
        self.inner.state.config.failure_policy.apply(name, outcome)
    }
}

impl std::fmt::Debug for Satellite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Satellite")
            .field("context", &self.context_id())
            .field("handlers", &self.inner.state.handlers)
            .field("pending", &self.inner.state.pending.len())
            .finish_non_exhaustive()
    }
}
