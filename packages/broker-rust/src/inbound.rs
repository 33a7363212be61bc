//! Frames arriving at the broker from satellites.
//!
//! The inbound loop decodes each message, classifies the frame by the
//! direction it is allowed to travel in, and applies it to the broker.
//! `Exec` requests are routed on their own task so a slow operation never
//! blocks the loop (and never blocks the `Finish` frame that would complete
//! it).

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use xpc_core::{decode_frame, encode_frame, validate_operation_name, CallEnvelope, Frame, NameError};

use crate::broker::Broker;
use crate::service::CallerOrigin;
use crate::transport::{ContextId, InboundMessage, OutboundMessage, Phase};

/// A frame a satellite is allowed to send, tagged with its sender.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Register { from: ContextId, operation_name: String },
    Exec { from: ContextId, request: CallEnvelope },
    Finish(CallEnvelope),
    Detach(ContextId),
}

/// Frames the broker refuses to act on.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ClassifyError {
    /// Broker-to-satellite frames (`Call`, `ExecReply`) sent the wrong way.
    #[error("{kind} frame is only sent by the broker")]
    WrongDirection { kind: &'static str },
    #[error("invalid registration: {0}")]
    InvalidName(#[from] NameError),
}

/// Classifies a decoded frame sent by `from`.
///
/// # Errors
///
/// Returns `ClassifyError::WrongDirection` for frames only the broker sends,
/// and `ClassifyError::InvalidName` for registrations of reserved or empty
/// names.
pub fn classify(from: ContextId, frame: Frame) -> Result<InboundFrame, ClassifyError> {
    match frame {
        Frame::Register { operation_name } => {
            validate_operation_name(&operation_name)?;
            Ok(InboundFrame::Register {
                from,
                operation_name,
            })
        }
        Frame::Exec(request) => Ok(InboundFrame::Exec { from, request }),
        Frame::Finish(response) => Ok(InboundFrame::Finish(response)),
        Frame::Detach => Ok(InboundFrame::Detach(from)),
        frame @ (Frame::Call(_) | Frame::ExecReply(_)) => Err(ClassifyError::WrongDirection {
            kind: frame.kind(),
        }),
    }
}

/// Drains the broker's inbox until the broker stops.
///
/// Keeps processing through `Draining` so outstanding forwarded calls can
/// still receive their `Finish` frames.
pub(crate) async fn run_inbound_loop(
    broker: Broker,
    mut inbox: mpsc::Receiver<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            msg = inbox.recv() => {
                let Some(msg) = msg else { break };
                handle_message(&broker, msg);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || broker.phase() == Phase::Stopped {
                    break;
                }
            }
        }
    }
    debug!("inbound loop stopped");
}

fn handle_message(broker: &Broker, msg: InboundMessage) {
    let frame = match decode_frame(&msg.bytes) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(from = %msg.from, error = %e, "dropping undecodable frame");
            return;
        }
    };
    debug!(from = %msg.from, kind = frame.kind(), channel = frame.channel(), "inbound frame");

    match classify(msg.from, frame) {
        Ok(InboundFrame::Register {
            from,
            operation_name,
        }) => broker.register_remote_owner(&operation_name, from),
        Ok(InboundFrame::Exec { from, request }) => {
            tokio::spawn(exec_and_reply(broker.clone(), from, request));
        }
        Ok(InboundFrame::Finish(response)) => {
            broker.on_response_received(response);
        }
        Ok(InboundFrame::Detach(from)) => {
            broker.detach(from);
        }
        Err(e) => warn!(from = %msg.from, error = %e, "rejected inbound frame"),
    }
}

/// Routes a satellite's call and sends the `ExecReply`.
async fn exec_and_reply(broker: Broker, from: ContextId, request: CallEnvelope) {
    let outcome = broker
        .route_as(
            CallerOrigin::Satellite(from),
            &request.operation_name,
            request.params.clone(),
        )
        .await;
    let reply = match outcome {
        Ok(result) => request.into_response(result),
        Err(e) => request.into_failure(e.to_string()),
    };
    let call_id = reply.id.clone();

    let bytes = match encode_frame(&Frame::ExecReply(reply)) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(call_id = %call_id, error = %e, "failed to encode exec reply");
            return;
        }
    };
    let Some(handle) = broker.contexts().get_connected(from) else {
        debug!(call_id = %call_id, context = %from, "caller gone before exec reply");
        return;
    };
    if let Err(e) = handle
        .send_timeout(OutboundMessage::Binary(bytes), broker.config().connection.send_timeout)
        .await
    {
        warn!(call_id = %call_id, context = %from, error = %e, "failed to deliver exec reply");
    }
}
