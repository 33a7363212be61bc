//! The satellite's side of the in-process transport.
//!
//! All satellites share one bounded inbox into the broker; every message is
//! tagged with the sending context so the broker knows who registered an
//! operation or who is waiting for an `ExecReply`.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;
use xpc_core::{encode_frame, Frame};

use super::connection::{ContextId, OutboundMessage, SendError};
use crate::service::operation::CallError;

/// An encoded frame on its way into the broker.
#[derive(Debug)]
pub struct InboundMessage {
    /// Context that sent the frame.
    pub from: ContextId,
    /// `MsgPack`-encoded [`Frame`].
    pub bytes: Vec<u8>,
}

/// Sender half used by a satellite to reach the broker.
#[derive(Debug, Clone)]
pub struct BrokerLink {
    from: ContextId,
    tx: mpsc::Sender<InboundMessage>,
}

impl BrokerLink {
    #[must_use]
    pub fn new(from: ContextId, tx: mpsc::Sender<InboundMessage>) -> Self {
        Self { from, tx }
    }

    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.from
    }

    /// Whether the broker's inbound loop is still receiving.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Encodes and sends a frame, waiting at most `timeout` for capacity.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Codec` if the frame cannot be encoded and
    /// `CallError::Send` if the broker is gone or its inbox stays full.
    pub async fn send_frame(&self, frame: &Frame, timeout: Duration) -> Result<(), CallError> {
        let msg = InboundMessage {
            from: self.from,
            bytes: encode_frame(frame)?,
        };
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CallError::Send(SendError::Disconnected)),
            Err(_) => Err(CallError::Send(SendError::Timeout)),
        }
    }

    /// Encodes and enqueues a frame without waiting.
    ///
    /// # Errors
    ///
    /// Same as [`send_frame`](Self::send_frame), with `SendError::Full`
    /// instead of a timeout.
    pub fn try_send_frame(&self, frame: &Frame) -> Result<(), CallError> {
        let msg = InboundMessage {
            from: self.from,
            bytes: encode_frame(frame)?,
        };
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CallError::Send(SendError::Full),
            mpsc::error::TrySendError::Closed(_) => CallError::Send(SendError::Disconnected),
        })
    }

    /// Enqueues a frame nobody waits on.
    ///
    /// When the inbox is full the frame is handed to a task that waits for
    /// capacity, so only a closed broker (or a full inbox outside a Tokio
    /// runtime) is an error.
    ///
    /// # Errors
    ///
    /// `CallError::Codec` if the frame cannot be encoded,
    /// `SendError::Disconnected` if the broker is gone and
    /// `SendError::Full` if no runtime is available to wait on.
    pub fn post_frame(&self, frame: &Frame) -> Result<(), CallError> {
        let msg = InboundMessage {
            from: self.from,
            bytes: encode_frame(frame)?,
        };
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let Ok(runtime) = Handle::try_current() else {
                    return Err(CallError::Send(SendError::Full));
                };
                let tx = self.tx.clone();
                let from = self.from;
                let kind = frame.kind();
                runtime.spawn(async move {
                    if tx.send(msg).await.is_err() {
                        debug!(from = %from, kind, "broker gone before queued frame");
                    }
                });
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(CallError::Send(SendError::Disconnected))
            }
        }
    }
}

/// Both channel ends handed to a newly attached satellite.
#[derive(Debug)]
pub struct SatelliteLink {
    /// Frames towards the broker.
    pub broker: BrokerLink,
    /// Frames from the broker, drained by the satellite's listener loop.
    pub inbox: mpsc::Receiver<OutboundMessage>,
}

impl SatelliteLink {
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.broker.context_id()
    }
}

#[cfg(test)]
mod tests {
    use xpc_core::decode_frame;

    use super::*;

    #[tokio::test]
    async fn frames_are_tagged_and_encoded() {
        let (tx, mut rx) = mpsc::channel(4);
        let link = BrokerLink::new(ContextId(7), tx);

        let frame = Frame::Register {
            operation_name: "Echo/ping".to_string(),
        };
        link.send_frame(&frame, Duration::from_secs(1)).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.from, ContextId(7));
        assert_eq!(decode_frame(&msg.bytes).unwrap(), frame);
    }

    #[test]
    fn try_send_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let link = BrokerLink::new(ContextId(1), tx);

        link.try_send_frame(&Frame::Detach).unwrap();
        assert!(matches!(
            link.try_send_frame(&Frame::Detach),
            Err(CallError::Send(SendError::Full))
        ));

        drop(rx);
        assert!(!link.is_connected());
        assert!(matches!(
            link.post_frame(&Frame::Detach),
            Err(CallError::Send(SendError::Disconnected))
        ));
        assert!(matches!(
            link.try_send_frame(&Frame::Detach),
            Err(CallError::Send(SendError::Disconnected))
        ));
    }

    #[tokio::test]
    async fn posted_frames_wait_for_capacity() {
        let (tx, mut rx) = mpsc::channel(1);
        let link = BrokerLink::new(ContextId(2), tx);

        for name in ["A/a", "A/b", "A/c"] {
            link.post_frame(&Frame::Register {
                operation_name: name.to_string(),
            })
            .unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            let msg = rx.recv().await.unwrap();
            let Frame::Register { operation_name } = decode_frame(&msg.bytes).unwrap() else {
                panic!("expected a register frame");
            };
            received.push(operation_name);
        }
        received.sort();
        assert_eq!(received, vec!["A/a", "A/b", "A/c"]);
    }

    #[test]
    fn full_inbox_outside_a_runtime_is_reported() {
        let (tx, _rx) = mpsc::channel(1);
        let link = BrokerLink::new(ContextId(3), tx);
        link.post_frame(&Frame::Detach).unwrap();
        assert!(matches!(
            link.post_frame(&Frame::Detach),
            Err(CallError::Send(SendError::Full))
        ));
    }
}
