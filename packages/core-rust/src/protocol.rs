//! Wire frames exchanged between a satellite and the broker.
//!
//! Every frame crossing a context boundary is encoded to `MsgPack` with
//! `rmp_serde::to_vec_named()`, so no in-memory value is ever shared between
//! contexts. [`Frame::channel`] names the logical channel a frame travels on:
//! protocol frames use the reserved channels, forwarded calls use the
//! operation name itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::CallEnvelope;
use crate::names::{DETACH_CHANNEL, EXEC_CHANNEL, FINISH_CHANNEL, REGISTER_CHANNEL};

/// One message of the broker protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Frame {
    /// Satellite -> broker: "I serve this operation".
    #[serde(rename_all = "camelCase")]
    Register { operation_name: String },
    /// Satellite -> broker: route this call for me and reply.
    Exec(CallEnvelope),
    /// Broker -> satellite: the answer to an `Exec`.
    ExecReply(CallEnvelope),
    /// Broker -> owning satellite: run this operation.
    Call(CallEnvelope),
    /// Owning satellite -> broker: the answer to a `Call`.
    Finish(CallEnvelope),
    /// Satellite -> broker: the satellite is going away.
    Detach,
}

impl Frame {
    /// The logical channel this frame is delivered on.
    #[must_use]
    pub fn channel(&self) -> &str {
        match self {
            Frame::Register { .. } => REGISTER_CHANNEL,
            Frame::Exec(_) | Frame::ExecReply(_) => EXEC_CHANNEL,
            Frame::Call(envelope) => &envelope.operation_name,
            Frame::Finish(_) => FINISH_CHANNEL,
            Frame::Detach => DETACH_CHANNEL,
        }
    }

    /// Short variant name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "register",
            Frame::Exec(_) => "exec",
            Frame::ExecReply(_) => "exec_reply",
            Frame::Call(_) => "call",
            Frame::Finish(_) => "finish",
            Frame::Detach => "detach",
        }
    }
}

/// Failure to encode or decode a frame.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encodes a frame into `MsgPack` bytes.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(frame)?)
}

/// Decodes a frame from `MsgPack` bytes.
///
/// # Errors
///
/// Returns `CodecError::Decode` for malformed or truncated input.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}
