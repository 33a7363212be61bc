//! The call envelope exchanged between contexts.
//!
//! Serialized with `#[serde(rename_all = "camelCase")]` so the wire shape is
//! `{ id, operationName, params, result, error }`.

use serde::{Deserialize, Serialize};

use crate::id::CorrelationId;
use crate::types::Value;

/// A call in flight, and later its answer.
///
/// Created by the initiating side and never mutated afterwards, except to
/// attach `result` (and `error`) when the response is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    /// Unique among all envelopes in flight through one broker.
    pub id: CorrelationId,
    /// Name of the operation to run.
    pub operation_name: String,
    /// Input of the operation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Output of the operation. `None` is the "no result" sentinel.
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure description, only set by a context running with the
    /// propagating failure policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallEnvelope {
    /// Builds a request envelope with no result attached.
    #[must_use]
    pub fn request(id: CorrelationId, operation_name: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id,
            operation_name: operation_name.into(),
            params,
            result: None,
            error: None,
        }
    }

    /// Consumes the request and returns the matching response.
    #[must_use]
    pub fn into_response(self, result: Option<Value>) -> Self {
        Self {
            result,
            error: None,
            ..self
        }
    }

    /// Consumes the request and returns a failed response.
    #[must_use]
    pub fn into_failure(self, error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
            ..self
        }
    }
}
