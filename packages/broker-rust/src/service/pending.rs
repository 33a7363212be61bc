//! Calls awaiting a response from another context.
//!
//! Each forwarded call gets a record keyed by its correlation id and a
//! single-use [`Waiter`]. The record's release half is a `oneshot` sender:
//! releasing before anyone waits is not lost, and only the first response
//! for an id can resolve it. Dropping a `Waiter` (timeout, cancellation)
//! removes its record, so abandoned calls never leak entries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use xpc_core::{CallEnvelope, CorrelationId};

use super::operation::{CallError, CallResult};
use crate::transport::ContextId;

/// How a pending call ended.
#[derive(Debug)]
enum Resolution {
    /// The owner answered. `error` is only set by a propagating owner.
    Completed {
        result: Option<xpc_core::Value>,
        error: Option<String>,
    },
    /// The owner went away before answering.
    Abandoned { target: ContextId },
}

#[derive(Debug)]
struct PendingCall {
    operation_name: String,
    target: ContextId,
    created_at: Instant,
    release: oneshot::Sender<Resolution>,
}

/// Per-context table of in-flight calls.
///
/// Cloning is cheap and shares the underlying map.
#[derive(Debug, Clone)]
pub struct PendingCallTable {
    calls: Arc<DashMap<CorrelationId, PendingCall>>,
    /// Serializes the capacity check with the insert; removals only shrink
    /// the map and never take it.
    admission: Arc<Mutex<()>>,
    max_pending: usize,
}

impl PendingCallTable {
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            admission: Arc::new(Mutex::new(())),
            max_pending,
        }
    }

    /// Registers a record for `envelope`, awaiting an answer from `target`.
    ///
    /// # Errors
    ///
    /// Returns `CallError::TooManyPending` when the table is full and
    /// `CallError::DuplicateId` when the id is already in flight.
    pub fn register(&self, envelope: &CallEnvelope, target: ContextId) -> Result<Waiter, CallError> {
        let _admission = self.admission.lock();
        let pending = self.calls.len();
        if pending >= self.max_pending {
            return Err(CallError::TooManyPending {
                limit: self.max_pending,
            });
        }

        let (tx, rx) = oneshot::channel();
        match self.calls.entry(envelope.id.clone()) {
            Entry::Occupied(_) => {
                return Err(CallError::DuplicateId {
                    id: envelope.id.clone(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    operation_name: envelope.operation_name.clone(),
                    target,
                    created_at: Instant::now(),
                    release: tx,
                });
            }
        }
        debug!(
            call_id = %envelope.id,
            operation = %envelope.operation_name,
            target = %target,
            pending = pending + 1,
            "registered pending call"
        );

        Ok(Waiter {
            id: envelope.id.clone(),
            operation_name: envelope.operation_name.clone(),
            calls: Arc::clone(&self.calls),
            rx,
        })
    }

    /// Attaches the response's result to the matching record and releases
    /// its waiter.
    ///
    /// Returns `false` (and does nothing) for unknown or already resolved ids.
    pub fn resolve(&self, response: CallEnvelope) -> bool {
        let Some((_, call)) = self.calls.remove(&response.id) else {
            debug!(call_id = %response.id, "response for unknown call ignored");
            return false;
        };
        debug!(
            call_id = %response.id,
            operation = %call.operation_name,
            elapsed_ms = u64::try_from(call.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "pending call resolved"
        );
        // The waiter may have been dropped in the meantime.
        let _ = call.release.send(Resolution::Completed {
            result: response.result,
            error: response.error,
        });
        true
    }

    /// Releases every call waiting on `target`. Returns how many were released.
    pub fn abandon_target(&self, target: ContextId) -> usize {
        self.abandon_where(|call| call.target == target)
    }

    /// Releases every pending call. Returns how many were released.
    pub fn abandon_all(&self) -> usize {
        self.abandon_where(|_| true)
    }

    fn abandon_where(&self, pred: impl Fn(&PendingCall) -> bool) -> usize {
        let ids: Vec<CorrelationId> = self
            .calls
            .iter()
            .filter(|entry| pred(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut released = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                let _ = call.release.send(Resolution::Abandoned {
                    target: call.target,
                });
                released += 1;
            }
        }
        released
    }

    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.calls.contains_key(id)
    }

    /// Ids of the calls in flight, sorted (for diagnostics).
    #[must_use]
    pub fn ids(&self) -> Vec<CorrelationId> {
        let mut ids: Vec<CorrelationId> = self.calls.iter().map(|e| e.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    /// Age of the oldest call in flight.
    #[must_use]
    pub fn oldest_age(&self) -> Option<Duration> {
        self.calls
            .iter()
            .map(|entry| entry.value().created_at.elapsed())
            .max()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Suspends a caller until its call is resolved or abandoned.
///
/// Single use: [`wait`](Self::wait) consumes it. Dropping it removes the
/// pending record if the call is still outstanding.
#[derive(Debug)]
pub struct Waiter {
    id: CorrelationId,
    operation_name: String,
    calls: Arc<DashMap<CorrelationId, PendingCall>>,
    rx: oneshot::Receiver<Resolution>,
}

impl Waiter {
    #[must_use]
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Waits for the response and returns its result.
    ///
    /// # Errors
    ///
    /// Returns `CallError::HandlerFailed` when the owner reported a failure
    /// and `CallError::Abandoned` when the owner went away.
    pub async fn wait(mut self) -> CallResult {
        match (&mut self.rx).await {
            Ok(Resolution::Completed { result, error: None }) => Ok(result),
            Ok(Resolution::Completed {
                error: Some(reason),
                ..
            }) => Err(CallError::HandlerFailed {
                name: self.operation_name.clone(),
                reason,
            }),
            Ok(Resolution::Abandoned { target }) => Err(CallError::Abandoned {
                name: self.operation_name.clone(),
                context: target,
            }),
            // Release half dropped without an answer: the record was removed
            // by someone else.
            Err(_) => Err(CallError::Abandoned {
                name: self.operation_name.clone(),
                context: ContextId::BROKER,
            }),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.calls.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use xpc_core::Value;

    use super::*;

    fn envelope(id: &str, params: i64) -> CallEnvelope {
        CallEnvelope::request(CorrelationId::new(id), "Math/double", Some(Value::Int(params)))
    }

    #[tokio::test]
    async fn resolve_wakes_waiter_with_result() {
        let table = PendingCallTable::new(16);
        let req = envelope("a-1", 2);
        let waiter = table.register(&req, ContextId(1)).unwrap();

        assert!(table.resolve(req.into_response(Some(Value::Int(4)))));
        assert_eq!(waiter.wait().await.unwrap(), Some(Value::Int(4)));
        assert!(table.is_empty());
    }

    #[test]
    fn capacity_holds_under_concurrent_registration() {
        let table = PendingCallTable::new(8);
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..16)
                        .filter_map(|i| table.register(&envelope(&format!("c-{t}-{i}"), 0), ContextId(1)).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let waiters: Vec<Waiter> = threads
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(waiters.len(), 8);
        assert_eq!(table.len(), 8);
    }

    #[tokio::test]
    async fn release_before_wait_is_not_lost() {
        let table = PendingCallTable::new(16);
        let req = envelope("a-1", 1);
        let waiter = table.register(&req, ContextId(1)).unwrap();

        table.resolve(req.into_response(Some(Value::Bool(true))));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(waiter.wait().await.unwrap(), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_own_waiters() {
        let table = PendingCallTable::new(16);
        let first = envelope("a-1", 10);
        let second = envelope("a-2", 20);
        let w1 = table.register(&first, ContextId(1)).unwrap();
        let w2 = table.register(&second, ContextId(1)).unwrap();

        assert!(table.resolve(second.into_response(Some(Value::Int(40)))));
        assert!(table.resolve(first.into_response(Some(Value::Int(20)))));

        assert_eq!(w2.wait().await.unwrap(), Some(Value::Int(40)));
        assert_eq!(w1.wait().await.unwrap(), Some(Value::Int(20)));
    }

    #[tokio::test]
    async fn unknown_and_duplicate_responses_are_no_ops() {
        let table = PendingCallTable::new(16);
        let req = envelope("a-1", 1);
        let other = envelope("a-2", 2);
        let waiter = table.register(&req, ContextId(1)).unwrap();
        let other_waiter = table.register(&other, ContextId(1)).unwrap();

        assert!(!table.resolve(envelope("zzz-9", 0).into_response(Some(Value::Null))));
        assert!(table.resolve(req.clone().into_response(Some(Value::Int(1)))));
        assert!(!table.resolve(req.into_response(Some(Value::Int(999)))));

        assert_eq!(waiter.wait().await.unwrap(), Some(Value::Int(1)));
        assert!(table.contains(other_waiter.id()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn failure_response_becomes_handler_failed() {
        let table = PendingCallTable::new(16);
        let req = envelope("a-1", 1);
        let waiter = table.register(&req, ContextId(1)).unwrap();

        table.resolve(req.into_failure("division by zero"));
        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(
            err,
            CallError::HandlerFailed { name, reason } if name == "Math/double" && reason == "division by zero"
        ));
    }

    #[test]
    fn duplicate_id_rejected() {
        let table = PendingCallTable::new(16);
        let req = envelope("a-1", 1);
        let _waiter = table.register(&req, ContextId(1)).unwrap();
        assert!(matches!(
            table.register(&req, ContextId(1)),
            Err(CallError::DuplicateId { .. })
        ));
    }

    #[test]
    fn capacity_enforced() {
        let table = PendingCallTable::new(1);
        let _w = table.register(&envelope("a-1", 1), ContextId(1)).unwrap();
        assert!(matches!(
            table.register(&envelope("a-2", 2), ContextId(1)),
            Err(CallError::TooManyPending { limit: 1 })
        ));
    }

    #[test]
    fn dropping_waiter_removes_record() {
        let table = PendingCallTable::new(16);
        let waiter = table.register(&envelope("a-1", 1), ContextId(1)).unwrap();
        assert_eq!(table.len(), 1);
        drop(waiter);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn abandon_target_releases_only_that_context() {
        let table = PendingCallTable::new(16);
        let w1 = table.register(&envelope("a-1", 1), ContextId(1)).unwrap();
        let w2 = table.register(&envelope("a-2", 2), ContextId(2)).unwrap();

        assert_eq!(table.abandon_target(ContextId(1)), 1);
        assert!(matches!(
            w1.wait().await,
            Err(CallError::Abandoned { context: ContextId(1), .. })
        ));
        assert_eq!(table.ids(), vec![CorrelationId::new("a-2")]);

        assert_eq!(table.abandon_all(), 1);
        assert!(w2.wait().await.is_err());
    }
}
