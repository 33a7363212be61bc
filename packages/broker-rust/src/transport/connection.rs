//! Context handles and the broker's registry of attached satellites.
//!
//! Each satellite gets a bounded mpsc channel for backpressure; the broker
//! holds the sender end in a [`ContextHandle`], the satellite's listener loop
//! holds the receiver. Handles are tracked in a `DashMap` so routing tasks
//! can look them up concurrently.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ConnectionConfig;

/// Identifier of a context, assigned by the broker's registry.
///
/// `ContextId::BROKER` (0) is the broker context itself; satellites are
/// numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl ContextId {
    /// The broker's own context.
    pub const BROKER: ContextId = ContextId(0);

    #[must_use]
    pub fn is_broker(self) -> bool {
        self == Self::BROKER
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Message to be delivered to a context.
#[derive(Debug)]
pub enum OutboundMessage {
    /// An encoded frame (`MsgPack`).
    Binary(Vec<u8>),
    /// Asks the receiving context to stop listening, with an optional reason.
    Close(Option<String>),
}

/// Error returned when delivering a message to a context fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The channel stayed full for the whole timeout.
    #[error("send timed out")]
    Timeout,
    /// The receiving context is gone; its receiver was dropped.
    #[error("context disconnected")]
    Disconnected,
    /// The channel is full (non-blocking `try_send` only).
    #[error("channel full")]
    Full,
}

/// Broker-side handle to one satellite context.
#[derive(Debug)]
pub struct ContextHandle {
    /// Identifier assigned by the registry.
    pub id: ContextId,
    /// Sender end of the bounded channel drained by the satellite.
    pub tx: mpsc::Sender<OutboundMessage>,
    /// When the satellite attached.
    pub attached_at: Instant,
}

impl ContextHandle {
    /// Attempts to enqueue a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Full` when the channel is at capacity and
    /// `SendError::Disconnected` when the satellite stopped listening.
    pub fn try_send(&self, msg: OutboundMessage) -> Result<(), SendError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Sends a message, waiting at most `timeout` for channel capacity.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Timeout` if the channel remains full for the
    /// entire timeout, `SendError::Disconnected` if the satellite is gone.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Whether the satellite is still listening.
    ///
    /// Returns `false` once the satellite's listener loop has dropped the
    /// receiver (clean stop or crash of its task).
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Thread-safe registry of attached satellites.
#[derive(Debug)]
pub struct ContextRegistry {
    contexts: DashMap<ContextId, Arc<ContextHandle>>,
    next_id: AtomicU64,
}

impl ContextRegistry {
    /// Creates an empty registry. Ids start at 1; 0 is the broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            contexts: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new satellite, returning its handle and the receiver
    /// its listener loop must drain.
    pub fn register(
        &self,
        config: &ConnectionConfig,
    ) -> (Arc<ContextHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity.max(1));

        let handle = Arc::new(ContextHandle {
            id,
            tx,
            attached_at: Instant::now(),
        });

        self.contexts.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    /// Removes a satellite, returning its handle if it was attached.
    pub fn remove(&self, id: ContextId) -> Option<Arc<ContextHandle>> {
        self.contexts.remove(&id).map(|(_, handle)| handle)
    }

    /// Looks up a satellite by id.
    pub fn get(&self, id: ContextId) -> Option<Arc<ContextHandle>> {
        self.contexts.get(&id).map(|r| r.value().clone())
    }

    /// Looks up a satellite that is still listening.
    pub fn get_connected(&self, id: ContextId) -> Option<Arc<ContextHandle>> {
        self.get(id).filter(|handle| handle.is_connected())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.contexts.len()
    }

    /// Returns the ids of all attached satellites, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.contexts.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Removes and returns all satellites. Used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ContextHandle>> {
        let keys: Vec<ContextId> = self.contexts.iter().map(|entry| *entry.key()).collect();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.contexts.remove(&key) {
                handles.push(handle);
            }
        }
        handles
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_channel_config() -> ConnectionConfig {
        ConnectionConfig {
            outbound_channel_capacity: 2,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn ids_start_at_one() {
        let registry = ContextRegistry::new();
        let config = ConnectionConfig::default();

        let (h1, _rx1) = registry.register(&config);
        let (h2, _rx2) = registry.register(&config);

        assert_eq!(h1.id, ContextId(1));
        assert_eq!(h2.id, ContextId(2));
        assert!(!h1.id.is_broker());
        assert!(ContextId::BROKER.is_broker());
        assert_eq!(registry.ids(), vec![ContextId(1), ContextId(2)]);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let registry = ContextRegistry::new();
        let (handle, mut rx) = registry.register(&ConnectionConfig {
            outbound_channel_capacity: 0,
            ..ConnectionConfig::default()
        });

        assert!(handle.try_send(OutboundMessage::Close(None)).is_ok());
        assert!(matches!(rx.try_recv(), Ok(OutboundMessage::Close(None))));
    }

    #[test]
    fn remove_and_get() {
        let registry = ContextRegistry::new();
        let (handle, _rx) = registry.register(&ConnectionConfig::default());
        let id = handle.id;

        assert_eq!(registry.get(id).unwrap().id, id);
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.get(id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn dropped_receiver_means_disconnected() {
        let registry = ContextRegistry::new();
        let (handle, rx) = registry.register(&ConnectionConfig::default());

        assert!(handle.is_connected());
        assert!(registry.get_connected(handle.id).is_some());

        drop(rx);
        assert!(!handle.is_connected());
        assert!(registry.get_connected(handle.id).is_none());
        assert_eq!(
            handle.try_send(OutboundMessage::Binary(vec![1])),
            Err(SendError::Disconnected)
        );
    }

    #[test]
    fn try_send_full() {
        let registry = ContextRegistry::new();
        let (handle, _rx) = registry.register(&small_channel_config());

        assert!(handle.try_send(OutboundMessage::Binary(vec![1])).is_ok());
        assert!(handle.try_send(OutboundMessage::Binary(vec![2])).is_ok());
        assert_eq!(
            handle.try_send(OutboundMessage::Binary(vec![3])),
            Err(SendError::Full)
        );
    }

    #[tokio::test]
    async fn send_timeout_on_full_channel() {
        let registry = ContextRegistry::new();
        let (handle, _rx) = registry.register(&small_channel_config());
        handle.try_send(OutboundMessage::Binary(vec![1])).unwrap();
        handle.try_send(OutboundMessage::Binary(vec![2])).unwrap();

        let result = handle
            .send_timeout(OutboundMessage::Binary(vec![3]), Duration::from_millis(20))
            .await;
        assert_eq!(result, Err(SendError::Timeout));
    }

    #[tokio::test]
    async fn send_timeout_disconnected() {
        let registry = ContextRegistry::new();
        let (handle, rx) = registry.register(&ConnectionConfig::default());
        drop(rx);

        let result = handle
            .send_timeout(OutboundMessage::Close(None), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(SendError::Disconnected));
    }

    #[test]
    fn drain_all_empties_registry() {
        let registry = ContextRegistry::new();
        let config = ConnectionConfig::default();
        let (_h1, _rx1) = registry.register(&config);
        let (_h2, _rx2) = registry.register(&config);

        assert_eq!(registry.drain_all().len(), 2);
        assert_eq!(registry.count(), 0);
    }
}
