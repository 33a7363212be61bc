//! Configuration types for the broker and satellite contexts.

use std::time::Duration;

use crate::service::operation::FailurePolicy;

/// Broker-level configuration for call routing.
///
/// Controls call deadlines, concurrency limits, failure reporting and the
/// capacity of the channels connecting the broker to its satellites.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Deadline applied to every routed call. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Whether routing failures reach the caller or resolve to "no result".
    pub failure_policy: FailurePolicy,
    /// Maximum number of calls routed at once before new calls are shed.
    pub max_concurrent_calls: u32,
    /// Maximum number of forwarded calls awaiting a response.
    pub max_pending_calls: usize,
    /// Capacity of the shared inbox receiving frames from all satellites.
    /// Values below 1 are treated as 1.
    pub inbox_capacity: usize,
    /// Per-satellite channel settings.
    pub connection: ConnectionConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(30)),
            failure_policy: FailurePolicy::Suppress,
            max_concurrent_calls: 1000,
            max_pending_calls: 1024,
            inbox_capacity: 1024,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Per-satellite configuration controlling backpressure.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for frames sent to one satellite.
    /// Values below 1 are treated as 1.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait when a satellite's channel is full.
    pub send_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration of a satellite context.
#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    /// Deadline for a round trip through the broker. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Failure reporting for calls made from, and executed in, this satellite.
    pub failure_policy: FailurePolicy,
    /// Maximum number of calls awaiting the broker's reply.
    pub max_pending_calls: usize,
    /// Maximum time to wait when the broker's inbox is full.
    pub send_timeout: Duration,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(30)),
            failure_policy: FailurePolicy::Suppress,
            max_pending_calls: 1024,
            send_timeout: Duration::from_secs(5),
        }
    }
}
