//! In-process transport between the broker and its satellites: context
//! handles, the satellite link, and the broker lifecycle.

pub mod connection;
pub mod link;
pub mod shutdown;

pub use connection::{ContextHandle, ContextId, ContextRegistry, OutboundMessage, SendError};
pub use link::{BrokerLink, InboundMessage, SatelliteLink};
pub use shutdown::{CallGuard, LifecycleController, Phase};
