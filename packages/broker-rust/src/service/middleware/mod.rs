//! Tower middleware layers for the call pipeline.
//!
//! - [`suppress`]: Failure policy applied to every outcome
//! - [`metrics`]: Call span, counter and duration histogram
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`timeout`]: Per-call deadline enforcement
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod suppress;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_call_pipeline, CallPipeline};
pub use suppress::SuppressLayer;
pub use timeout::TimeoutLayer;
