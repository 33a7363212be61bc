//! Call routing and execution.
//!
//! A call to an operation moves through these pieces:
//!
//! 1. **Registry** (`registry`): operation name -> owning context
//! 2. **Middleware** (`middleware`): Tower layers (policy, metrics, load-shedding, timeout)
//! 3. **Routing** (`router`): run the local handler or forward to the owner
//! 4. **Handlers** (`handler`): locally implemented operations
//! 5. **Pending calls** (`pending`): forwarded calls awaiting their answer

pub mod handler;
pub mod middleware;
pub mod operation;
pub mod pending;
pub mod registry;
pub mod router;

pub use handler::{handler_fn, Handler, HandlerResult, HandlerTable};
pub use middleware::{build_call_pipeline, CallPipeline};
pub use operation::{Call, CallContext, CallError, CallResult, CallerOrigin, FailurePolicy};
pub use pending::{PendingCallTable, Waiter};
pub use registry::{OperationRegistry, Owner};
pub use router::CallRouter;
