//! `xpc` core: payload values, correlation ids, call envelopes and wire frames.
//!
//! Everything in this crate is shared by the broker context and by every
//! satellite context. Nothing here performs I/O.

pub mod envelope;
pub mod id;
pub mod names;
pub mod protocol;
pub mod types;

pub use envelope::CallEnvelope;
pub use id::{CorrelationId, IdGenerator};
pub use names::{operation_name, validate_operation_name, NameError};
pub use protocol::{decode_frame, encode_frame, CodecError, Frame};
pub use types::Value;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
