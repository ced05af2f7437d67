//! Framed stream codec and backwards-invocation envelope
//! types.

mod codec;
mod envelope;

pub use codec::{
    decode_line, encode_error, encode_heartbeat, encode_log, encode_session, MAX_LINE_LEN,
};
pub use envelope::{BackwardsInvocationRequest, BackwardsInvocationResponse, InvokeKind, ResponseKind};
