//! Per-invocation session correlation and the bounded-stream / broadcast
//! primitives that back streaming plugin responses.

mod broadcast;
mod registry;
mod stream;

pub use broadcast::{BroadcastReceiver, Broadcaster};
pub use registry::{
    Session, SessionError, SessionRegistry, SessionWriter, INBOUND_CAPACITY, SESSION_TTL,
};
pub use stream::{bounded_stream, BoundedStreamReader, BoundedStreamWriter};
