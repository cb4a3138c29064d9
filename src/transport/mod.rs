//! Wire framing shared by the REST backend and the outbound streaming path.

pub mod sse;

pub use sse::{encode_event, SseDecoder};
