//! datamux channels arbitrarily sized byte buffers over a message
//! transport whose per-message payload is bounded.
//!
//! A [`Multiplexer`] on each end of a bidirectional frame transport turns
//! "send these bytes" into a pull-based exchange: the sender registers the
//! buffer and announces it, the receiver queries the size and pulls the
//! buffer in fixed 1024-byte slices, and once the last slice is committed
//! the announce is acknowledged and the reassembled buffer is handed to the
//! consumer.
//!
//! ## Wire protocol
//!
//! JSON-RPC 2.0 requests over caller-supplied frame delivery:
//!
//! ```text
//!   sender                                receiver
//!     │ ── "n"   { id }              ──►    │   announce new buffer
//!     │ ◄── "gbi" { id }             ──     │   query size
//!     │ ──        { s }              ──►    │
//!     │ ◄── "gbs" { id, start, end } ──     │   pull slices, in order
//!     │ ──        { data: base64 }   ──►    │       (repeat)
//!     │ ◄──       ack for "n"        ──     │   after final commit
//! ```
//!
//! Slice payloads are base64 (standard alphabet, no padding).  Frames enter
//! through [`Multiplexer::push_message_from_outside`] and leave through the
//! outbound callback installed at build time; the multiplexer never touches
//! a socket itself.

pub mod buffer;
pub mod errors;
pub mod mux;
pub mod proto;
pub mod registry;
pub mod rpc;
mod transfer;

pub use buffer::{BufferWrapper, MemoryDestination, ReadSeek, WriteSeek};
pub use errors::{MuxError, MuxResult};
pub use mux::{
    Multiplexer, MultiplexerBuilder, ProvideDestinationFn, PushToOutsideFn, REQUEST_TIMEOUT,
    TransferCompleteFn,
};
pub use registry::BufferRegistry;
pub use rpc::{Request, Response, RpcErrorData};
