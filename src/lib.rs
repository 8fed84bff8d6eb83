//! Async WebSocket endpoints (RFC 6455) for the Tokio stack.
//!
//! This crate offers a connection-oriented, streaming implementation: a
//! single [`Connection`] negotiated via [`handshake::accept`] (server side)
//! or [`handshake::dial`] (client side), from which exactly one
//! [`message::MessageReader`] and one [`message::MessageWriter`] may be
//! acquired at a time. Messages are consumed and produced a chunk at a
//! time so callers can bound their own memory use for large payloads,
//! rather than buffering a whole message before handing it to user code.

mod close;
mod codec;
pub mod config;
mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
mod io_util;
mod mask;
pub mod message;
mod ping;
mod read;
mod request;
mod utf8;
mod write;

pub use close::CloseCode;
pub use config::{AcceptOptions, DialOptions, DialResponse, OriginPolicy, WebSocketConfig};
pub use connection::{Connection, Role};
pub use error::{close_status, Error, HandshakeError};
pub use handshake::{accept, dial};
pub use message::{ByteStream, MessageReader, MessageType, MessageWriter, WriteSink};
