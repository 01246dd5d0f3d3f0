//! Wire transport between the service and its clients.
//!
//! Length-prefixed JSON-RPC 2.0 over TCP. Every connection is authenticated
//! by a handshake frame carrying the bearer token and the expected server
//! identity.
//!
//! # Architecture
//!
//! - **Server**: accepts connections, dispatches unary calls, pumps the event stream
//! - **Client**: one unary connection plus a separate event stream connection
//! - **Protocol**: shared framing, handshake and JSON-RPC types used by both

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{EventStreamConnection, IpcClient};
pub use protocol::{EventStreamAck, EventStreamRequest, IpcRequest, IpcResponse};
pub use server::{IpcDispatch, IpcServer, IpcServerHandle};
