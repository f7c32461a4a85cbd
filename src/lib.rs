//! # callwire
//!
//! Connection-oriented RPC core: versioned binary framing, pull-based
//! streaming results and blob transfers, stream timeouts and call-scoped
//! cancellation.
//!
//! ## Architecture
//!
//! - **Protocol**: closed [`ClientMessage`]/[`ServerMessage`] enums and a
//!   [`MessageCodec`] per protocol version
//! - **Payloads**: a [`PayloadFormat`](codec::PayloadFormat) (MessagePack
//!   or JSON, chosen per connection) encodes values whose blobs travel as
//!   separate streams
//! - **Engines**: a [`Gateway`] serves calls through a
//!   [`Dispatcher`](handler::Dispatcher); a [`ClientConnection`] issues them
//!
//! Every stream-shaped flow is pull-driven: a streaming result sends one
//! chunk per `RpcPull`, a blob stream sends one chunk per stream pull.
//!
//! ## Example
//!
//! ```
//! use callwire::handler::ProcedureRegistry;
//! use callwire::{ClientBuilder, Gateway, ProtocolError};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ProtocolError> {
//! let mut procedures = ProcedureRegistry::new();
//! procedures.typed("add", |(a, b): (i64, i64), _ctx| async move {
//!     Ok::<_, ProtocolError>(a + b)
//! });
//!
//! let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//! let gateway = Gateway::builder(procedures).build();
//! tokio::spawn(async move { gateway.serve("conn-1", server_io).await });
//!
//! let client = ClientBuilder::new().connect_stream(client_io);
//! let sum = client.call("add", json!([2, 3])).await?.into_value()?;
//! assert_eq!(sum.as_plain(), Some(&json!(5)));
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod cancel;
pub mod codec;
pub mod error;
pub mod handler;
pub mod ids;
pub mod protocol;
pub mod rpc;
pub mod streams;
pub mod transport;
pub mod value;

mod client;
mod server;

pub use blob::{BlobMetadata, BlobReader, ProtocolBlob};
pub use cancel::CancelSignal;
pub use client::{
    CallOptions, CallResponse, ClientBuilder, ClientConnection, HeartbeatConfig, RpcStream,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT,
};
pub use error::{CallwireError, ErrorCode, ProtocolError, Result};
pub use protocol::{ClientMessage, MessageCodec, ProtocolVersion, ServerMessage};
pub use server::{
    ConnectOptions, Gateway, GatewayBuilder, ServerConnection, DEFAULT_MAX_CONCURRENT_CALLS,
};
pub use value::{IncomingValue, OutgoingValue, Value};
