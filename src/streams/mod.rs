//! Blob stream registries and their timeout supervisor.
//!
//! Each connection holds one registry per direction:
//!
//! - [`OutgoingStreams`]: blobs this side produces (client uploads, server
//!   downloads). Every stream gets a paused pump task that reads one chunk
//!   from its source per pull credit.
//! - [`IncomingStreams`]: blobs this side consumes (server-side uploads,
//!   client-side downloads). Pushed chunks are delivered to a
//!   [`BlobReader`](crate::blob::BlobReader).
//!
//! Operations on an unknown stream id are no-ops so that frames racing a
//! teardown are harmless. Only `get` and `add` report missing or duplicate
//! ids as errors.
//!
//! [`StreamTimeouts`] supervises streams with the Consume, Pull and Finish
//! deadlines.

mod incoming;
mod outgoing;
mod timeouts;

pub use incoming::{IncomingStreams, PushOutcome};
pub use outgoing::{OutgoingStreams, StreamEmitter};
pub use timeouts::{
    StreamTimeout, StreamTimeoutConfig, StreamTimeouts, TimeoutHandler, DEFAULT_CONSUME_TIMEOUT,
    DEFAULT_FINISH_TIMEOUT, DEFAULT_PULL_TIMEOUT,
};

/// Lifecycle of a registered stream.
///
/// Terminal states (ended, aborted) remove the stream from its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Registered, no data moved yet.
    Created,
    /// At least one push or pull happened.
    Active,
}
