//! Per-call context handed to procedures.
//!
//! Procedures do not write frames themselves: they return a
//! [`CallOutcome`] and the connection engine turns it into responses,
//! streaming chunks and blob streams. The context carries what a procedure
//! needs to know about the call it is serving:
//!
//! - which connection and call id it belongs to
//! - a [`CancelSignal`] fired on client abort or connection close
//!
//! # Example
//!
//! ```ignore
//! async fn slow(payload: IncomingValue, ctx: CallContext) -> Result<OutgoingValue, ProtocolError> {
//!     tokio::select! {
//!         _ = ctx.cancelled() => Ok(Value::null()),
//!         _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(json!({ "done": true }).into()),
//!     }
//! }
//! ```

use std::sync::Arc;

use futures_util::stream::BoxStream;

use crate::cancel::CancelSignal;
use crate::error::ProtocolError;
use crate::value::{IncomingValue, OutgoingValue};

/// Lazily produced items of a streaming result.
pub type ResultStream = BoxStream<'static, Result<serde_json::Value, ProtocolError>>;

/// Context of one executing call.
#[derive(Debug, Clone)]
pub struct CallContext {
    connection_id: Arc<str>,
    call_id: u32,
    signal: CancelSignal,
}

impl CallContext {
    pub fn new(connection_id: impl Into<Arc<str>>, call_id: u32, signal: CancelSignal) -> Self {
        Self {
            connection_id: connection_id.into(),
            call_id,
            signal,
        }
    }

    #[inline]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[inline]
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Signal fired when the call is aborted.
    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Resolves once the call is aborted.
    pub async fn cancelled(&self) {
        self.signal.cancelled().await
    }
}

/// A decoded call ready for dispatch.
#[derive(Debug)]
pub struct CallRequest {
    pub procedure: String,
    pub payload: IncomingValue,
    pub context: CallContext,
}

/// What a procedure produced.
pub enum CallOutcome {
    /// One value, possibly carrying blobs to download.
    Plain(OutgoingValue),
    /// A pull-gated sequence of plain items.
    Stream(ResultStream),
}

impl CallOutcome {
    pub fn is_stream(&self) -> bool {
        matches!(self, CallOutcome::Stream(_))
    }
}

impl From<OutgoingValue> for CallOutcome {
    fn from(value: OutgoingValue) -> Self {
        CallOutcome::Plain(value)
    }
}

impl From<serde_json::Value> for CallOutcome {
    fn from(value: serde_json::Value) -> Self {
        CallOutcome::Plain(value.into())
    }
}

impl std::fmt::Debug for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallOutcome::Plain(value) => f.debug_tuple("Plain").field(value).finish(),
            CallOutcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
