//! Error types for callwire.
//!
//! Two layers of errors exist:
//!
//! - [`CallwireError`]: everything that can go wrong locally (I/O, framing,
//!   registry lookups, serialization).
//! - [`ProtocolError`]: the `{code, message, data}` error that travels on the
//!   wire inside a response and rejects only the call that issued it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for all callwire operations.
#[derive(Debug, Error)]
pub enum CallwireError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed frame: unknown tag, truncated field, invalid text.
    ///
    /// Fatal to the connection.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Protocol version byte that this build does not speak.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Content type that matches no registered payload format.
    #[error("Unsupported content type: {0}")]
    UnsupportedFormat(String),

    /// Error reported by the remote side for a single call.
    #[error(transparent)]
    Rpc(#[from] ProtocolError),

    /// Lookup of a blob stream that is not registered.
    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    /// A blob stream with this id is already registered.
    #[error("Stream already registered: {0}")]
    DuplicateStream(u32),

    /// Lookup of a call that is not registered.
    #[error("Call not found: {0}")]
    CallNotFound(u32),

    /// Invalid blob construction or payload value.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Stream or streaming result aborted, with the abort reason.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Connection closed while an operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// No pong arrived within the heartbeat timeout.
    #[error("Heartbeat timeout")]
    HeartbeatTimeout,
}

impl CallwireError {
    /// Whether this error must tear down the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallwireError::Framing(_)
                | CallwireError::UnsupportedVersion(_)
                | CallwireError::UnsupportedFormat(_)
        )
    }
}

/// Result type alias using CallwireError.
pub type Result<T> = std::result::Result<T, CallwireError>;

/// Well-known error codes carried by [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ValidationError,
    BadRequest,
    NotFound,
    Forbidden,
    Unauthorized,
    InternalServerError,
    NotAcceptable,
    RequestTimeout,
    GatewayTimeout,
    ServiceUnavailable,
    ClientRequestError,
    ConnectionError,
}

impl ErrorCode {
    /// Wire name of the code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "ValidationError",
            ErrorCode::BadRequest => "BadRequest",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::Forbidden => "Forbidden",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::InternalServerError => "InternalServerError",
            ErrorCode::NotAcceptable => "NotAcceptable",
            ErrorCode::RequestTimeout => "RequestTimeout",
            ErrorCode::GatewayTimeout => "GatewayTimeout",
            ErrorCode::ServiceUnavailable => "ServiceUnavailable",
            ErrorCode::ClientRequestError => "ClientRequestError",
            ErrorCode::ConnectionError => "ConnectionError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error delivered to the issuer of a call.
///
/// The code is kept as a string so codes unknown to this build still
/// round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ProtocolError {
    /// Create an error with a well-known code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Whether the code matches the given well-known code.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code.as_str()
    }

    /// Convert into a plain value for a payload format.
    pub fn to_value(&self) -> serde_json::Value {
        // Serializing a struct of strings and a Value cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Parse from a plain value, falling back to an internal error
    /// describing the malformed input.
    pub fn from_value(value: serde_json::Value) -> Self {
        match serde_json::from_value::<ProtocolError>(value) {
            Ok(error) => error,
            Err(e) => ProtocolError::new(
                ErrorCode::InternalServerError,
                format!("Malformed error payload: {e}"),
            ),
        }
    }
}

impl From<CallwireError> for ProtocolError {
    fn from(error: CallwireError) -> Self {
        match error {
            CallwireError::Rpc(inner) => inner,
            CallwireError::ConnectionClosed => {
                ProtocolError::new(ErrorCode::ConnectionError, "Connection closed")
            }
            CallwireError::Aborted(reason) => {
                ProtocolError::new(ErrorCode::ClientRequestError, reason)
            }
            other => ProtocolError::new(ErrorCode::InternalServerError, other.to_string()),
        }
    }
}
