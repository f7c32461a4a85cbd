//! Protocol module - binary primitives, typed messages and versioned codecs.
//!
//! This module implements the wire protocol shared by both sides:
//! - Little Endian fixed-width primitives
//! - Closed message enums per direction
//! - One [`MessageCodec`] per protocol version
//!
//! The protocol version is agreed out-of-band when a connection is opened
//! and is not carried in frames.

pub mod binary;
mod message;
mod v1;

use bytes::Bytes;

pub use message::{
    ClientMessage, ClientMessageType, ResponseBody, ServerMessage, ServerMessageType,
};
pub use v1::ProtocolV1;

use crate::error::{CallwireError, Result};

/// Bytes a stream push frame spends before its chunk: tag and stream id.
pub const STREAM_PUSH_HEADER_SIZE: u32 = 5;

/// Supported protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ProtocolVersion {
    #[default]
    V1 = 1,
}

impl ProtocolVersion {
    /// Codec for this version.
    pub fn codec(self) -> &'static dyn MessageCodec {
        match self {
            ProtocolVersion::V1 => &ProtocolV1,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = CallwireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ProtocolVersion::V1),
            other => Err(CallwireError::UnsupportedVersion(other)),
        }
    }
}

/// Typed-message to frame translation for one protocol version.
///
/// `decode_*(encode_*(m)) == m` for every message of the version.
/// Decoding an unknown tag or a truncated frame is a fatal
/// [`CallwireError::Framing`] error.
pub trait MessageCodec: Send + Sync + 'static {
    fn version(&self) -> ProtocolVersion;

    fn encode_client(&self, message: &ClientMessage) -> Result<Bytes>;

    fn decode_client(&self, frame: Bytes) -> Result<ClientMessage>;

    fn encode_server(&self, message: &ServerMessage) -> Result<Bytes>;

    fn decode_server(&self, frame: Bytes) -> Result<ServerMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_byte() {
        assert_eq!(ProtocolVersion::try_from(1).unwrap(), ProtocolVersion::V1);
        assert!(matches!(
            ProtocolVersion::try_from(2),
            Err(CallwireError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_codec_for_version() {
        assert_eq!(ProtocolVersion::V1.codec().version(), ProtocolVersion::V1);
        assert_eq!(ProtocolVersion::default(), ProtocolVersion::V1);
    }
}
