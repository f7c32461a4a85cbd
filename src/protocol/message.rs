//! Typed protocol messages.
//!
//! Messages are closed sum types per direction. Every frame starts with a
//! one-byte tag naming its [`ClientMessageType`] or [`ServerMessageType`].
//! Payload-bearing fields stay as raw [`Bytes`]: the payload format owns
//! their contents.

use bytes::Bytes;

use crate::error::{CallwireError, Result};

/// Tags of frames sent by the call issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientMessageType {
    Rpc = 10,
    RpcAbort = 11,
    RpcPull = 12,
    ClientStreamPush = 20,
    ClientStreamEnd = 21,
    ClientStreamAbort = 22,
    ServerStreamAbort = 23,
    ServerStreamPull = 24,
    Ping = 30,
    Pong = 31,
}

impl TryFrom<u8> for ClientMessageType {
    type Error = CallwireError;

    fn try_from(tag: u8) -> Result<Self> {
        Ok(match tag {
            10 => Self::Rpc,
            11 => Self::RpcAbort,
            12 => Self::RpcPull,
            20 => Self::ClientStreamPush,
            21 => Self::ClientStreamEnd,
            22 => Self::ClientStreamAbort,
            23 => Self::ServerStreamAbort,
            24 => Self::ServerStreamPull,
            30 => Self::Ping,
            31 => Self::Pong,
            other => {
                return Err(CallwireError::Framing(format!(
                    "Unknown client message type: {other}"
                )))
            }
        })
    }
}

/// Tags of frames sent by the call server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerMessageType {
    RpcResponse = 10,
    RpcStreamResponse = 11,
    RpcStreamChunk = 12,
    RpcStreamEnd = 13,
    RpcStreamAbort = 14,
    ServerStreamPush = 20,
    ServerStreamEnd = 21,
    ServerStreamAbort = 22,
    ClientStreamAbort = 23,
    ClientStreamPull = 24,
    Ping = 30,
    Pong = 31,
}

impl TryFrom<u8> for ServerMessageType {
    type Error = CallwireError;

    fn try_from(tag: u8) -> Result<Self> {
        Ok(match tag {
            10 => Self::RpcResponse,
            11 => Self::RpcStreamResponse,
            12 => Self::RpcStreamChunk,
            13 => Self::RpcStreamEnd,
            14 => Self::RpcStreamAbort,
            20 => Self::ServerStreamPush,
            21 => Self::ServerStreamEnd,
            22 => Self::ServerStreamAbort,
            23 => Self::ClientStreamAbort,
            24 => Self::ClientStreamPull,
            30 => Self::Ping,
            31 => Self::Pong,
            other => {
                return Err(CallwireError::Framing(format!(
                    "Unknown server message type: {other}"
                )))
            }
        })
    }
}

/// Frames sent by the call issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Invoke `procedure`; `payload` is an RPC-encoded value.
    Rpc {
        call_id: u32,
        procedure: String,
        payload: Bytes,
    },
    /// Cancel a call or its streaming result.
    ///
    /// Abort reasons travel as trailing text; `Some("")` decodes as `None`.
    RpcAbort {
        call_id: u32,
        reason: Option<String>,
    },
    /// Grant one credit for the next streaming-result chunk.
    RpcPull { call_id: u32 },
    /// Upload bytes in answer to a `ClientStreamPull`.
    ClientStreamPush { stream_id: u32, chunk: Bytes },
    ClientStreamEnd { stream_id: u32 },
    ClientStreamAbort {
        stream_id: u32,
        reason: Option<String>,
    },
    /// Give up on a download.
    ServerStreamAbort {
        stream_id: u32,
        reason: Option<String>,
    },
    /// Ask for up to `size` more download bytes.
    ServerStreamPull { stream_id: u32, size: u32 },
    Ping { nonce: u32 },
    Pong { nonce: u32 },
}

impl ClientMessage {
    pub fn message_type(&self) -> ClientMessageType {
        match self {
            ClientMessage::Rpc { .. } => ClientMessageType::Rpc,
            ClientMessage::RpcAbort { .. } => ClientMessageType::RpcAbort,
            ClientMessage::RpcPull { .. } => ClientMessageType::RpcPull,
            ClientMessage::ClientStreamPush { .. } => ClientMessageType::ClientStreamPush,
            ClientMessage::ClientStreamEnd { .. } => ClientMessageType::ClientStreamEnd,
            ClientMessage::ClientStreamAbort { .. } => ClientMessageType::ClientStreamAbort,
            ClientMessage::ServerStreamAbort { .. } => ClientMessageType::ServerStreamAbort,
            ClientMessage::ServerStreamPull { .. } => ClientMessageType::ServerStreamPull,
            ClientMessage::Ping { .. } => ClientMessageType::Ping,
            ClientMessage::Pong { .. } => ClientMessageType::Pong,
        }
    }
}

/// Body of a plain response: result or error, both format-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Ok(Bytes),
    Err(Bytes),
}

impl ResponseBody {
    pub fn is_error(&self) -> bool {
        matches!(self, ResponseBody::Err(_))
    }
}

/// Frames sent by the call server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    RpcResponse { call_id: u32, body: ResponseBody },
    /// Streaming result opened, or refused when `error` is present.
    RpcStreamResponse {
        call_id: u32,
        error: Option<Bytes>,
    },
    RpcStreamChunk { call_id: u32, chunk: Bytes },
    RpcStreamEnd { call_id: u32 },
    RpcStreamAbort {
        call_id: u32,
        reason: Option<String>,
    },
    ServerStreamPush { stream_id: u32, chunk: Bytes },
    ServerStreamEnd { stream_id: u32 },
    ServerStreamAbort {
        stream_id: u32,
        reason: Option<String>,
    },
    /// The server gives up on an upload.
    ClientStreamAbort {
        stream_id: u32,
        reason: Option<String>,
    },
    /// Ask for up to `size` more upload bytes.
    ClientStreamPull { stream_id: u32, size: u32 },
    Ping { nonce: u32 },
    Pong { nonce: u32 },
}

impl ServerMessage {
    pub fn message_type(&self) -> ServerMessageType {
        match self {
            ServerMessage::RpcResponse { .. } => ServerMessageType::RpcResponse,
            ServerMessage::RpcStreamResponse { .. } => ServerMessageType::RpcStreamResponse,
            ServerMessage::RpcStreamChunk { .. } => ServerMessageType::RpcStreamChunk,
            ServerMessage::RpcStreamEnd { .. } => ServerMessageType::RpcStreamEnd,
            ServerMessage::RpcStreamAbort { .. } => ServerMessageType::RpcStreamAbort,
            ServerMessage::ServerStreamPush { .. } => ServerMessageType::ServerStreamPush,
            ServerMessage::ServerStreamEnd { .. } => ServerMessageType::ServerStreamEnd,
            ServerMessage::ServerStreamAbort { .. } => ServerMessageType::ServerStreamAbort,
            ServerMessage::ClientStreamAbort { .. } => ServerMessageType::ClientStreamAbort,
            ServerMessage::ClientStreamPull { .. } => ServerMessageType::ClientStreamPull,
            ServerMessage::Ping { .. } => ServerMessageType::Ping,
            ServerMessage::Pong { .. } => ServerMessageType::Pong,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_tags_round_trip() {
        for tag in 0..=u8::MAX {
            if let Ok(kind) = ClientMessageType::try_from(tag) {
                assert_eq!(kind as u8, tag);
            }
        }
        assert_eq!(ClientMessageType::try_from(10).unwrap(), ClientMessageType::Rpc);
    }

    #[test]
    fn test_server_tags_round_trip() {
        for tag in 0..=u8::MAX {
            if let Ok(kind) = ServerMessageType::try_from(tag) {
                assert_eq!(kind as u8, tag);
            }
        }
    }

    #[test]
    fn test_unknown_tag_is_framing_error() {
        assert!(matches!(
            ClientMessageType::try_from(99),
            Err(CallwireError::Framing(_))
        ));
        assert!(matches!(
            ServerMessageType::try_from(0),
            Err(CallwireError::Framing(_))
        ));
    }

    #[test]
    fn test_message_type_accessor() {
        let msg = ClientMessage::ServerStreamPull {
            stream_id: 1,
            size: 10,
        };
        assert_eq!(msg.message_type(), ClientMessageType::ServerStreamPull);

        let msg = ServerMessage::RpcResponse {
            call_id: 1,
            body: ResponseBody::Err(Bytes::new()),
        };
        assert_eq!(msg.message_type(), ServerMessageType::RpcResponse);
    }
}
