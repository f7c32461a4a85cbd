//! Protocol version 1 frame layouts.
//!
//! ```text
//! Rpc                  tag | callId u32 | procLen u16 | procedure | payload..
//! RpcAbort             tag | callId u32 | reason..
//! RpcPull              tag | callId u32
//! RpcResponse          tag | callId u32 | isError u8 | result-or-error..
//! RpcStreamResponse    tag | callId u32 | error..
//! RpcStreamChunk       tag | callId u32 | chunk..
//! RpcStreamEnd         tag | callId u32
//! RpcStreamAbort       tag | callId u32 | reason..
//! *StreamPush          tag | streamId u32 | bytes..
//! *StreamEnd           tag | streamId u32
//! *StreamAbort         tag | streamId u32 | reason..
//! *StreamPull          tag | streamId u32 | size u32
//! Ping / Pong          tag | nonce u32
//! ```
//!
//! `..` marks a field that runs to the end of the frame. Optional trailing
//! fields are absent when empty.

use bytes::Bytes;

use super::binary::{FrameReader, FrameWriter};
use super::message::{
    ClientMessage, ClientMessageType, ResponseBody, ServerMessage, ServerMessageType,
};
use super::{MessageCodec, ProtocolVersion};
use crate::error::{CallwireError, Result};

/// Version 1 message codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolV1;

impl MessageCodec for ProtocolV1 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V1
    }

    fn encode_client(&self, message: &ClientMessage) -> Result<Bytes> {
        let w = FrameWriter::with_tag(message.message_type() as u8);
        let frame = match message {
            ClientMessage::Rpc {
                call_id,
                procedure,
                payload,
            } => {
                let len = u16::try_from(procedure.len()).map_err(|_| {
                    CallwireError::Framing(format!(
                        "Procedure name too long: {} bytes",
                        procedure.len()
                    ))
                })?;
                w.u32(*call_id)
                    .u16(len)
                    .bytes(procedure.as_bytes())
                    .bytes(payload)
            }
            ClientMessage::RpcAbort { call_id, reason } => {
                w.u32(*call_id).trailing_text(reason.as_deref())
            }
            ClientMessage::RpcPull { call_id } => w.u32(*call_id),
            ClientMessage::ClientStreamPush { stream_id, chunk } => {
                w.u32(*stream_id).bytes(chunk)
            }
            ClientMessage::ClientStreamEnd { stream_id } => w.u32(*stream_id),
            ClientMessage::ClientStreamAbort { stream_id, reason }
            | ClientMessage::ServerStreamAbort { stream_id, reason } => {
                w.u32(*stream_id).trailing_text(reason.as_deref())
            }
            ClientMessage::ServerStreamPull { stream_id, size } => {
                w.u32(*stream_id).u32(*size)
            }
            ClientMessage::Ping { nonce } | ClientMessage::Pong { nonce } => w.u32(*nonce),
        };
        Ok(frame.finish())
    }

    fn decode_client(&self, frame: Bytes) -> Result<ClientMessage> {
        let mut r = FrameReader::new(frame);
        let kind = ClientMessageType::try_from(r.u8()?)?;
        let message = match kind {
            ClientMessageType::Rpc => {
                let call_id = r.u32()?;
                let len = r.u16()? as usize;
                let procedure = r.text(len)?;
                ClientMessage::Rpc {
                    call_id,
                    procedure,
                    payload: r.rest(),
                }
            }
            ClientMessageType::RpcAbort => ClientMessage::RpcAbort {
                call_id: r.u32()?,
                reason: r.rest_text()?,
            },
            ClientMessageType::RpcPull => ClientMessage::RpcPull { call_id: r.u32()? },
            ClientMessageType::ClientStreamPush => ClientMessage::ClientStreamPush {
                stream_id: r.u32()?,
                chunk: r.rest(),
            },
            ClientMessageType::ClientStreamEnd => ClientMessage::ClientStreamEnd {
                stream_id: r.u32()?,
            },
            ClientMessageType::ClientStreamAbort => ClientMessage::ClientStreamAbort {
                stream_id: r.u32()?,
                reason: r.rest_text()?,
            },
            ClientMessageType::ServerStreamAbort => ClientMessage::ServerStreamAbort {
                stream_id: r.u32()?,
                reason: r.rest_text()?,
            },
            ClientMessageType::ServerStreamPull => ClientMessage::ServerStreamPull {
                stream_id: r.u32()?,
                size: r.u32()?,
            },
            ClientMessageType::Ping => ClientMessage::Ping { nonce: r.u32()? },
            ClientMessageType::Pong => ClientMessage::Pong { nonce: r.u32()? },
        };
        Ok(message)
    }

    fn encode_server(&self, message: &ServerMessage) -> Result<Bytes> {
        let w = FrameWriter::with_tag(message.message_type() as u8);
        let frame = match message {
            ServerMessage::RpcResponse { call_id, body } => {
                let w = w.u32(*call_id).u8(body.is_error() as u8);
                match body {
                    ResponseBody::Ok(bytes) | ResponseBody::Err(bytes) => w.bytes(bytes),
                }
            }
            ServerMessage::RpcStreamResponse { call_id, error } => {
                let w = w.u32(*call_id);
                match error {
                    Some(error) => w.bytes(error),
                    None => w,
                }
            }
            ServerMessage::RpcStreamChunk { call_id, chunk } => w.u32(*call_id).bytes(chunk),
            ServerMessage::RpcStreamEnd { call_id } => w.u32(*call_id),
            ServerMessage::RpcStreamAbort { call_id, reason } => {
                w.u32(*call_id).trailing_text(reason.as_deref())
            }
            ServerMessage::ServerStreamPush { stream_id, chunk } => {
                w.u32(*stream_id).bytes(chunk)
            }
            ServerMessage::ServerStreamEnd { stream_id } => w.u32(*stream_id),
            ServerMessage::ServerStreamAbort { stream_id, reason }
            | ServerMessage::ClientStreamAbort { stream_id, reason } => {
                w.u32(*stream_id).trailing_text(reason.as_deref())
            }
            ServerMessage::ClientStreamPull { stream_id, size } => {
                w.u32(*stream_id).u32(*size)
            }
            ServerMessage::Ping { nonce } | ServerMessage::Pong { nonce } => w.u32(*nonce),
        };
        Ok(frame.finish())
    }

    fn decode_server(&self, frame: Bytes) -> Result<ServerMessage> {
        let mut r = FrameReader::new(frame);
        let kind = ServerMessageType::try_from(r.u8()?)?;
        let message = match kind {
            ServerMessageType::RpcResponse => {
                let call_id = r.u32()?;
                let body = match r.u8()? {
                    0 => ResponseBody::Ok(r.rest()),
                    1 => ResponseBody::Err(r.rest()),
                    other => {
                        return Err(CallwireError::Framing(format!(
                            "Invalid isError flag: {other}"
                        )))
                    }
                };
                ServerMessage::RpcResponse { call_id, body }
            }
            ServerMessageType::RpcStreamResponse => ServerMessage::RpcStreamResponse {
                call_id: r.u32()?,
                error: r.rest_optional(),
            },
            ServerMessageType::RpcStreamChunk => ServerMessage::RpcStreamChunk {
                call_id: r.u32()?,
                chunk: r.rest(),
            },
            ServerMessageType::RpcStreamEnd => ServerMessage::RpcStreamEnd { call_id: r.u32()? },
            ServerMessageType::RpcStreamAbort => ServerMessage::RpcStreamAbort {
                call_id: r.u32()?,
                reason: r.rest_text()?,
            },
            ServerMessageType::ServerStreamPush => ServerMessage::ServerStreamPush {
                stream_id: r.u32()?,
                chunk: r.rest(),
            },
            ServerMessageType::ServerStreamEnd => ServerMessage::ServerStreamEnd {
                stream_id: r.u32()?,
            },
            ServerMessageType::ServerStreamAbort => ServerMessage::ServerStreamAbort {
                stream_id: r.u32()?,
                reason: r.rest_text()?,
            },
            ServerMessageType::ClientStreamAbort => ServerMessage::ClientStreamAbort {
                stream_id: r.u32()?,
                reason: r.rest_text()?,
            },
            ServerMessageType::ClientStreamPull => ServerMessage::ClientStreamPull {
                stream_id: r.u32()?,
                size: r.u32()?,
            },
            ServerMessageType::Ping => ServerMessage::Ping { nonce: r.u32()? },
            ServerMessageType::Pong => ServerMessage::Pong { nonce: r.u32()? },
        };
        Ok(message)
    }
}
