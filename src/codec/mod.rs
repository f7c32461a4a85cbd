//! Codec module - application payload formats.
//!
//! The protocol core never looks inside payloads. A [`PayloadFormat`]
//! turns plain values and call payloads into bytes and back:
//!
//! - [`MsgPackFormat`] - MessagePack using `rmp-serde` (struct-as-map)
//! - [`JsonFormat`] - JSON using `serde_json`
//!
//! A gateway keeps its formats in [`PayloadFormats`] and picks one per
//! connection from the content type the client asked for.
//!
//! # Blobs
//!
//! Call payloads may embed blobs. While encoding, every blob is handed to
//! the [`EncodeRpcContext`], which registers an outgoing stream and returns
//! its id. The payload carries an [`RpcEnvelope`]: the metadata of every
//! stream plus the value tree with `Blob(streamId)` leaves. Decoding does
//! the reverse through a [`DecodeRpcContext`].
//!
//! # Example
//!
//! ```
//! use callwire::codec::{MsgPackFormat, PayloadFormat};
//! use serde_json::json;
//!
//! let format = MsgPackFormat;
//! let encoded = format.encode(&json!({ "ok": true })).unwrap();
//! assert_eq!(format.decode(&encoded).unwrap(), json!({ "ok": true }));
//! ```

mod formats;
mod json;
mod msgpack;

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use formats::PayloadFormats;
pub use json::JsonFormat;
pub use msgpack::MsgPackFormat;

use crate::blob::{BlobMetadata, BlobReader, ProtocolBlob};
use crate::error::{CallwireError, Result};
use crate::value::{IncomingValue, OutgoingValue, Value};

/// Registers outgoing blobs while a payload is encoded.
pub trait EncodeRpcContext {
    /// Register `blob` as a new outgoing stream and return its id.
    fn add_stream(&mut self, blob: ProtocolBlob) -> Result<u32>;
}

/// Registers incoming blobs while a payload is decoded.
pub trait DecodeRpcContext {
    /// Register the peer's stream `stream_id` and return its reader.
    fn add_stream(&mut self, stream_id: u32, metadata: BlobMetadata) -> Result<BlobReader>;
}

/// Application payload format.
pub trait PayloadFormat: Send + Sync + 'static {
    /// MIME type announced for this format.
    fn content_type(&self) -> &'static str;

    /// Encode a plain value (streaming chunks, errors).
    fn encode(&self, value: &serde_json::Value) -> Result<Bytes>;

    /// Decode a plain value. Empty input decodes to `null`.
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value>;

    /// Encode a call payload, registering its blobs through `ctx`.
    fn encode_rpc(&self, value: OutgoingValue, ctx: &mut dyn EncodeRpcContext) -> Result<Bytes>;

    /// Decode a call payload, registering its blobs through `ctx`.
    fn decode_rpc(&self, bytes: &[u8], ctx: &mut dyn DecodeRpcContext) -> Result<IncomingValue>;
}

/// Value tree as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireValue {
    Plain(serde_json::Value),
    Blob(u32),
    List(Vec<WireValue>),
    Record(BTreeMap<String, WireValue>),
}

/// Encoded call payload: stream table plus value tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub streams: BTreeMap<u32, BlobMetadata>,
    pub payload: WireValue,
}

impl RpcEnvelope {
    /// Envelope for a `null` payload without streams.
    pub fn empty() -> Self {
        Self {
            streams: BTreeMap::new(),
            payload: WireValue::Plain(serde_json::Value::Null),
        }
    }

    /// Build an envelope, registering every blob with `ctx` in tree order.
    pub fn pack(value: OutgoingValue, ctx: &mut dyn EncodeRpcContext) -> Result<Self> {
        let mut streams = BTreeMap::new();
        let payload = pack_value(value, ctx, &mut streams)?;
        Ok(Self { streams, payload })
    }

    /// Open the envelope, registering every listed stream with `ctx`.
    ///
    /// Each listed stream may be referenced at most once; a reference to a
    /// stream missing from the table is an error.
    pub fn unpack(self, ctx: &mut dyn DecodeRpcContext) -> Result<IncomingValue> {
        let mut readers = BTreeMap::new();
        for (id, metadata) in self.streams {
            readers.insert(id, ctx.add_stream(id, metadata)?);
        }
        unpack_value(self.payload, &mut readers)
    }
}

fn pack_value(
    value: OutgoingValue,
    ctx: &mut dyn EncodeRpcContext,
    streams: &mut BTreeMap<u32, BlobMetadata>,
) -> Result<WireValue> {
    Ok(match value {
        Value::Plain(value) => WireValue::Plain(value),
        Value::Blob(blob) => {
            let metadata = blob.metadata().clone();
            let id = ctx.add_stream(blob)?;
            streams.insert(id, metadata);
            WireValue::Blob(id)
        }
        Value::List(items) => WireValue::List(
            items
                .into_iter()
                .map(|item| pack_value(item, ctx, streams))
                .collect::<Result<_>>()?,
        ),
        Value::Record(fields) => WireValue::Record(
            fields
                .into_iter()
                .map(|(k, v)| pack_value(v, ctx, streams).map(|v| (k, v)))
                .collect::<Result<_>>()?,
        ),
    })
}

fn unpack_value(
    value: WireValue,
    readers: &mut BTreeMap<u32, BlobReader>,
) -> Result<IncomingValue> {
    Ok(match value {
        WireValue::Plain(value) => Value::Plain(value),
        WireValue::Blob(id) => Value::Blob(readers.remove(&id).ok_or_else(|| {
            CallwireError::InvalidValue(format!("Unknown or repeated blob reference: {id}"))
        })?),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| unpack_value(item, readers))
                .collect::<Result<_>>()?,
        ),
        WireValue::Record(fields) => Value::Record(
            fields
                .into_iter()
                .map(|(k, v)| unpack_value(v, readers).map(|v| (k, v)))
                .collect::<Result<_>>()?,
        ),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording contexts shared by the format tests.

    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    pub struct RecordingEncodeContext {
        pub next_id: u32,
        pub added: Vec<BlobMetadata>,
    }

    impl EncodeRpcContext for RecordingEncodeContext {
        fn add_stream(&mut self, blob: ProtocolBlob) -> Result<u32> {
            self.next_id += 1;
            self.added.push(blob.metadata().clone());
            Ok(self.next_id)
        }
    }

    #[derive(Default)]
    pub struct RecordingDecodeContext {
        pub added: Vec<(u32, BlobMetadata)>,
        pub senders: Vec<mpsc::UnboundedSender<crate::blob::BlobEvent>>,
    }

    impl DecodeRpcContext for RecordingDecodeContext {
        fn add_stream(&mut self, stream_id: u32, metadata: BlobMetadata) -> Result<BlobReader> {
            self.added.push((stream_id, metadata.clone()));
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.push(tx);
            Ok(BlobReader::new(
                stream_id,
                metadata,
                rx,
                Arc::new(|_| {}),
                crate::blob::DEFAULT_CHUNK_SIZE,
            ))
        }
    }
}
