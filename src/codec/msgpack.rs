//! MsgPack payload format using `rmp-serde`.
//!
//! **CRITICAL**: Always use `to_vec_named`, NEVER `to_vec`!
//! Peers decoding with a generic MessagePack library expect struct-as-map
//! format; `to_vec` would emit the envelope as a positional array.
//!
//! # Example
//!
//! ```
//! use callwire::codec::{MsgPackFormat, PayloadFormat};
//! use serde_json::json;
//!
//! let format = MsgPackFormat;
//! let encoded = format.encode(&json!([1, "two", null])).unwrap();
//! assert_eq!(format.decode(&encoded).unwrap(), json!([1, "two", null]));
//! ```

use bytes::Bytes;

use super::{DecodeRpcContext, EncodeRpcContext, PayloadFormat, RpcEnvelope};
use crate::error::Result;
use crate::value::{IncomingValue, OutgoingValue};

/// MessagePack payload format.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackFormat;

impl MsgPackFormat {
    /// Encode any serializable value to MsgPack bytes.
    #[inline]
    pub fn to_bytes<T: serde::Serialize + ?Sized>(value: &T) -> Result<Bytes> {
        // CRITICAL: to_vec_named, NOT to_vec!
        Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn from_bytes<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl PayloadFormat for MsgPackFormat {
    fn content_type(&self) -> &'static str {
        "application/msgpack"
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Bytes> {
        Self::to_bytes(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Self::from_bytes(bytes)
    }

    fn encode_rpc(&self, value: OutgoingValue, ctx: &mut dyn EncodeRpcContext) -> Result<Bytes> {
        Self::to_bytes(&RpcEnvelope::pack(value, ctx)?)
    }

    fn decode_rpc(&self, bytes: &[u8], ctx: &mut dyn DecodeRpcContext) -> Result<IncomingValue> {
        if bytes.is_empty() {
            return RpcEnvelope::empty().unpack(ctx);
        }
        Self::from_bytes::<RpcEnvelope>(bytes)?.unpack(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::ProtocolBlob;
    use crate::codec::testing::{RecordingDecodeContext, RecordingEncodeContext};
    use crate::value::Value;
    use serde_json::json;

    #[test]
    fn test_encode_decode_plain() {
        let value = json!({ "id": 42, "name": "test", "tags": ["a", "b"], "score": 1.5 });
        let encoded = MsgPackFormat.encode(&value).unwrap();
        assert_eq!(MsgPackFormat.decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_negative_and_large_numbers() {
        let value = json!([-1, i64::MIN, u64::MAX]);
        let encoded = MsgPackFormat.encode(&value).unwrap();
        assert_eq!(MsgPackFormat.decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_empty_bytes_decode_to_null() {
        assert_eq!(MsgPackFormat.decode(&[]).unwrap(), json!(null));

        let mut ctx = RecordingDecodeContext::default();
        let value = MsgPackFormat.decode_rpc(&[], &mut ctx).unwrap();
        assert_eq!(value.as_plain(), Some(&json!(null)));
    }

    #[test]
    fn test_envelope_is_map_format() {
        let mut ctx = RecordingEncodeContext::default();
        let encoded = MsgPackFormat
            .encode_rpc(Value::Plain(json!(1)), &mut ctx)
            .unwrap();

        // fixmap, not fixarray
        assert_eq!(encoded[0] & 0xF0, 0x80, "got {:02X}", encoded[0]);
    }

    #[test]
    fn test_rpc_round_trip_with_blob() {
        let payload: OutgoingValue = [
            ("title".to_string(), Value::Plain(json!("avatar"))),
            (
                "file".to_string(),
                ProtocolBlob::from_bytes(vec![1u8; 1024])
                    .with_content_type("image/png")
                    .into(),
            ),
        ]
        .into_iter()
        .collect();

        let mut enc = RecordingEncodeContext::default();
        let encoded = MsgPackFormat.encode_rpc(payload, &mut enc).unwrap();
        assert_eq!(enc.added.len(), 1);

        let mut dec = RecordingDecodeContext::default();
        let mut value = MsgPackFormat.decode_rpc(&encoded, &mut dec).unwrap();

        assert_eq!(dec.added.len(), 1);
        assert_eq!(dec.added[0].0, 1);
        assert_eq!(dec.added[0].1.size, Some(1024));

        let title = value.take("title").unwrap();
        assert_eq!(title.as_plain(), Some(&json!("avatar")));
        let reader = value.take("file").unwrap().into_blob().unwrap();
        assert_eq!(reader.metadata().content_type, "image/png");
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let mut ctx = RecordingDecodeContext::default();
        assert!(MsgPackFormat.decode_rpc(b"\xc1", &mut ctx).is_err());
    }
}
