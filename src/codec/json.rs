//! JSON payload format using `serde_json`.

use bytes::Bytes;

use super::{DecodeRpcContext, EncodeRpcContext, PayloadFormat, RpcEnvelope};
use crate::error::Result;
use crate::value::{IncomingValue, OutgoingValue};

/// JSON payload format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl PayloadFormat for JsonFormat {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_rpc(&self, value: OutgoingValue, ctx: &mut dyn EncodeRpcContext) -> Result<Bytes> {
        let envelope = RpcEnvelope::pack(value, ctx)?;
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    fn decode_rpc(&self, bytes: &[u8], ctx: &mut dyn DecodeRpcContext) -> Result<IncomingValue> {
        if bytes.is_empty() {
            return RpcEnvelope::empty().unpack(ctx);
        }
        serde_json::from_slice::<RpcEnvelope>(bytes)?.unpack(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::ProtocolBlob;
    use crate::codec::testing::{RecordingDecodeContext, RecordingEncodeContext};
    use crate::error::CallwireError;
    use crate::value::Value;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let mut ctx = RecordingEncodeContext::default();
        let encoded = JsonFormat
            .encode_rpc(
                Value::List(vec![
                    Value::Plain(json!({ "ok": true })),
                    ProtocolBlob::from_text("x").into(),
                ]),
                &mut ctx,
            )
            .unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(raw["streams"]["1"]["type"], "text/plain");
        assert_eq!(raw["payload"]["list"][0]["plain"]["ok"], true);
        assert_eq!(raw["payload"]["list"][1]["blob"], 1);
    }

    #[test]
    fn test_plain_payload_has_no_stream_table() {
        let mut ctx = RecordingEncodeContext::default();
        let encoded = JsonFormat
            .encode_rpc(Value::Plain(json!("hi")), &mut ctx)
            .unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert!(raw.get("streams").is_none());
    }

    #[test]
    fn test_rpc_round_trip() {
        let mut enc = RecordingEncodeContext::default();
        let encoded = JsonFormat
            .encode_rpc(ProtocolBlob::from_text("body").into(), &mut enc)
            .unwrap();

        let mut dec = RecordingDecodeContext::default();
        let value = JsonFormat.decode_rpc(&encoded, &mut dec).unwrap();
        let reader = value.into_blob().unwrap();
        assert_eq!(reader.stream_id(), 1);
        assert_eq!(reader.metadata().size, Some(4));
    }

    #[test]
    fn test_invalid_json() {
        let result = JsonFormat.decode(b"{nope");
        assert!(matches!(result, Err(CallwireError::Json(_))));
    }
}
