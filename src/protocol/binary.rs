//! Fixed-width binary primitives.
//!
//! All multi-byte integers are Little Endian:
//! ```text
//! ┌────────┬──────────┬──────────┬───────────────┐
//! │ u8     │ u16 LE   │ u32 LE   │ text (UTF-8)  │
//! │ 1 byte │ 2 bytes  │ 4 bytes  │ length-framed │
//! └────────┴──────────┴──────────┴───────────────┘
//! ```
//!
//! Text carries no terminator; its length is either written explicitly by
//! the caller (procedure names) or implied by the end of the frame
//! (abort reasons).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CallwireError, Result};

/// Size of an encoded `u8`.
pub const U8_SIZE: usize = 1;
/// Size of an encoded `u16`.
pub const U16_SIZE: usize = 2;
/// Size of an encoded `u32`.
pub const U32_SIZE: usize = 4;

/// Encode a `u8`.
#[inline]
pub fn encode_u8(value: u8) -> [u8; U8_SIZE] {
    [value]
}

/// Encode a `u16` (Little Endian).
#[inline]
pub fn encode_u16(value: u16) -> [u8; U16_SIZE] {
    value.to_le_bytes()
}

/// Encode a `u32` (Little Endian).
#[inline]
pub fn encode_u32(value: u32) -> [u8; U32_SIZE] {
    value.to_le_bytes()
}

/// Encode text as UTF-8 bytes.
#[inline]
pub fn encode_text(text: &str) -> &[u8] {
    text.as_bytes()
}

/// Decode a `u8` at `offset`.
pub fn decode_u8(buf: &[u8], offset: usize) -> Result<u8> {
    buf.get(offset)
        .copied()
        .ok_or_else(|| truncated("u8", offset, buf.len()))
}

/// Decode a Little Endian `u16` at `offset`.
pub fn decode_u16(buf: &[u8], offset: usize) -> Result<u16> {
    let bytes = slice_at(buf, offset, U16_SIZE, "u16")?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Decode a Little Endian `u32` at `offset`.
pub fn decode_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes = slice_at(buf, offset, U32_SIZE, "u32")?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decode UTF-8 text.
pub fn decode_text(buf: &[u8]) -> Result<String> {
    std::str::from_utf8(buf)
        .map(str::to_owned)
        .map_err(|e| CallwireError::Framing(format!("Invalid UTF-8 text: {e}")))
}

/// Concatenate buffers into one contiguous frame.
pub fn concat(parts: &[&[u8]]) -> Bytes {
    let total = parts.iter().map(|p| p.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for part in parts {
        buf.extend_from_slice(part);
    }
    buf.freeze()
}

fn slice_at<'a>(buf: &'a [u8], offset: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| truncated(what, offset, buf.len()))
}

fn truncated(what: &str, offset: usize, len: usize) -> CallwireError {
    CallwireError::Framing(format!(
        "Truncated frame: cannot read {what} at offset {offset} (frame is {len} bytes)"
    ))
}

/// Sequential writer over a growable buffer.
#[derive(Debug, Default)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    /// Start a frame with its one-byte type tag.
    pub fn with_tag(tag: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(tag);
        Self { buf }
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.buf.put_u8(value);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.buf.put_u16_le(value);
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.buf.put_u32_le(value);
        self
    }

    /// Append raw bytes without a length prefix.
    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Append optional trailing text; `None` writes nothing.
    ///
    /// An empty text also writes nothing, so `Some("")` reads back as
    /// `None`: the wire does not tell an empty reason from a missing one.
    pub fn trailing_text(self, value: Option<&str>) -> Self {
        match value {
            Some(text) => self.bytes(encode_text(text)),
            None => self,
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Sequential reader over a received frame.
///
/// Every read is bounds-checked; running off the end is a framing error.
#[derive(Debug)]
pub struct FrameReader {
    buf: Bytes,
}

impl FrameReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.ensure(U8_SIZE, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.ensure(U16_SIZE, "u16")?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.ensure(U32_SIZE, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    /// Read exactly `len` bytes of UTF-8 text.
    pub fn text(&mut self, len: usize) -> Result<String> {
        self.ensure(len, "text")?;
        let raw = self.buf.split_to(len);
        decode_text(&raw)
    }

    /// Take everything that is left (zero-copy).
    pub fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// Remaining bytes as optional text; empty means `None`.
    pub fn rest_text(&mut self) -> Result<Option<String>> {
        let rest = self.rest();
        if rest.is_empty() {
            Ok(None)
        } else {
            decode_text(&rest).map(Some)
        }
    }

    /// Remaining bytes, `None` when empty.
    pub fn rest_optional(&mut self) -> Option<Bytes> {
        let rest = self.rest();
        (!rest.is_empty()).then_some(rest)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn ensure(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.len() < len {
            return Err(CallwireError::Framing(format!(
                "Truncated frame: need {len} bytes for {what}, {} left",
                self.buf.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_byte_order() {
        assert_eq!(encode_u16(0x0102), [0x02, 0x01]);
        assert_eq!(encode_u32(0x0102_0304), [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(encode_u8(7), [7]);
    }

    #[test]
    fn test_decode_at_offset() {
        let buf = [0xAA, 0x04, 0x03, 0x02, 0x01, 0x10, 0x00];
        assert_eq!(decode_u8(&buf, 0).unwrap(), 0xAA);
        assert_eq!(decode_u32(&buf, 1).unwrap(), 0x0102_0304);
        assert_eq!(decode_u16(&buf, 5).unwrap(), 0x0010);
    }

    #[test]
    fn test_decode_out_of_bounds() {
        let buf = [0x01, 0x02];
        assert!(matches!(decode_u32(&buf, 0), Err(CallwireError::Framing(_))));
        assert!(matches!(decode_u16(&buf, 1), Err(CallwireError::Framing(_))));
        assert!(matches!(decode_u8(&buf, 2), Err(CallwireError::Framing(_))));
        assert!(decode_u16(&buf, usize::MAX).is_err());
    }

    #[test]
    fn test_text_round_trip() {
        let text = "users/list — ünïcode";
        assert_eq!(decode_text(encode_text(text)).unwrap(), text);
    }

    #[test]
    fn test_invalid_utf8_is_framing_error() {
        let result = decode_text(&[0xFF, 0xFE]);
        assert!(matches!(result, Err(CallwireError::Framing(_))));
    }

    #[test]
    fn test_concat() {
        let frame = concat(&[&[1], &encode_u16(2), b"ab"]);
        assert_eq!(&frame[..], &[1, 2, 0, b'a', b'b']);
        assert!(concat(&[]).is_empty());
    }

    #[test]
    fn test_writer_reader_sequence() {
        let frame = FrameWriter::with_tag(10)
            .u32(42)
            .u16(3)
            .bytes(b"abc")
            .bytes(b"rest")
            .finish();

        let mut reader = FrameReader::new(frame);
        assert_eq!(reader.u8().unwrap(), 10);
        assert_eq!(reader.u32().unwrap(), 42);
        let len = reader.u16().unwrap() as usize;
        assert_eq!(reader.text(len).unwrap(), "abc");
        assert_eq!(&reader.rest()[..], b"rest");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_reader_truncated() {
        let mut reader = FrameReader::new(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(reader.u8().unwrap(), 1);
        assert!(matches!(reader.u32(), Err(CallwireError::Framing(_))));
    }

    #[test]
    fn test_rest_text_empty_is_none() {
        let mut reader = FrameReader::new(Bytes::new());
        assert_eq!(reader.rest_text().unwrap(), None);

        let mut reader = FrameReader::new(Bytes::from_static(b"why"));
        assert_eq!(reader.rest_text().unwrap().as_deref(), Some("why"));
    }

    #[test]
    fn test_empty_trailing_text_reads_as_none() {
        let empty = FrameWriter::with_tag(11).u32(2).trailing_text(Some("")).finish();
        let missing = FrameWriter::with_tag(11).u32(2).trailing_text(None).finish();
        assert_eq!(empty, missing);

        let mut reader = FrameReader::new(empty);
        assert_eq!(reader.u8().unwrap(), 11);
        assert_eq!(reader.u32().unwrap(), 2);
        assert_eq!(reader.rest_text().unwrap(), None);
    }
}
