//! Frame buffer for accumulating partial reads.
//!
//! Stream transports carry each protocol frame behind a little-endian `u32`
//! length prefix. The buffer is a small state machine:
//! - `WaitingForLength`: need 4 bytes
//! - `WaitingForFrame`: length known, need N more bytes
//!
//! # Example
//!
//! ```
//! use callwire::transport::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&[2, 0, 0, 0, 30]).unwrap();
//! assert!(frames.is_empty());
//!
//! let frames = buffer.push(&[1, 3, 0, 0, 0, 31, 0, 0]).unwrap();
//! assert_eq!(frames.len(), 2);
//! assert_eq!(&frames[0][..], &[30, 1]);
//! ```

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{CallwireError, Result};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame size (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForLength,
    WaitingForFrame { remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Buffer with 64KB initial capacity and the default frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// A zero length or a length above the limit is a framing error; the
    /// stream cannot be resynchronised after it.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    if self.buffer.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }
                    let length = self.buffer.get_u32_le();
                    if length == 0 {
                        return Err(CallwireError::Framing("Empty frame".into()));
                    }
                    if length > self.max_frame_size {
                        return Err(CallwireError::Framing(format!(
                            "Frame size {} exceeds maximum {}",
                            length, self.max_frame_size
                        )));
                    }
                    self.state = State::WaitingForFrame { remaining: length };
                }
                State::WaitingForFrame { remaining } => {
                    let remaining = remaining as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }
                    let frame = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForLength;
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Number of buffered bytes not yet part of a returned frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a frame is partially received.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, State::WaitingForFrame { .. }) || !self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForFrame { .. } => "WaitingForFrame",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Length prefix for `frame`.
///
/// # Errors
///
/// A frame whose length does not fit the `u32` prefix is a framing error.
pub fn length_prefix(frame: &[u8]) -> Result<[u8; LENGTH_PREFIX_SIZE]> {
    encode_length(frame.len())
}

fn encode_length(len: usize) -> Result<[u8; LENGTH_PREFIX_SIZE]> {
    u32::try_from(len)
        .map(u32::to_le_bytes)
        .map_err(|_| CallwireError::Framing(format!("Frame size {len} exceeds the length prefix")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(frame: &[u8]) -> Vec<u8> {
        let mut bytes = length_prefix(frame).unwrap().to_vec();
        bytes.extend_from_slice(frame);
        bytes
    }

    #[test]
    fn test_length_prefix_overflow() {
        assert_eq!(encode_length(5).unwrap(), [5, 0, 0, 0]);
        assert_eq!(encode_length(u32::MAX as usize).unwrap(), [0xFF; 4]);
        assert!(matches!(
            encode_length(u32::MAX as usize + 1),
            Err(CallwireError::Framing(_))
        ));
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut data = framed(b"first");
        data.extend(framed(b"second"));
        data.extend(framed(b"third"));

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames, vec!["first", "second", "third"]);
        assert!(buffer.is_empty());
        assert!(!buffer.is_mid_frame());
    }

    #[test]
    fn test_fragmented_length_and_body() {
        let mut buffer = FrameBuffer::new();
        let data = framed(b"a longer frame body");

        assert!(buffer.push(&data[..2]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForLength");

        assert!(buffer.push(&data[2..10]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForFrame");
        assert!(buffer.is_mid_frame());

        let frames = buffer.push(&data[10..]).unwrap();
        assert_eq!(frames, vec!["a longer frame body"]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let mut all = Vec::new();
        for byte in framed(b"hi") {
            all.extend(buffer.push(&[byte]).unwrap());
        }
        assert_eq!(all, vec!["hi"]);
    }

    #[test]
    fn test_max_frame_size() {
        let mut buffer = FrameBuffer::with_max_frame_size(100);
        let result = buffer.push(&1000u32.to_le_bytes());
        match result {
            Err(e @ CallwireError::Framing(_)) => {
                assert!(e.is_fatal());
                assert!(e.to_string().contains("exceeds maximum"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut buffer = FrameBuffer::new();
        assert!(matches!(
            buffer.push(&[0, 0, 0, 0]),
            Err(CallwireError::Framing(_))
        ));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&framed(b"test")[..6]).unwrap();
        assert_eq!(buffer.state_name(), "WaitingForFrame");

        buffer.clear();
        assert_eq!(buffer.state_name(), "WaitingForLength");
        assert!(buffer.is_empty());
    }
}
