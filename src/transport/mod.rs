//! Transport module - moving encoded frames between peers.
//!
//! The connection engines only need a [`FrameSink`] to send frames and
//! someone feeding them received frames. Two transports are provided:
//!
//! - [`ChannelSink`]: in-memory, for embedding in another transport and
//!   for tests
//! - length-prefixed framing over any `AsyncRead`/`AsyncWrite` pair, with a
//!   batching [writer task](spawn_writer_task) and a [`FramedReader`]

mod frame_buffer;
mod writer;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::error::{CallwireError, Result};

pub use frame_buffer::{length_prefix, FrameBuffer, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
pub use writer::{
    spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle, DEFAULT_BACKPRESSURE_TIMEOUT,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_PENDING_FRAMES,
};

/// Outbound half of a connection.
pub trait FrameSink: Send + Sync + 'static {
    /// Send one frame, waiting for transport backpressure.
    fn send(&self, frame: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Send one frame without waiting. Used where awaiting is impossible,
    /// such as drop paths and demand hooks.
    fn send_now(&self, frame: Bytes) -> Result<()>;
}

/// In-memory sink backed by an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl FrameSink for ChannelSink {
    fn send(&self, frame: Bytes) -> BoxFuture<'_, Result<()>> {
        let sent = self.send_now(frame);
        async move { sent }.boxed()
    }

    fn send_now(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| CallwireError::ConnectionClosed)
    }
}

/// Sink plus the receiver its frames arrive on.
pub fn channel_sink() -> (ChannelSink, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink::new(tx), rx)
}

/// Reads length-prefixed frames from a byte stream.
pub struct FramedReader<R> {
    reader: R,
    buffer: FrameBuffer,
    ready: std::collections::VecDeque<Bytes>,
    scratch: Vec<u8>,
}

impl<R> FramedReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, max_frame_size: u32) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::with_max_frame_size(max_frame_size),
            ready: std::collections::VecDeque::new(),
            scratch: vec![0u8; 64 * 1024],
        }
    }

    /// Next complete frame, `None` on a clean end of stream.
    ///
    /// An end of stream in the middle of a frame is a framing error.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                if self.buffer.is_mid_frame() {
                    return Err(CallwireError::Framing(
                        "Stream ended inside a frame".into(),
                    ));
                }
                return Ok(None);
            }
            self.ready.extend(self.buffer.push(&self.scratch[..n])?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = channel_sink();
        sink.send(Bytes::from_static(b"a")).await.unwrap();
        sink.send_now(Bytes::from_static(b"b")).unwrap();

        assert_eq!(rx.recv().await.unwrap(), "a");
        assert_eq!(rx.recv().await.unwrap(), "b");

        drop(rx);
        assert!(sink.is_closed());
        assert!(matches!(
            sink.send_now(Bytes::from_static(b"c")),
            Err(CallwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_writer_to_framed_reader() {
        let (client, server) = duplex(64);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());
        let mut reader = FramedReader::new(server, DEFAULT_MAX_FRAME_SIZE);

        let big = Bytes::from(vec![7u8; 1000]);
        handle.send(Bytes::from_static(b"one")).await.unwrap();
        handle.send(big.clone()).await.unwrap();

        assert_eq!(reader.next_frame().await.unwrap().unwrap(), "one");
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), big);

        drop(handle);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_framing_error() {
        let (mut client, server) = duplex(64);
        let mut reader = FramedReader::new(server, DEFAULT_MAX_FRAME_SIZE);

        client.write_all(&[10, 0, 0, 0, 1, 2]).await.unwrap();
        drop(client);

        assert!(matches!(
            reader.next_frame().await,
            Err(CallwireError::Framing(_))
        ));
    }
}
