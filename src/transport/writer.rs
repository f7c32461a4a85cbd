//! Dedicated writer task for stream transports.
//!
//! Frames are queued on an mpsc channel and written by one task, which
//! batches every ready frame into a single vectored write.
//!
//! ```text
//! Call task 1 ─┐
//! Call task 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► AsyncWrite
//! Pump task N ─┘
//! ```
//!
//! Backpressure is a pending-frame count: `send` waits for the writer to
//! drain below the limit and fails with
//! [`CallwireError::BackpressureTimeout`] if that takes too long.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::frame_buffer::{length_prefix, LENGTH_PREFIX_SIZE};
use super::FrameSink;
use crate::error::{CallwireError, Result};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame with its length prefix.
#[derive(Debug)]
pub struct OutboundFrame {
    pub prefix: [u8; LENGTH_PREFIX_SIZE],
    pub frame: Bytes,
}

impl OutboundFrame {
    /// Fails with a framing error when `frame` is too large to prefix.
    #[inline]
    pub fn new(frame: Bytes) -> Result<Self> {
        Ok(Self {
            prefix: length_prefix(&frame)?,
            frame,
        })
    }

    /// Bytes this frame occupies on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.frame.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Frames queued but not yet written.
#[derive(Debug, Default)]
struct Pending {
    count: AtomicUsize,
    drained: Notify,
}

impl Pending {
    fn load(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn reserve(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self, n: usize) {
        self.count.fetch_sub(n, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

/// Handle for queueing frames on the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<Pending>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundFrame>, pending: Arc<Pending>, config: &WriterConfig) -> Self {
        Self {
            tx,
            pending,
            max_pending: config.max_pending_frames,
            timeout: config.backpressure_timeout,
        }
    }

    /// Queue a frame, waiting while backpressure is active.
    pub async fn send_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_backpressure_active() {
            tokio::time::timeout(self.timeout, self.drained_below_limit())
                .await
                .map_err(|_| {
                    tracing::warn!(pending = self.pending_count(), "writer backpressure timeout");
                    CallwireError::BackpressureTimeout
                })?;
        }

        let frame = OutboundFrame::new(frame)?;

        // The writer releases the slot once the frame is written.
        self.pending.reserve();
        self.tx.send(frame).await.map_err(|_| {
            self.pending.release(1);
            CallwireError::ConnectionClosed
        })
    }

    async fn drained_below_limit(&self) {
        loop {
            let drained = self.pending.drained.notified();
            if !self.is_backpressure_active() {
                return;
            }
            drained.await;
        }
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load() >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load()
    }

    /// Queue a frame without waiting.
    ///
    /// Fails with `BackpressureTimeout` at once when at capacity.
    pub fn try_send_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_backpressure_active() {
            return Err(CallwireError::BackpressureTimeout);
        }

        let frame = OutboundFrame::new(frame)?;
        self.pending.reserve();
        self.tx.try_send(frame).map_err(|e| {
            self.pending.release(1);
            match e {
                mpsc::error::TrySendError::Full(_) => CallwireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => CallwireError::ConnectionClosed,
            }
        })
    }
}

impl FrameSink for WriterHandle {
    fn send(&self, frame: Bytes) -> BoxFuture<'_, Result<()>> {
        self.send_frame(frame).boxed()
    }

    fn send_now(&self, frame: Bytes) -> Result<()> {
        self.try_send_frame(frame)
    }
}

/// Spawn the writer task and return a handle for queueing frames.
///
/// The task ends cleanly once every handle is dropped, or with the first
/// write error.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(Pending::default());
    let task = tokio::spawn(writer_loop(rx, writer, pending.clone()));

    (WriterHandle::new(tx, pending, &config), task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<Pending>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!("frame write failed: {}", e);
            return Err(e);
        }
        tracing::trace!(frames = batch.len(), "batch written");
        pending.release(batch.len());
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames with vectored writes, finishing partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(CallwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering everything after the first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.prefix[..], &frame.frame[..]] {
            let end = offset + part.len();
            if skip_bytes < end {
                slices.push(IoSlice::new(&part[skip_bytes.saturating_sub(offset)..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn limited(max_pending_frames: usize, backpressure_timeout: Duration) -> WriterConfig {
        WriterConfig {
            max_pending_frames,
            backpressure_timeout,
            ..WriterConfig::default()
        }
    }

    #[test]
    fn test_outbound_frame_prefix() {
        let frame = OutboundFrame::new(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(frame.prefix, [5, 0, 0, 0]);
        assert_eq!(frame.size(), LENGTH_PREFIX_SIZE + 5);
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_send_writes_prefixed_frame() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(Bytes::from_static(b"hello")).await.unwrap();

        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x05\x00\x00\x00hello");
    }

    #[tokio::test]
    async fn test_batching_preserves_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..10u8 {
            handle.send_now(Bytes::from(vec![i])).unwrap();
        }

        let mut buf = [0u8; 50];
        server.read_exact(&mut buf).await.unwrap();
        for (i, chunk) in buf.chunks(5).enumerate() {
            assert_eq!(chunk, &[1, 0, 0, 0, i as u8]);
        }
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(Pending::default());
        pending.count.store(100, Ordering::Release);
        let handle = WriterHandle::new(tx, pending, &limited(100, Duration::from_secs(1)));

        assert!(handle.is_backpressure_active());
        assert!(matches!(
            handle.send_now(Bytes::from_static(b"x")),
            Err(CallwireError::BackpressureTimeout)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_under_backpressure() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(Pending::default());
        pending.reserve();
        let handle = WriterHandle::new(tx, pending, &limited(1, Duration::from_millis(50)));

        assert!(matches!(
            handle.send(Bytes::from_static(b"x")).await,
            Err(CallwireError::BackpressureTimeout)
        ));
    }

    #[tokio::test]
    async fn test_send_resumes_when_writer_drains() {
        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(Pending::default());
        pending.reserve();
        let handle = WriterHandle::new(tx, pending.clone(), &limited(1, Duration::from_secs(5)));

        let send = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(Bytes::from_static(b"x")).await }
        });
        tokio::task::yield_now().await;
        pending.release(1);

        send.await.unwrap().unwrap();
        assert_eq!(&rx.recv().await.unwrap().frame[..], b"x");
        assert_eq!(handle.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_connection_closed() {
        let (tx, rx) = mpsc::channel::<OutboundFrame>(10);
        drop(rx);
        let handle = WriterHandle::new(tx, Arc::default(), &WriterConfig::default());

        assert!(matches!(
            handle.send(Bytes::from_static(b"x")).await,
            Err(CallwireError::ConnectionClosed)
        ));
        assert_eq!(handle.pending_count(), 0);
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![OutboundFrame::new(Bytes::from_static(b"hello")).unwrap()];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);

        let slices = build_remaining_slices(&batch, 2);
        assert_eq!(slices[0].len(), 2);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, LENGTH_PREFIX_SIZE + 1);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"ello");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5)
            .map(|_| OutboundFrame::new(Bytes::from_static(b"abc")).unwrap())
            .collect();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 5 * (LENGTH_PREFIX_SIZE + 3));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }
}
