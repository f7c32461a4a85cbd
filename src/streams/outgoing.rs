//! Registry of blobs this side produces.
//!
//! ```text
//! peer pull(size) ─► credits ─► pump task ─► source.read(size)
//!                                   │
//!                                   ├─ bytes ─► emitter.push
//!                                   └─ EOF   ─► emitter.end
//! ```
//!
//! A pump starts paused and reads exactly one chunk per credit, so at most
//! one unanswered pull exists per stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::StreamState;
use crate::blob::{BlobMetadata, BlobSource, ProtocolBlob, DEFAULT_CHUNK_SIZE};
use crate::error::{CallwireError, Result};
use crate::protocol::STREAM_PUSH_HEADER_SIZE;
use crate::transport::DEFAULT_MAX_FRAME_SIZE;

/// Largest chunk sent when frames are capped at the default size.
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = DEFAULT_MAX_FRAME_SIZE - STREAM_PUSH_HEADER_SIZE;

/// Largest buffer reserved up front for one chunk.
const MAX_CHUNK_PREALLOC: usize = 256 * 1024;

/// Sends the frames produced by a pump.
pub trait StreamEmitter: Send + Sync + 'static {
    /// Deliver one chunk of `stream_id` to the peer.
    fn push(&self, stream_id: u32, chunk: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Tell the peer the stream is complete.
    fn end(&self, stream_id: u32) -> BoxFuture<'_, Result<()>>;

    /// Tell the peer the stream failed locally.
    fn abort(&self, stream_id: u32, reason: String) -> BoxFuture<'_, Result<()>>;
}

struct OutgoingEntry {
    call_id: u32,
    metadata: BlobMetadata,
    credits: mpsc::UnboundedSender<u32>,
    task: AbortHandle,
    state: StreamState,
}

/// Producer-side blob stream registry.
///
/// Cheap to clone; clones share the same streams.
#[derive(Clone)]
pub struct OutgoingStreams {
    entries: Arc<Mutex<HashMap<u32, OutgoingEntry>>>,
    max_chunk_size: u32,
}

impl Default for OutgoingStreams {
    fn default() -> Self {
        Self::with_max_chunk_size(DEFAULT_MAX_CHUNK_SIZE)
    }
}

impl OutgoingStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose chunks never exceed `max_chunk_size` bytes, whatever
    /// size the peer pulls.
    pub fn with_max_chunk_size(max_chunk_size: u32) -> Self {
        Self {
            entries: Arc::default(),
            max_chunk_size: max_chunk_size.max(1),
        }
    }

    /// Registry sized so a push frame fits in `max_frame_size` bytes.
    pub fn for_frame_size(max_frame_size: u32) -> Self {
        Self::with_max_chunk_size(max_frame_size.saturating_sub(STREAM_PUSH_HEADER_SIZE))
    }

    pub fn max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, OutgoingEntry>> {
        // A poisoned map is still structurally valid.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `blob` as stream `stream_id` owned by `call_id`.
    ///
    /// The pump stays paused until the first [`pull`](Self::pull).
    pub fn add(
        &self,
        call_id: u32,
        stream_id: u32,
        blob: ProtocolBlob,
        emitter: Arc<dyn StreamEmitter>,
    ) -> Result<()> {
        let mut entries = self.lock();
        if entries.contains_key(&stream_id) {
            return Err(CallwireError::DuplicateStream(stream_id));
        }

        let (metadata, source) = blob.into_parts();
        let (credits, credit_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(
            stream_id,
            source,
            credit_rx,
            self.clone(),
            emitter,
        ))
        .abort_handle();

        tracing::debug!(stream_id, call_id, "outgoing stream added");
        entries.insert(
            stream_id,
            OutgoingEntry {
                call_id,
                metadata,
                credits,
                task,
                state: StreamState::Created,
            },
        );
        Ok(())
    }

    /// Metadata of a registered stream.
    pub fn get(&self, stream_id: u32) -> Result<BlobMetadata> {
        self.lock()
            .get(&stream_id)
            .map(|e| e.metadata.clone())
            .ok_or(CallwireError::StreamNotFound(stream_id))
    }

    pub fn state(&self, stream_id: u32) -> Option<StreamState> {
        self.lock().get(&stream_id).map(|e| e.state)
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.lock().contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Grant one credit of up to `size` bytes. A size of zero asks for the
    /// default chunk size; larger sizes are capped at the maximum chunk size.
    ///
    /// Returns `false` for an unknown stream.
    pub fn pull(&self, stream_id: u32, size: u32) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&stream_id) else {
            return false;
        };
        entry.state = StreamState::Active;
        let size = match size {
            0 => DEFAULT_CHUNK_SIZE,
            size => size,
        }
        .min(self.max_chunk_size);
        entry.credits.send(size).is_ok()
    }

    /// Complete a stream whose source is exhausted.
    ///
    /// Returns `false` when the stream was already gone.
    pub fn end(&self, stream_id: u32) -> bool {
        let removed = self.lock().remove(&stream_id);
        if removed.is_some() {
            tracing::debug!(stream_id, "outgoing stream ended");
        }
        removed.is_some()
    }

    /// Abort a stream and stop its pump.
    ///
    /// Returns `false` for an unknown stream.
    pub fn abort(&self, stream_id: u32, reason: &str) -> bool {
        match self.lock().remove(&stream_id) {
            Some(entry) => {
                entry.task.abort();
                tracing::debug!(stream_id, reason, "outgoing stream aborted");
                true
            }
            None => false,
        }
    }

    /// Drop a stream without notifying anyone.
    pub fn remove(&self, stream_id: u32) -> bool {
        match self.lock().remove(&stream_id) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    /// Ids of the streams owned by `call_id`.
    pub fn find_by_call(&self, call_id: u32) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .lock()
            .iter()
            .filter(|(_, e)| e.call_id == call_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Abort every stream owned by `call_id`, returning their ids.
    pub fn abort_call(&self, call_id: u32, reason: &str) -> Vec<u32> {
        let ids = self.find_by_call(call_id);
        ids.into_iter()
            .filter(|id| self.abort(*id, reason))
            .collect()
    }

    /// Abort every stream, returning their ids.
    pub fn close(&self, reason: &str) -> Vec<u32> {
        let drained: Vec<(u32, OutgoingEntry)> = self.lock().drain().collect();
        let mut ids = Vec::with_capacity(drained.len());
        for (id, entry) in drained {
            entry.task.abort();
            ids.push(id);
        }
        if !ids.is_empty() {
            tracing::debug!(count = ids.len(), reason, "outgoing streams closed");
        }
        ids.sort_unstable();
        ids
    }
}

async fn pump(
    stream_id: u32,
    mut source: BlobSource,
    mut credits: mpsc::UnboundedReceiver<u32>,
    registry: OutgoingStreams,
    emitter: Arc<dyn StreamEmitter>,
) {
    while let Some(size) = credits.recv().await {
        let mut buf = Vec::with_capacity((size as usize).min(MAX_CHUNK_PREALLOC));
        let read = (&mut source)
            .take(u64::from(size))
            .read_to_end(&mut buf)
            .await;

        let sent = match read {
            Ok(0) => {
                if registry.end(stream_id) {
                    if let Err(e) = emitter.end(stream_id).await {
                        tracing::debug!(stream_id, "failed to send stream end: {}", e);
                    }
                }
                return;
            }
            Ok(_) if !registry.contains(stream_id) => return,
            Ok(_) => emitter.push(stream_id, Bytes::from(buf)).await,
            Err(e) => {
                tracing::warn!(stream_id, "blob source read failed: {}", e);
                let reason = format!("Read error: {e}");
                // Detach without aborting this task before notifying.
                if registry.lock().remove(&stream_id).is_some() {
                    if let Err(e) = emitter.abort(stream_id, reason).await {
                        tracing::warn!(stream_id, "failed to send stream abort: {}", e);
                    }
                }
                return;
            }
        };

        if let Err(e) = sent {
            tracing::debug!(stream_id, "failed to send stream chunk: {}", e);
            registry.remove(stream_id);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Emitted {
        Push(u32, Bytes),
        End(u32),
        Abort(u32, String),
    }

    struct ChannelEmitter(mpsc::UnboundedSender<Emitted>);

    impl StreamEmitter for ChannelEmitter {
        fn push(&self, stream_id: u32, chunk: Bytes) -> BoxFuture<'_, Result<()>> {
            let _ = self.0.send(Emitted::Push(stream_id, chunk));
            Box::pin(async { Ok(()) })
        }

        fn end(&self, stream_id: u32) -> BoxFuture<'_, Result<()>> {
            let _ = self.0.send(Emitted::End(stream_id));
            Box::pin(async { Ok(()) })
        }

        fn abort(&self, stream_id: u32, reason: String) -> BoxFuture<'_, Result<()>> {
            let _ = self.0.send(Emitted::Abort(stream_id, reason));
            Box::pin(async { Ok(()) })
        }
    }

    fn setup() -> (
        OutgoingStreams,
        Arc<dyn StreamEmitter>,
        mpsc::UnboundedReceiver<Emitted>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutgoingStreams::new(), Arc::new(ChannelEmitter(tx)), rx)
    }

    struct FailingReader;

    impl tokio::io::AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("disk gone")))
        }
    }

    #[tokio::test]
    async fn test_oversized_pull_is_capped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let streams = OutgoingStreams::for_frame_size(16 + STREAM_PUSH_HEADER_SIZE);
        assert_eq!(streams.max_chunk_size(), 16);
        streams
            .add(
                1,
                10,
                ProtocolBlob::from_bytes(vec![3u8; 100]),
                Arc::new(ChannelEmitter(tx)),
            )
            .unwrap();

        assert!(streams.pull(10, u32::MAX));
        match rx.recv().await.unwrap() {
            Emitted::Push(10, chunk) => assert_eq!(chunk.len(), 16),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_default_cap_fits_default_frame() {
        let streams = OutgoingStreams::new();
        assert_eq!(
            streams.max_chunk_size() + STREAM_PUSH_HEADER_SIZE,
            DEFAULT_MAX_FRAME_SIZE
        );
    }

    #[tokio::test]
    async fn test_starts_paused() {
        let (streams, emitter, mut rx) = setup();
        streams
            .add(1, 10, ProtocolBlob::from_bytes(&b"data"[..]), emitter)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(streams.state(10), Some(StreamState::Created));
    }

    #[tokio::test]
    async fn test_pull_reads_requested_size_then_ends() {
        let (streams, emitter, mut rx) = setup();
        streams
            .add(1, 10, ProtocolBlob::from_bytes(&b"abcdef"[..]), emitter)
            .unwrap();

        assert!(streams.pull(10, 4));
        assert_eq!(
            rx.recv().await.unwrap(),
            Emitted::Push(10, Bytes::from_static(b"abcd"))
        );
        assert_eq!(streams.state(10), Some(StreamState::Active));

        streams.pull(10, 4);
        assert_eq!(
            rx.recv().await.unwrap(),
            Emitted::Push(10, Bytes::from_static(b"ef"))
        );

        streams.pull(10, 4);
        assert_eq!(rx.recv().await.unwrap(), Emitted::End(10));
        assert!(!streams.contains(10));
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let (streams, emitter, _rx) = setup();
        streams
            .add(1, 10, ProtocolBlob::from_text("a"), emitter.clone())
            .unwrap();
        let result = streams.add(1, 10, ProtocolBlob::from_text("b"), emitter);
        assert!(matches!(result, Err(CallwireError::DuplicateStream(10))));
    }

    #[tokio::test]
    async fn test_get_missing_is_error() {
        let (streams, _, _rx) = setup();
        assert!(matches!(
            streams.get(3),
            Err(CallwireError::StreamNotFound(3))
        ));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_noops() {
        let (streams, emitter, mut rx) = setup();
        streams
            .add(1, 10, ProtocolBlob::from_text("a"), emitter)
            .unwrap();
        assert!(streams.abort(10, "gone"));

        assert!(!streams.pull(10, 1));
        assert!(!streams.end(10));
        assert!(!streams.abort(10, "again"));
        assert!(!streams.remove(10));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_error_aborts_and_notifies() {
        let (streams, emitter, mut rx) = setup();
        let blob = ProtocolBlob::from_reader(FailingReader, BlobMetadata::default()).unwrap();
        streams.add(1, 10, blob, emitter).unwrap();

        streams.pull(10, 8);
        match rx.recv().await.unwrap() {
            Emitted::Abort(10, reason) => assert!(reason.contains("disk gone")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!streams.contains(10));
    }

    #[tokio::test]
    async fn test_abort_call_and_close() {
        let (streams, emitter, _rx) = setup();
        for (call, id) in [(1, 10), (1, 11), (2, 12)] {
            streams
                .add(call, id, ProtocolBlob::from_text("x"), emitter.clone())
                .unwrap();
        }

        assert_eq!(streams.find_by_call(1), vec![10, 11]);
        assert_eq!(streams.abort_call(1, "call aborted"), vec![10, 11]);
        assert_eq!(streams.len(), 1);

        assert_eq!(streams.close("closed"), vec![12]);
        assert!(streams.is_empty());
    }
}
