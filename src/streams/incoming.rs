//! Registry of blobs this side consumes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::StreamState;
use crate::blob::{BlobEvent, BlobMetadata, BlobReader, DemandHook};
use crate::error::{CallwireError, Result};

/// Result of delivering a pushed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// No such stream; the push is ignored.
    UnknownStream,
    /// The reader was dropped; the stream has been removed.
    ReaderGone,
}

struct IncomingEntry {
    call_id: u32,
    metadata: BlobMetadata,
    tx: mpsc::UnboundedSender<BlobEvent>,
    demand: DemandHook,
    state: StreamState,
}

/// Consumer-side blob stream registry.
#[derive(Clone, Default)]
pub struct IncomingStreams {
    entries: Arc<Mutex<HashMap<u32, IncomingEntry>>>,
}

impl IncomingStreams {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, IncomingEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the peer's stream and return its reader.
    ///
    /// `demand` is invoked with `chunk_size` whenever the reader runs dry.
    pub fn add(
        &self,
        call_id: u32,
        stream_id: u32,
        metadata: BlobMetadata,
        demand: DemandHook,
        chunk_size: u32,
    ) -> Result<BlobReader> {
        let mut entries = self.lock();
        if entries.contains_key(&stream_id) {
            return Err(CallwireError::DuplicateStream(stream_id));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        entries.insert(
            stream_id,
            IncomingEntry {
                call_id,
                metadata: metadata.clone(),
                tx,
                demand: demand.clone(),
                state: StreamState::Created,
            },
        );
        tracing::debug!(stream_id, call_id, "incoming stream added");
        Ok(BlobReader::new(stream_id, metadata, rx, demand, chunk_size))
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

    /// Deliver a chunk pushed by the peer.
    pub fn push(&self, stream_id: u32, chunk: Bytes) -> PushOutcome {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&stream_id) else {
            return PushOutcome::UnknownStream;
        };
        entry.state = StreamState::Active;
        if entry.tx.send(BlobEvent::Chunk(chunk)).is_ok() {
            return PushOutcome::Delivered;
        }
        entries.remove(&stream_id);
        tracing::debug!(stream_id, "incoming stream reader dropped");
        PushOutcome::ReaderGone
    }

    /// Ask the peer for up to `size` more bytes.
    ///
    /// Readers do this on their own when they run dry. Returns `false` for
    /// an unknown stream.
    pub fn pull(&self, stream_id: u32, size: u32) -> bool {
        let demand = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(&stream_id) else {
                return false;
            };
            entry.state = StreamState::Active;
            entry.demand.clone()
        };
        demand(size);
        true
    }

    /// The peer finished the stream.
    pub fn end(&self, stream_id: u32) -> bool {
        match self.lock().remove(&stream_id) {
            Some(entry) => {
                let _ = entry.tx.send(BlobEvent::End);
                tracing::debug!(stream_id, "incoming stream ended");
                true
            }
            None => false,
        }
    }

    /// Abort a stream; the reader observes `reason`.
    pub fn abort(&self, stream_id: u32, reason: &str) -> bool {
        match self.lock().remove(&stream_id) {
            Some(entry) => {
                let _ = entry.tx.send(BlobEvent::Abort(reason.to_string()));
                tracing::debug!(stream_id, reason, "incoming stream aborted");
                true
            }
            None => false,
        }
    }

    /// Drop a stream; its reader sees a closed connection.
    pub fn remove(&self, stream_id: u32) -> bool {
        self.lock().remove(&stream_id).is_some()
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
        self.find_by_call(call_id)
            .into_iter()
            .filter(|id| self.abort(*id, reason))
            .collect()
    }

    /// Abort every stream, returning their ids.
    pub fn close(&self, reason: &str) -> Vec<u32> {
        let drained: Vec<(u32, IncomingEntry)> = self.lock().drain().collect();
        let mut ids = Vec::with_capacity(drained.len());
        for (id, entry) in drained {
            let _ = entry.tx.send(BlobEvent::Abort(reason.to_string()));
            ids.push(id);
        }
        if !ids.is_empty() {
            tracing::debug!(count = ids.len(), reason, "incoming streams closed");
        }
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noop_demand() -> DemandHook {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn test_push_end_delivers_to_reader() {
        let streams = IncomingStreams::new();
        let reader = streams
            .add(1, 5, BlobMetadata::default(), noop_demand(), 1024)
            .unwrap();

        assert_eq!(
            streams.push(5, Bytes::from_static(b"hello")),
            PushOutcome::Delivered
        );
        assert_eq!(streams.state(5), Some(StreamState::Active));
        assert!(streams.end(5));
        assert!(!streams.contains(5));

        assert_eq!(reader.read_to_end().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_demand_hook_receives_chunk_size() {
        let streams = IncomingStreams::new();
        let requested = Arc::new(AtomicU32::new(0));
        let seen = requested.clone();
        let mut reader = streams
            .add(
                1,
                5,
                BlobMetadata::default(),
                Arc::new(move |size| seen.store(size, Ordering::SeqCst)),
                512,
            )
            .unwrap();

        let task = tokio::spawn(async move { reader.next_chunk().await });
        tokio::task::yield_now().await;
        assert_eq!(requested.load(Ordering::SeqCst), 512);

        streams.push(5, Bytes::from_static(b"x"));
        assert_eq!(task.await.unwrap().unwrap().unwrap(), "x");
    }

    #[test]
    fn test_pull_invokes_demand() {
        let streams = IncomingStreams::new();
        let requested = Arc::new(AtomicU32::new(0));
        let seen = requested.clone();
        let _reader = streams
            .add(
                1,
                5,
                BlobMetadata::default(),
                Arc::new(move |size| seen.store(size, Ordering::SeqCst)),
                512,
            )
            .unwrap();

        assert!(streams.pull(5, 100));
        assert_eq!(requested.load(Ordering::SeqCst), 100);
        assert_eq!(streams.state(5), Some(StreamState::Active));
        assert!(!streams.pull(6, 100));
    }

    #[tokio::test]
    async fn test_abort_reaches_reader() {
        let streams = IncomingStreams::new();
        let mut reader = streams
            .add(1, 5, BlobMetadata::default(), noop_demand(), 1024)
            .unwrap();

        assert!(streams.abort(5, "Consume timeout"));
        match reader.next_chunk().await {
            Err(CallwireError::Aborted(reason)) => assert_eq!(reason, "Consume timeout"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_removed_stream_operations_are_noops() {
        let streams = IncomingStreams::new();
        let _reader = streams
            .add(1, 5, BlobMetadata::default(), noop_demand(), 1024)
            .unwrap();
        assert!(streams.remove(5));

        assert_eq!(
            streams.push(5, Bytes::from_static(b"late")),
            PushOutcome::UnknownStream
        );
        assert!(!streams.end(5));
        assert!(!streams.abort(5, "late"));
        assert!(!streams.pull(5, 64));
        assert!(!streams.remove(5));
    }

    #[test]
    fn test_duplicate_and_missing() {
        let streams = IncomingStreams::new();
        let _reader = streams
            .add(1, 5, BlobMetadata::default(), noop_demand(), 1024)
            .unwrap();

        assert!(matches!(
            streams.add(1, 5, BlobMetadata::default(), noop_demand(), 1024),
            Err(CallwireError::DuplicateStream(5))
        ));
        assert!(matches!(
            streams.get(6),
            Err(CallwireError::StreamNotFound(6))
        ));
        assert_eq!(streams.get(5).unwrap(), BlobMetadata::default());
    }

    #[test]
    fn test_push_to_dropped_reader() {
        let streams = IncomingStreams::new();
        let reader = streams
            .add(1, 5, BlobMetadata::default(), noop_demand(), 1024)
            .unwrap();
        drop(reader);

        assert_eq!(
            streams.push(5, Bytes::from_static(b"x")),
            PushOutcome::ReaderGone
        );
        assert!(!streams.contains(5));
    }

    #[test]
    fn test_abort_call_and_close() {
        let streams = IncomingStreams::new();
        let mut readers = Vec::new();
        for (call, id) in [(7, 1), (7, 2), (8, 3)] {
            readers.push(
                streams
                    .add(call, id, BlobMetadata::default(), noop_demand(), 1024)
                    .unwrap(),
            );
        }

        assert_eq!(streams.abort_call(7, "Call aborted"), vec![1, 2]);
        assert_eq!(streams.find_by_call(8), vec![3]);
        assert_eq!(streams.close("Connection closed"), vec![3]);
        assert!(streams.is_empty());
    }
}
