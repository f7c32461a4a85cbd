//! Binary blobs carried next to call payloads.
//!
//! A blob travels as its own stream, referenced from the payload by id:
//!
//! - [`ProtocolBlob`] is the sending side: metadata plus an `AsyncRead`
//!   source that is read one pull at a time.
//! - [`BlobReader`] is the receiving side: it asks the peer for data when
//!   its buffer is empty and yields chunks as they are pushed.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::error::{CallwireError, Result};

/// Content type used when none is given.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Default number of bytes requested per pull.
pub const DEFAULT_CHUNK_SIZE: u32 = 65535;

/// Descriptive metadata of a blob.
///
/// The declared size is advisory; the transfer ends when the source is
/// exhausted, whatever the size says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl Default for BlobMetadata {
    fn default() -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            size: None,
            filename: None,
        }
    }
}

/// Byte source of an outgoing blob.
pub type BlobSource = Box<dyn AsyncRead + Send + Unpin>;

/// A blob to be sent to the peer.
pub struct ProtocolBlob {
    metadata: BlobMetadata,
    source: BlobSource,
}

impl ProtocolBlob {
    /// Blob backed by an arbitrary reader.
    ///
    /// A declared size of zero is rejected; leave the size unset when it is
    /// unknown.
    pub fn from_reader<R>(reader: R, metadata: BlobMetadata) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if metadata.size == Some(0) {
            return Err(CallwireError::InvalidValue(
                "Blob size must be greater than zero".into(),
            ));
        }
        Ok(Self {
            metadata,
            source: Box::new(reader),
        })
    }

    /// In-memory blob; the size is taken from the data.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let size = (!data.is_empty()).then_some(data.len() as u64);
        Self {
            metadata: BlobMetadata {
                size,
                ..BlobMetadata::default()
            },
            source: Box::new(std::io::Cursor::new(data)),
        }
    }

    /// In-memory UTF-8 text blob.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::from_bytes(text.into().into_bytes()).with_content_type("text/plain")
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.metadata.content_type = content_type.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.metadata.filename = Some(filename.into());
        self
    }

    pub fn metadata(&self) -> &BlobMetadata {
        &self.metadata
    }

    pub(crate) fn into_parts(self) -> (BlobMetadata, BlobSource) {
        (self.metadata, self.source)
    }
}

impl fmt::Debug for ProtocolBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolBlob")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Event delivered to a [`BlobReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlobEvent {
    Chunk(Bytes),
    End,
    Abort(String),
}

/// Called with the requested size whenever a reader needs more data.
pub type DemandHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Receiving end of a blob stream.
pub struct BlobReader {
    stream_id: u32,
    metadata: BlobMetadata,
    rx: mpsc::UnboundedReceiver<BlobEvent>,
    demand: DemandHook,
    chunk_size: u32,
    requested: bool,
    finished: bool,
}

impl BlobReader {
    pub(crate) fn new(
        stream_id: u32,
        metadata: BlobMetadata,
        rx: mpsc::UnboundedReceiver<BlobEvent>,
        demand: DemandHook,
        chunk_size: u32,
    ) -> Self {
        Self {
            stream_id,
            metadata,
            rx,
            demand,
            chunk_size,
            requested: false,
            finished: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn metadata(&self) -> &BlobMetadata {
        &self.metadata
    }

    /// Next chunk, `None` at the end of the stream.
    ///
    /// Sends one pull to the peer when nothing is buffered. An abort from
    /// either side surfaces as [`CallwireError::Aborted`].
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        let event = match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(mpsc::error::TryRecvError::Empty) => {
                if !self.requested {
                    self.requested = true;
                    (self.demand)(self.chunk_size);
                }
                self.rx.recv().await
            }
            Err(mpsc::error::TryRecvError::Disconnected) => None,
        };

        match event {
            Some(BlobEvent::Chunk(chunk)) => {
                self.requested = false;
                Ok(Some(chunk))
            }
            Some(BlobEvent::End) => {
                self.finished = true;
                Ok(None)
            }
            Some(BlobEvent::Abort(reason)) => {
                self.finished = true;
                Err(CallwireError::Aborted(reason))
            }
            None => {
                self.finished = true;
                Err(CallwireError::ConnectionClosed)
            }
        }
    }

    /// Read the whole blob into memory.
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let capacity = self.metadata.size.unwrap_or(0).min(16 * 1024 * 1024) as usize;
        let mut buf = BytesMut::with_capacity(capacity);
        while let Some(chunk) = self.next_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Read the whole blob as UTF-8 text.
    pub async fn text(self) -> Result<String> {
        let bytes = self.read_to_end().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CallwireError::InvalidValue(format!("Blob is not UTF-8: {e}")))
    }
}

impl fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobReader")
            .field("stream_id", &self.stream_id)
            .field("metadata", &self.metadata)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn reader_with_counter() -> (
        BlobReader,
        mpsc::UnboundedSender<BlobEvent>,
        Arc<AtomicU32>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pulls = Arc::new(AtomicU32::new(0));
        let counter = pulls.clone();
        let demand: DemandHook = Arc::new(move |_size| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let reader = BlobReader::new(1, BlobMetadata::default(), rx, demand, 16);
        (reader, tx, pulls)
    }

    #[test]
    fn test_metadata_serialization() {
        let metadata = BlobMetadata {
            content_type: "image/png".into(),
            size: Some(1024),
            filename: Some("a.png".into()),
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["type"], "image/png");
        assert_eq!(value["size"], 1024);

        let minimal = serde_json::to_value(BlobMetadata::default()).unwrap();
        assert!(minimal.get("size").is_none());
        assert!(minimal.get("filename").is_none());
    }

    #[test]
    fn test_from_bytes_sets_size() {
        let blob = ProtocolBlob::from_bytes(&b"hello"[..]);
        assert_eq!(blob.metadata().size, Some(5));
        assert_eq!(blob.metadata().content_type, DEFAULT_CONTENT_TYPE);

        let empty = ProtocolBlob::from_bytes(Bytes::new());
        assert_eq!(empty.metadata().size, None);
    }

    #[test]
    fn test_from_text_and_builders() {
        let blob = ProtocolBlob::from_text("hi").with_filename("hi.txt");
        assert_eq!(blob.metadata().content_type, "text/plain");
        assert_eq!(blob.metadata().filename.as_deref(), Some("hi.txt"));
    }

    #[test]
    fn test_zero_size_rejected() {
        let metadata = BlobMetadata {
            size: Some(0),
            ..BlobMetadata::default()
        };
        let result = ProtocolBlob::from_reader(tokio::io::empty(), metadata);
        assert!(matches!(result, Err(CallwireError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn test_reader_pulls_once_per_chunk() {
        let (mut reader, tx, pulls) = reader_with_counter();

        tx.send(BlobEvent::Chunk(Bytes::from_static(b"ab"))).unwrap();
        // Already buffered: no pull needed
        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "ab");
        assert_eq!(pulls.load(Ordering::SeqCst), 0);

        let task = tokio::spawn(async move {
            let chunk = reader.next_chunk().await.unwrap();
            (reader, chunk)
        });
        tokio::task::yield_now().await;
        tx.send(BlobEvent::Chunk(Bytes::from_static(b"cd"))).unwrap();

        let (_reader, chunk) = task.await.unwrap();
        assert_eq!(chunk.unwrap(), "cd");
        assert_eq!(pulls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reader_end_and_abort() {
        let (mut reader, tx, _) = reader_with_counter();
        tx.send(BlobEvent::End).unwrap();
        assert!(reader.next_chunk().await.unwrap().is_none());
        assert!(reader.next_chunk().await.unwrap().is_none());

        let (mut reader, tx, _) = reader_with_counter();
        tx.send(BlobEvent::Abort("Pull timeout".into())).unwrap();
        match reader.next_chunk().await {
            Err(CallwireError::Aborted(reason)) => assert_eq!(reason, "Pull timeout"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reader_disconnected() {
        let (mut reader, tx, _) = reader_with_counter();
        drop(tx);
        assert!(matches!(
            reader.next_chunk().await,
            Err(CallwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_to_end() {
        let (reader, tx, _) = reader_with_counter();
        tx.send(BlobEvent::Chunk(Bytes::from_static(b"hello "))).unwrap();
        tx.send(BlobEvent::Chunk(Bytes::from_static(b"world"))).unwrap();
        tx.send(BlobEvent::End).unwrap();

        assert_eq!(reader.text().await.unwrap(), "hello world");
    }
}
