//! Client-side connection engine.
//!
//! The [`ClientBuilder`] configures the payload format, call timeout,
//! download chunk size and heartbeat. A [`ClientConnection`] then:
//! 1. Encodes calls, registering their uploads
//! 2. Routes server frames to pending calls, streaming results and blobs
//! 3. Rejects everything still pending when the connection closes
//!
//! # Example
//!
//! ```no_run
//! use callwire::ClientBuilder;
//! use futures_util::StreamExt;
//! use serde_json::json;
//!
//! # async fn run(stream: tokio::net::TcpStream) -> Result<(), callwire::ProtocolError> {
//! let client = ClientBuilder::new().connect_stream(stream);
//!
//! let users = client.call("users/list", json!({})).await?.into_value()?;
//! println!("{:?}", users);
//!
//! let mut counter = client.call("count", json!(3)).await?.into_stream()?;
//! while let Some(item) = counter.next().await {
//!     println!("{}", item?);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::blob::{BlobMetadata, BlobReader, DemandHook, ProtocolBlob, DEFAULT_CHUNK_SIZE};
use crate::cancel::{CancelSignal, CONNECTION_CLOSED};
use crate::codec::{DecodeRpcContext, EncodeRpcContext, MsgPackFormat, PayloadFormat};
use crate::error::{CallwireError, ErrorCode, ProtocolError, Result};
use crate::ids::IdGenerator;
use crate::protocol::{ClientMessage, MessageCodec, ProtocolVersion, ResponseBody, ServerMessage};
use crate::rpc::PendingCalls;
use crate::server::ConnectOptions;
use crate::streams::{IncomingStreams, OutgoingStreams, PushOutcome, StreamEmitter};
use crate::transport::{
    spawn_writer_task, FrameSink, FramedReader, WriterConfig, DEFAULT_MAX_FRAME_SIZE,
};
use crate::value::{IncomingValue, OutgoingValue};

/// Default interval between heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(15000);

/// Default time to wait for a heartbeat pong.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(5000);

const CALL_TIMEOUT: &str = "Call timeout";
const UNDECODABLE_RESPONSE: &str = "Unable to decode response";
const HEARTBEAT_TIMEOUT: &str = "Heartbeat timeout";
const UNKNOWN_CALL: &str = "Call not found";

/// Heartbeat settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

/// Per-call options for [`ClientConnection::call_with`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the connection's default call timeout.
    pub timeout: Option<Duration>,
    /// Aborts the call when fired.
    pub signal: Option<CancelSignal>,
}

impl CallOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn signal(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Builder for a [`ClientConnection`].
pub struct ClientBuilder {
    format: Arc<dyn PayloadFormat>,
    version: ProtocolVersion,
    call_timeout: Option<Duration>,
    chunk_size: u32,
    writer_config: WriterConfig,
    heartbeat: Option<HeartbeatConfig>,
    max_frame_size: u32,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            format: Arc::new(MsgPackFormat),
            version: ProtocolVersion::default(),
            call_timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            writer_config: WriterConfig::default(),
            heartbeat: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Payload format; the gateway must open the connection with it, see
    /// [`connect_options`](Self::connect_options).
    ///
    /// Default: MessagePack
    pub fn format(mut self, format: impl PayloadFormat) -> Self {
        self.format = Arc::new(format);
        self
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    /// Timeout applied to calls without their own.
    ///
    /// Default: none
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Bytes requested per download pull.
    ///
    /// Default: 65535
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size;
        self
    }

    /// Writer settings for [`connect_stream`](Self::connect_stream).
    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.writer_config = config;
        self
    }

    /// Ping the server periodically and close the connection when a pong
    /// is missed.
    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.heartbeat = Some(config);
        self
    }

    /// Largest frame accepted by [`connect_stream`](Self::connect_stream).
    /// Upload chunks are capped so their push frames stay within it.
    ///
    /// Default: 64 MiB
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// What to announce to the gateway so it opens the connection with
    /// this client's protocol version and payload format.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::new()
            .with_protocol_version(self.version as u8)
            .with_content_type(self.format.content_type())
    }

    /// Connect over an existing transport.
    ///
    /// Received frames must be fed to [`ClientConnection::handle_frame`]
    /// in arrival order. Must be called within a Tokio runtime.
    pub fn connect(self, sink: Arc<dyn FrameSink>) -> ClientConnection {
        let connection = ClientConnection {
            inner: Arc::new(ClientInner {
                format: self.format,
                codec: self.version.codec(),
                sink,
                call_timeout: self.call_timeout,
                chunk_size: self.chunk_size,
                calls: PendingCalls::new(),
                rpc_streams: Mutex::new(HashMap::new()),
                uploads: OutgoingStreams::for_frame_size(self.max_frame_size),
                downloads: IncomingStreams::new(),
                upload_ids: Mutex::new(IdGenerator::default()),
                pings: Mutex::new(PingTable::default()),
                signal: CancelSignal::new(),
                closed: AtomicBool::new(false),
            }),
        };

        if let Some(config) = self.heartbeat {
            tokio::spawn(heartbeat(Arc::downgrade(&connection.inner), config));
        }
        tracing::debug!("client connected");
        connection
    }

    /// Connect over a byte stream using length-prefixed frames.
    ///
    /// A reader task feeds received frames to the connection and closes it
    /// when the stream ends.
    pub fn connect_stream<S>(self, stream: S) -> ClientConnection
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, _writer_task) = spawn_writer_task(write_half, self.writer_config.clone());
        let max_frame_size = self.max_frame_size;
        let connection = self.connect(Arc::new(writer));

        let reader_connection = connection.clone();
        tokio::spawn(async move {
            let mut reader = FramedReader::new(read_half, max_frame_size);
            let signal = reader_connection.inner.signal.clone();
            let result = loop {
                let frame = tokio::select! {
                    _ = signal.cancelled() => break Ok(()),
                    frame = reader.next_frame() => frame,
                };
                match frame {
                    Ok(Some(frame)) => {
                        if let Err(e) = reader_connection.handle_frame(frame).await {
                            break Err(e);
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            if let Err(e) = result {
                tracing::error!("Read loop error: {}", e);
            }
            reader_connection.close(CONNECTION_CLOSED);
        });

        connection
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a successful call.
#[derive(Debug)]
pub enum CallResponse {
    Plain(IncomingValue),
    Stream(RpcStream),
}

impl CallResponse {
    pub fn is_stream(&self) -> bool {
        matches!(self, CallResponse::Stream(_))
    }

    /// The plain result; a streaming result is an error.
    pub fn into_value(self) -> std::result::Result<IncomingValue, ProtocolError> {
        match self {
            CallResponse::Plain(value) => Ok(value),
            CallResponse::Stream(_) => Err(ProtocolError::new(
                ErrorCode::ClientRequestError,
                "Expected a plain result, got a stream",
            )),
        }
    }

    /// The streaming result; a plain result is an error.
    pub fn into_stream(self) -> std::result::Result<RpcStream, ProtocolError> {
        match self {
            CallResponse::Stream(stream) => Ok(stream),
            CallResponse::Plain(_) => Err(ProtocolError::new(
                ErrorCode::ClientRequestError,
                "Expected a stream, got a plain result",
            )),
        }
    }
}

enum StreamEvent {
    Chunk(std::result::Result<serde_json::Value, ProtocolError>),
    End,
    Abort(Option<String>),
}

/// Streaming result of a call.
///
/// The first chunk is sent by the server unrequested; every later chunk is
/// requested with one pull when the previous one has been taken. Dropping
/// an unfinished stream aborts the call.
pub struct RpcStream {
    call_id: u32,
    connection: ClientConnection,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    pull_due: bool,
    finished: bool,
}

impl RpcStream {
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for RpcStream {
    type Item = std::result::Result<serde_json::Value, ProtocolError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        if this.pull_due {
            this.pull_due = false;
            this.connection.send_now(ClientMessage::RpcPull {
                call_id: this.call_id,
            });
        }

        let event = match this.rx.poll_recv(cx) {
            Poll::Ready(event) => event,
            Poll::Pending => return Poll::Pending,
        };
        Poll::Ready(match event {
            Some(StreamEvent::Chunk(chunk)) => {
                this.pull_due = true;
                Some(chunk)
            }
            Some(StreamEvent::End) => {
                this.finished = true;
                None
            }
            Some(StreamEvent::Abort(reason)) => {
                this.finished = true;
                Some(Err(ProtocolError::new(
                    ErrorCode::InternalServerError,
                    reason.unwrap_or_else(|| "Stream aborted".to_string()),
                )))
            }
            None => {
                this.finished = true;
                Some(Err(ProtocolError::new(
                    ErrorCode::ConnectionError,
                    CONNECTION_CLOSED,
                )))
            }
        })
    }
}

impl Drop for RpcStream {
    fn drop(&mut self) {
        if self.finished || self.connection.is_closed() {
            return;
        }
        if self.connection.forget_stream(self.call_id) {
            tracing::debug!(call_id = self.call_id, "streaming result dropped early");
            self.connection.send_now(ClientMessage::RpcAbort {
                call_id: self.call_id,
                reason: None,
            });
        }
    }
}

impl fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcStream")
            .field("call_id", &self.call_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct PingTable {
    pending: HashMap<u32, oneshot::Sender<()>>,
    nonces: IdGenerator,
}

struct ClientInner {
    format: Arc<dyn PayloadFormat>,
    codec: &'static dyn MessageCodec,
    sink: Arc<dyn FrameSink>,
    call_timeout: Option<Duration>,
    chunk_size: u32,
    calls: PendingCalls<CallResponse>,
    rpc_streams: Mutex<HashMap<u32, mpsc::UnboundedSender<StreamEvent>>>,
    uploads: OutgoingStreams,
    downloads: IncomingStreams,
    upload_ids: Mutex<IdGenerator>,
    pings: Mutex<PingTable>,
    signal: CancelSignal,
    closed: AtomicBool,
}

impl ClientInner {
    fn rpc_streams(&self) -> MutexGuard<'_, HashMap<u32, mpsc::UnboundedSender<StreamEvent>>> {
        self.rpc_streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pings(&self) -> MutexGuard<'_, PingTable> {
        self.pings.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Issuing side of a connection. Cheap to clone.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<ClientInner>,
}

impl ClientConnection {
    /// Call `procedure` with the connection's default options.
    pub async fn call(
        &self,
        procedure: &str,
        payload: impl Into<OutgoingValue>,
    ) -> std::result::Result<CallResponse, ProtocolError> {
        self.call_with(procedure, payload, CallOptions::default())
            .await
    }

    /// Call `procedure`.
    ///
    /// A timeout or a fired signal aborts the call on the server, aborts
    /// its uploads and rejects with `ClientRequestError`.
    pub async fn call_with(
        &self,
        procedure: &str,
        payload: impl Into<OutgoingValue>,
        options: CallOptions,
    ) -> std::result::Result<CallResponse, ProtocolError> {
        if self.is_closed() {
            return Err(connection_error(CONNECTION_CLOSED));
        }
        let calls = &self.inner.calls;
        let (call_id, response) = calls.register(procedure).ok_or_else(|| {
            ProtocolError::new(ErrorCode::ClientRequestError, "No call id available")
        })?;

        let mut uploads = UploadContext {
            connection: self,
            call_id,
        };
        let payload = match self.format().encode_rpc(payload.into(), &mut uploads) {
            Ok(payload) => payload,
            Err(e) => {
                calls.remove(call_id);
                self.inner.uploads.abort_call(call_id, "Encode failed");
                return Err(ProtocolError::new(ErrorCode::ClientRequestError, e.to_string()));
            }
        };

        tracing::debug!(call_id, procedure, "call sent");
        let sent = self
            .send(ClientMessage::Rpc {
                call_id,
                procedure: procedure.to_string(),
                payload,
            })
            .await;
        if let Err(e) = sent {
            calls.remove(call_id);
            self.inner.uploads.abort_call(call_id, CONNECTION_CLOSED);
            return Err(connection_error(&e.to_string()));
        }

        let timeout = options.timeout.or(self.inner.call_timeout);
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async {
            match &options.signal {
                Some(signal) => signal.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let abort_reason = tokio::select! {
            outcome = response => {
                return match outcome {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(error)) => {
                        self.abort_uploads(call_id, &error.message);
                        Err(error)
                    }
                    Err(_) => Err(connection_error(CONNECTION_CLOSED)),
                };
            }
            _ = deadline => CALL_TIMEOUT.to_string(),
            _ = cancelled => options
                .signal
                .as_ref()
                .and_then(CancelSignal::reason)
                .unwrap_or_else(|| crate::cancel::CALL_ABORTED.to_string()),
        };

        self.abort_call(call_id, &abort_reason);
        Err(ProtocolError::new(ErrorCode::ClientRequestError, abort_reason))
    }

    /// Round-trip a ping, failing with [`CallwireError::HeartbeatTimeout`]
    /// when no pong arrives in time.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(CallwireError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        let nonce = {
            let mut pings = self.inner.pings();
            let PingTable { pending, nonces } = &mut *pings;
            let nonce = nonces
                .next_unused(|n| pending.contains_key(&n))
                .ok_or_else(|| CallwireError::InvalidValue("No ping nonce available".into()))?;
            pending.insert(nonce, tx);
            nonce
        };

        if let Err(e) = self.send(ClientMessage::Ping { nonce }).await {
            self.inner.pings().pending.remove(&nonce);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CallwireError::ConnectionClosed),
            Err(_) => {
                self.inner.pings().pending.remove(&nonce);
                Err(CallwireError::HeartbeatTimeout)
            }
        }
    }

    /// Route one received frame.
    ///
    /// Returns an error only when the frame was fatal; the connection is
    /// closed by then.
    pub async fn handle_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let message = match self.inner.codec.decode_server(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("undecodable frame: {}", e);
                self.close(CONNECTION_CLOSED);
                return Err(e);
            }
        };
        tracing::trace!(kind = ?message.message_type(), "frame received");

        match message {
            ServerMessage::RpcResponse { call_id, body } => self.on_response(call_id, body),
            ServerMessage::RpcStreamResponse { call_id, error } => {
                self.on_stream_response(call_id, error)
            }
            ServerMessage::RpcStreamChunk { call_id, chunk } => {
                let chunk = self
                    .format()
                    .decode(&chunk)
                    .map_err(|_| ProtocolError::new(ErrorCode::ClientRequestError, UNDECODABLE_RESPONSE));
                self.emit_stream_event(call_id, StreamEvent::Chunk(chunk), false);
            }
            ServerMessage::RpcStreamEnd { call_id } => {
                self.emit_stream_event(call_id, StreamEvent::End, true);
            }
            ServerMessage::RpcStreamAbort { call_id, reason } => {
                self.emit_stream_event(call_id, StreamEvent::Abort(reason), true);
            }
            ServerMessage::ServerStreamPush { stream_id, chunk } => {
                match self.inner.downloads.push(stream_id, chunk) {
                    PushOutcome::Delivered => {}
                    PushOutcome::ReaderGone => self.send_now(ClientMessage::ServerStreamAbort {
                        stream_id,
                        reason: None,
                    }),
                    PushOutcome::UnknownStream => {
                        tracing::trace!(stream_id, "push for unknown download ignored");
                    }
                }
            }
            ServerMessage::ServerStreamEnd { stream_id } => {
                self.inner.downloads.end(stream_id);
            }
            ServerMessage::ServerStreamAbort { stream_id, reason } => {
                self.inner
                    .downloads
                    .abort(stream_id, reason.as_deref().unwrap_or("Stream aborted"));
            }
            ServerMessage::ClientStreamAbort { stream_id, reason } => {
                self.inner
                    .uploads
                    .abort(stream_id, reason.as_deref().unwrap_or("Stream aborted"));
            }
            ServerMessage::ClientStreamPull { stream_id, size } => {
                if !self.inner.uploads.pull(stream_id, size) {
                    tracing::trace!(stream_id, "pull for unknown upload ignored");
                }
            }
            ServerMessage::Ping { nonce } => {
                if let Err(e) = self.send(ClientMessage::Pong { nonce }).await {
                    tracing::warn!("failed to send pong: {}", e);
                }
            }
            ServerMessage::Pong { nonce } => {
                if let Some(tx) = self.inner.pings().pending.remove(&nonce) {
                    let _ = tx.send(());
                }
            }
        }
        Ok(())
    }

    /// Close the connection.
    ///
    /// Pending calls are rejected with `ConnectionError` carrying `reason`;
    /// streaming results, blob streams and pings are failed; call, stream
    /// and nonce counters restart. Closing twice is a no-op.
    pub fn close(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = &self.inner;
        inner.signal.cancel(reason);

        let calls = inner.calls.close(&connection_error(reason));
        let streams: Vec<_> = inner.rpc_streams().drain().collect();
        for (_, tx) in &streams {
            let _ = tx.send(StreamEvent::Abort(Some(reason.to_string())));
        }
        let uploads = inner.uploads.close(reason);
        let downloads = inner.downloads.close(reason);
        inner
            .upload_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
        {
            // Dropping the senders fails the waiting pings.
            let mut pings = inner.pings();
            pings.pending.clear();
            pings.nonces.reset();
        }

        tracing::debug!(
            reason,
            calls = calls.len(),
            streams = streams.len(),
            uploads = uploads.len(),
            downloads = downloads.len(),
            "client connection closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.signal.cancelled().await
    }

    /// Why the connection was closed.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.signal.reason()
    }

    /// Calls awaiting their response.
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.len()
    }

    pub fn upload_count(&self) -> usize {
        self.inner.uploads.len()
    }

    pub fn download_count(&self) -> usize {
        self.inner.downloads.len()
    }

    fn format(&self) -> &dyn PayloadFormat {
        self.inner.format.as_ref()
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        let frame = self.inner.codec.encode_client(&message)?;
        self.inner.sink.send(frame).await
    }

    fn send_now(&self, message: ClientMessage) {
        let kind = message.message_type();
        let sent = self
            .inner
            .codec
            .encode_client(&message)
            .and_then(|frame| self.inner.sink.send_now(frame));
        if let Err(e) = sent {
            tracing::warn!(?kind, "failed to send frame: {}", e);
        }
    }

    fn on_response(&self, call_id: u32, body: ResponseBody) {
        let calls = &self.inner.calls;
        match body {
            ResponseBody::Err(body) => {
                let error = self
                    .format()
                    .decode(&body)
                    .map(ProtocolError::from_value)
                    .unwrap_or_else(|_| {
                        ProtocolError::new(ErrorCode::ClientRequestError, UNDECODABLE_RESPONSE)
                    });
                if !calls.reject(call_id, error) {
                    tracing::warn!(call_id, "late error response ignored");
                }
            }
            ResponseBody::Ok(body) => {
                if !calls.contains(call_id) {
                    tracing::warn!(call_id, "late response ignored");
                    self.decline_downloads(&body);
                    return;
                }

                let mut downloads = DownloadContext {
                    connection: self,
                    call_id,
                    added: Vec::new(),
                };
                let decoded = self.format().decode_rpc(&body, &mut downloads);
                let added = downloads.added;
                match decoded {
                    Ok(value) => {
                        if !calls.resolve(call_id, CallResponse::Plain(value)) {
                            self.abort_downloads(&added, UNKNOWN_CALL);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(call_id, "response decode failed: {}", e);
                        self.abort_downloads(&added, UNDECODABLE_RESPONSE);
                        calls.reject(
                            call_id,
                            ProtocolError::new(ErrorCode::ClientRequestError, UNDECODABLE_RESPONSE),
                        );
                    }
                }
            }
        }
    }

    fn on_stream_response(&self, call_id: u32, error: Option<Bytes>) {
        let calls = &self.inner.calls;
        if let Some(error) = error {
            let error = self
                .format()
                .decode(&error)
                .map(ProtocolError::from_value)
                .unwrap_or_else(|_| {
                    ProtocolError::new(ErrorCode::ClientRequestError, UNDECODABLE_RESPONSE)
                });
            if !calls.reject(call_id, error) {
                tracing::warn!(call_id, "late stream error ignored");
            }
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.rpc_streams().insert(call_id, tx);
        let stream = RpcStream {
            call_id,
            connection: self.clone(),
            rx,
            pull_due: false,
            finished: false,
        };
        if !calls.resolve(call_id, CallResponse::Stream(stream)) {
            // The dropped stream aborts the call.
            tracing::warn!(call_id, "stream opened for unknown call");
        }
    }

    fn emit_stream_event(&self, call_id: u32, event: StreamEvent, last: bool) {
        let mut streams = self.inner.rpc_streams();
        let delivered = match streams.get(&call_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                tracing::trace!(call_id, "event for unknown stream ignored");
                return;
            }
        };
        if last || !delivered {
            streams.remove(&call_id);
        }
    }

    /// Stop tracking a streaming result. Returns `false` if already done.
    fn forget_stream(&self, call_id: u32) -> bool {
        self.inner.rpc_streams().remove(&call_id).is_some()
    }

    fn abort_call(&self, call_id: u32, reason: &str) {
        tracing::debug!(call_id, reason, "call aborted");
        self.inner.calls.remove(call_id);
        self.forget_stream(call_id);
        self.send_now(ClientMessage::RpcAbort {
            call_id,
            reason: Some(reason.to_string()),
        });
        self.abort_uploads(call_id, reason);
    }

    fn abort_uploads(&self, call_id: u32, reason: &str) {
        for stream_id in self.inner.uploads.abort_call(call_id, reason) {
            self.send_now(ClientMessage::ClientStreamAbort {
                stream_id,
                reason: Some(reason.to_string()),
            });
        }
    }

    fn abort_downloads(&self, stream_ids: &[u32], reason: &str) {
        for &stream_id in stream_ids {
            self.inner.downloads.abort(stream_id, reason);
            self.send_now(ClientMessage::ServerStreamAbort {
                stream_id,
                reason: Some(reason.to_string()),
            });
        }
    }

    /// Abort the downloads declared by a response nobody waits for.
    fn decline_downloads(&self, body: &[u8]) {
        let mut declined = DeclineContext::default();
        if self.format().decode_rpc(body, &mut declined).is_err() {
            return;
        }
        for stream_id in declined.stream_ids {
            self.send_now(ClientMessage::ServerStreamAbort {
                stream_id,
                reason: Some(UNKNOWN_CALL.to_string()),
            });
        }
    }

    fn request_download(&self, stream_id: u32, size: u32) {
        if self.inner.downloads.contains(stream_id) {
            self.send_now(ClientMessage::ServerStreamPull { stream_id, size });
        }
    }
}

async fn heartbeat(connection: Weak<ClientInner>, config: HeartbeatConfig) {
    loop {
        let signal = match connection.upgrade() {
            Some(inner) => inner.signal.clone(),
            None => return,
        };
        tokio::select! {
            _ = signal.cancelled() => return,
            _ = tokio::time::sleep(config.interval) => {}
        }

        let Some(inner) = connection.upgrade() else {
            return;
        };
        let client = ClientConnection { inner };
        if let Err(e) = client.ping(config.timeout).await {
            if !client.is_closed() {
                tracing::warn!("heartbeat failed: {}", e);
                client.close(HEARTBEAT_TIMEOUT);
            }
            return;
        }
    }
}

fn connection_error(message: &str) -> ProtocolError {
    ProtocolError::new(ErrorCode::ConnectionError, message)
}

/// Registers the uploads a call payload carries.
struct UploadContext<'a> {
    connection: &'a ClientConnection,
    call_id: u32,
}

impl EncodeRpcContext for UploadContext<'_> {
    fn add_stream(&mut self, blob: ProtocolBlob) -> Result<u32> {
        let inner = &self.connection.inner;
        let stream_id = inner
            .upload_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_unused(|id| inner.uploads.contains(id))
            .ok_or_else(|| CallwireError::InvalidValue("No upload stream id available".into()))?;

        let emitter: Arc<dyn StreamEmitter> = Arc::new(UploadEmitter {
            connection: Arc::downgrade(inner),
        });
        inner.uploads.add(self.call_id, stream_id, blob, emitter)?;
        Ok(stream_id)
    }
}

/// Registers the downloads a response declares.
struct DownloadContext<'a> {
    connection: &'a ClientConnection,
    call_id: u32,
    added: Vec<u32>,
}

impl DecodeRpcContext for DownloadContext<'_> {
    fn add_stream(&mut self, stream_id: u32, metadata: BlobMetadata) -> Result<BlobReader> {
        let inner = &self.connection.inner;
        let weak = Arc::downgrade(inner);
        let demand: DemandHook = Arc::new(move |size| {
            if let Some(inner) = weak.upgrade() {
                ClientConnection { inner }.request_download(stream_id, size);
            }
        });

        let reader = inner
            .downloads
            .add(self.call_id, stream_id, metadata, demand, inner.chunk_size)?;
        self.added.push(stream_id);
        Ok(reader)
    }
}

/// Collects declared stream ids without registering them.
#[derive(Default)]
struct DeclineContext {
    stream_ids: Vec<u32>,
}

impl DecodeRpcContext for DeclineContext {
    fn add_stream(&mut self, stream_id: u32, metadata: BlobMetadata) -> Result<BlobReader> {
        self.stream_ids.push(stream_id);
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(BlobReader::new(stream_id, metadata, rx, Arc::new(|_| {}), 0))
    }
}

/// Sends the frames of an upload pump.
struct UploadEmitter {
    connection: Weak<ClientInner>,
}

impl UploadEmitter {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        let inner = self
            .connection
            .upgrade()
            .ok_or(CallwireError::ConnectionClosed)?;
        ClientConnection { inner }.send(message).await
    }
}

impl StreamEmitter for UploadEmitter {
    fn push(&self, stream_id: u32, chunk: Bytes) -> BoxFuture<'_, Result<()>> {
        self.send(ClientMessage::ClientStreamPush { stream_id, chunk })
            .boxed()
    }

    fn end(&self, stream_id: u32) -> BoxFuture<'_, Result<()>> {
        self.send(ClientMessage::ClientStreamEnd { stream_id }).boxed()
    }

    fn abort(&self, stream_id: u32, reason: String) -> BoxFuture<'_, Result<()>> {
        self.send(ClientMessage::ClientStreamAbort {
            stream_id,
            reason: Some(reason),
        })
        .boxed()
    }
}
