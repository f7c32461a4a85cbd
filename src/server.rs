//! Server-side connection engine.
//!
//! A [`Gateway`] owns what every connection shares: the dispatcher, the
//! registered payload formats, stream timeouts and the gateway-wide
//! [`CallRegistry`]. Each accepted transport connection becomes a
//! [`ServerConnection`] speaking the protocol version and payload format
//! its client asked for in [`ConnectOptions`]:
//!
//! 1. Decode client frames with the connection's protocol codec
//! 2. Run every call on its own task under a child [`CancelSignal`]
//! 3. Encode outcomes back into responses, streaming chunks and downloads
//!
//! # Example
//!
//! ```no_run
//! use callwire::handler::ProcedureRegistry;
//! use callwire::{ConnectOptions, Gateway, ProtocolError};
//! use serde_json::json;
//!
//! # async fn run(stream: tokio::net::TcpStream) -> callwire::Result<()> {
//! let mut procedures = ProcedureRegistry::new();
//! procedures.typed("users/list", |_: serde_json::Value, _ctx| async {
//!     Ok::<_, ProtocolError>(json!({ "ok": true }))
//! });
//!
//! let gateway = Gateway::builder(procedures).build();
//! let options = ConnectOptions::new().with_content_type("application/json");
//! gateway.serve_with("conn-1", stream, options).await
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;

use crate::blob::{BlobMetadata, BlobReader, DemandHook, ProtocolBlob, DEFAULT_CHUNK_SIZE};
use crate::cancel::{CancelSignal, CONNECTION_CLOSED};
use crate::codec::{DecodeRpcContext, EncodeRpcContext, PayloadFormat, PayloadFormats};
use crate::error::{CallwireError, ErrorCode, ProtocolError, Result};
use crate::handler::{CallContext, CallOutcome, CallRequest, Dispatcher, ResultStream};
use crate::ids::IdGenerator;
use crate::protocol::{ClientMessage, MessageCodec, ProtocolVersion, ResponseBody, ServerMessage};
use crate::rpc::{CallRegistry, PullOutcome};
use crate::streams::{
    IncomingStreams, OutgoingStreams, PushOutcome, StreamEmitter, StreamTimeout,
    StreamTimeoutConfig, StreamTimeouts, TimeoutHandler,
};
use crate::transport::{
    spawn_writer_task, FrameSink, FramedReader, WriterConfig, DEFAULT_MAX_FRAME_SIZE,
};
use crate::value::OutgoingValue;

/// Default maximum calls executing at once across the gateway.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 256;

/// Reason sent when an upload's reader was dropped mid-transfer.
const READER_DROPPED: &str = "Stream consumer dropped";

/// What a client announced when opening its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Protocol version byte.
    ///
    /// Default: 1
    pub protocol_version: u8,
    /// Accepted payload content types, `None` for the gateway default.
    pub content_type: Option<String>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::default() as u8,
            content_type: None,
        }
    }
}

/// Builder for a [`Gateway`].
pub struct GatewayBuilder {
    dispatcher: Arc<dyn Dispatcher>,
    formats: PayloadFormats,
    stream_timeouts: StreamTimeoutConfig,
    writer_config: WriterConfig,
    max_frame_size: u32,
    max_concurrent_calls: usize,
    upload_chunk_size: u32,
}

impl GatewayBuilder {
    pub fn new(dispatcher: impl Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            formats: PayloadFormats::default(),
            stream_timeouts: StreamTimeoutConfig::default(),
            writer_config: WriterConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            upload_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Payload format for connections that do not ask for one.
    ///
    /// Default: MessagePack
    pub fn format(mut self, format: impl PayloadFormat) -> Self {
        self.formats.set_default(format);
        self
    }

    /// Another payload format clients may ask for by content type.
    ///
    /// JSON is registered by default.
    pub fn register_format(mut self, format: impl PayloadFormat) -> Self {
        self.formats.register(format);
        self
    }

    /// Consume, Pull and Finish deadlines for blob streams.
    pub fn stream_timeouts(mut self, config: StreamTimeoutConfig) -> Self {
        self.stream_timeouts = config;
        self
    }

    /// Writer settings for [`Gateway::serve`].
    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.writer_config = config;
        self
    }

    /// Largest frame accepted by [`Gateway::serve`].
    ///
    /// Default: 64 MiB
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Calls beyond this limit are refused with `ServiceUnavailable`.
    ///
    /// Default: 256
    pub fn max_concurrent_calls(mut self, limit: usize) -> Self {
        self.max_concurrent_calls = limit;
        self
    }

    /// Bytes requested per upload pull.
    ///
    /// Default: 65535
    pub fn upload_chunk_size(mut self, size: u32) -> Self {
        self.upload_chunk_size = size;
        self
    }

    pub fn build(self) -> Gateway {
        Gateway {
            inner: Arc::new(GatewayInner {
                dispatcher: self.dispatcher,
                formats: self.formats,
                stream_timeouts: self.stream_timeouts,
                writer_config: self.writer_config,
                max_frame_size: self.max_frame_size,
                upload_chunk_size: self.upload_chunk_size,
                calls: CallRegistry::new(),
                permits: Arc::new(Semaphore::new(self.max_concurrent_calls)),
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct GatewayInner {
    dispatcher: Arc<dyn Dispatcher>,
    formats: PayloadFormats,
    stream_timeouts: StreamTimeoutConfig,
    writer_config: WriterConfig,
    max_frame_size: u32,
    upload_chunk_size: u32,
    calls: CallRegistry,
    permits: Arc<Semaphore>,
    connections: Mutex<HashMap<Arc<str>, Weak<ConnectionInner>>>,
}

impl GatewayInner {
    fn connections(&self) -> MutexGuard<'_, HashMap<Arc<str>, Weak<ConnectionInner>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Serves calls for any number of connections. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn builder(dispatcher: impl Dispatcher) -> GatewayBuilder {
        GatewayBuilder::new(dispatcher)
    }

    /// Executing calls of every connection.
    pub fn calls(&self) -> &CallRegistry {
        &self.inner.calls
    }

    pub fn formats(&self) -> &PayloadFormats {
        &self.inner.formats
    }

    /// Connections still open.
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Open a connection with the default protocol version and format.
    pub fn open(
        &self,
        connection_id: impl Into<Arc<str>>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<ServerConnection> {
        self.open_with(connection_id, sink, ConnectOptions::default())
    }

    /// Open a connection whose frames are sent through `sink`.
    ///
    /// Received frames must be fed to [`ServerConnection::handle_frame`] in
    /// arrival order. Connection ids must be unique among open connections.
    /// An unknown protocol version fails with
    /// [`CallwireError::UnsupportedVersion`] and a content type matching no
    /// registered format with [`CallwireError::UnsupportedFormat`].
    pub fn open_with(
        &self,
        connection_id: impl Into<Arc<str>>,
        sink: Arc<dyn FrameSink>,
        options: ConnectOptions,
    ) -> Result<ServerConnection> {
        let codec = ProtocolVersion::try_from(options.protocol_version)?.codec();
        let format = self.inner.formats.resolve(options.content_type.as_deref())?;

        let id: Arc<str> = connection_id.into();
        let mut connections = self.inner.connections();
        // A dropped connection leaves a dead entry behind until replaced
        if connections
            .get(&id)
            .is_some_and(|weak| weak.strong_count() > 0)
        {
            return Err(CallwireError::InvalidValue(format!(
                "Connection id already open: {id}"
            )));
        }

        let gateway = self.inner.clone();
        let max_frame_size = gateway.max_frame_size;
        let config = gateway.stream_timeouts;
        let inner = Arc::new_cyclic(|weak: &Weak<ConnectionInner>| {
            let uploads_weak = weak.clone();
            let upload_handler: TimeoutHandler = Arc::new(move |stream_id, kind| {
                if let Some(inner) = uploads_weak.upgrade() {
                    ServerConnection { inner }.on_upload_timeout(stream_id, kind);
                }
            });
            let downloads_weak = weak.clone();
            let download_handler: TimeoutHandler = Arc::new(move |stream_id, kind| {
                if let Some(inner) = downloads_weak.upgrade() {
                    ServerConnection { inner }.on_download_timeout(stream_id, kind);
                }
            });

            ConnectionInner {
                id: id.clone(),
                gateway,
                codec,
                format,
                sink,
                signal: CancelSignal::new(),
                uploads: IncomingStreams::new(),
                downloads: OutgoingStreams::for_frame_size(max_frame_size),
                upload_timeouts: StreamTimeouts::new(config, upload_handler),
                download_timeouts: StreamTimeouts::new(config, download_handler),
                download_ids: Mutex::new(IdGenerator::default()),
                closed: AtomicBool::new(false),
            }
        });
        connections.insert(id.clone(), Arc::downgrade(&inner));
        tracing::debug!(
            connection_id = %id,
            version = ?codec.version(),
            content_type = inner.format.content_type(),
            "connection opened"
        );

        Ok(ServerConnection { inner })
    }

    /// Serve one connection with the default protocol version and format.
    pub async fn serve<S>(&self, connection_id: impl Into<Arc<str>>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.serve_with(connection_id, stream, ConnectOptions::default())
            .await
    }

    /// Serve one connection over a byte stream until it ends.
    ///
    /// Frames are length-prefixed. The connection is closed when the
    /// stream ends or a framing error occurs; the latter is returned, as
    /// are the errors of [`open_with`](Self::open_with).
    pub async fn serve_with<S>(
        &self,
        connection_id: impl Into<Arc<str>>,
        stream: S,
        options: ConnectOptions,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, _writer_task) =
            spawn_writer_task(write_half, self.inner.writer_config.clone());
        let connection = self.open_with(connection_id, Arc::new(writer), options)?;
        let mut reader = FramedReader::new(read_half, self.inner.max_frame_size);
        let signal = connection.signal().clone();

        // Also stops when the connection is closed elsewhere.
        let result = loop {
            let frame = tokio::select! {
                _ = signal.cancelled() => break Ok(()),
                frame = reader.next_frame() => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = connection.handle_frame(frame).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &result {
            tracing::error!(connection_id = connection.id(), "connection failed: {}", e);
        }
        connection.close(CONNECTION_CLOSED);
        result
    }

    /// Close every open connection.
    pub fn shutdown(&self) {
        let open: Vec<Arc<ConnectionInner>> = self
            .inner
            .connections()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for inner in open {
            ServerConnection { inner }.close(CONNECTION_CLOSED);
        }
    }
}

struct ConnectionInner {
    id: Arc<str>,
    gateway: Arc<GatewayInner>,
    codec: &'static dyn MessageCodec,
    format: Arc<dyn PayloadFormat>,
    sink: Arc<dyn FrameSink>,
    signal: CancelSignal,
    uploads: IncomingStreams,
    downloads: OutgoingStreams,
    upload_timeouts: StreamTimeouts,
    download_timeouts: StreamTimeouts,
    download_ids: Mutex<IdGenerator>,
    closed: AtomicBool,
}

impl ConnectionInner {
    /// Abort calls and streams, clear timers and leave the gateway.
    fn teardown(&self, reason: &str) {
        self.signal.cancel(reason);
        let calls = self.gateway.calls.close(&self.id);

        // Streams go first so a racing push sees them gone before timers clear
        let uploads = self.uploads.close(CONNECTION_CLOSED);
        let downloads = self.downloads.close(CONNECTION_CLOSED);
        self.upload_timeouts.clear_all();
        self.download_timeouts.clear_all();

        let mut connections = self.gateway.connections();
        if connections
            .get(&self.id)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), self))
        {
            connections.remove(&self.id);
        }
        drop(connections);

        tracing::debug!(
            connection_id = %self.id,
            reason,
            calls,
            uploads = uploads.len(),
            downloads = downloads.len(),
            "connection closed"
        );
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if !*self.closed.get_mut() {
            self.teardown("Connection dropped");
        }
    }
}

/// One client connection of a [`Gateway`]. Cheap to clone.
///
/// Dropping the last handle closes the connection.
#[derive(Clone)]
pub struct ServerConnection {
    inner: Arc<ConnectionInner>,
}

impl ServerConnection {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Fired when the connection closes; parent of every call signal.
    pub fn signal(&self) -> &CancelSignal {
        &self.inner.signal
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.inner.codec.version()
    }

    /// Content type of the payload format this connection speaks.
    pub fn content_type(&self) -> &'static str {
        self.inner.format.content_type()
    }

    /// Calls of this connection still executing.
    pub fn active_calls(&self) -> usize {
        self.inner.gateway.calls.count(&self.inner.id)
    }

    pub fn upload_count(&self) -> usize {
        self.inner.uploads.len()
    }

    pub fn download_count(&self) -> usize {
        self.inner.downloads.len()
    }

    /// Route one received frame.
    ///
    /// Returns an error only when the frame was fatal; the connection is
    /// closed by then.
    pub async fn handle_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            tracing::trace!(connection_id = self.id(), "frame after close dropped");
            return Ok(());
        }

        let message = match self.codec().decode_client(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(connection_id = self.id(), "undecodable frame: {}", e);
                self.close(CONNECTION_CLOSED);
                return Err(e);
            }
        };
        tracing::trace!(connection_id = self.id(), kind = ?message.message_type(), "frame received");

        match message {
            ClientMessage::Rpc {
                call_id,
                procedure,
                payload,
            } => self.start_call(call_id, procedure, payload).await,
            ClientMessage::RpcAbort { call_id, reason } => {
                let calls = &self.inner.gateway.calls;
                if !calls.abort(self.id(), call_id, reason.as_deref()) {
                    tracing::trace!(call_id, "abort for unknown call ignored");
                }
            }
            ClientMessage::RpcPull { call_id } => {
                if !self.inner.gateway.calls.release_pull(self.id(), call_id) {
                    tracing::trace!(call_id, "pull for unknown call ignored");
                }
            }
            ClientMessage::ClientStreamPush { stream_id, chunk } => {
                match self.inner.uploads.push(stream_id, chunk) {
                    PushOutcome::Delivered => self.inner.upload_timeouts.on_activity(stream_id),
                    PushOutcome::ReaderGone => {
                        self.inner.upload_timeouts.clear_stream(stream_id);
                        self.send_now(ServerMessage::ClientStreamAbort {
                            stream_id,
                            reason: Some(READER_DROPPED.to_string()),
                        });
                    }
                    PushOutcome::UnknownStream => {
                        tracing::trace!(stream_id, "push for unknown upload ignored");
                    }
                }
            }
            ClientMessage::ClientStreamEnd { stream_id } => {
                self.inner.upload_timeouts.clear_stream(stream_id);
                self.inner.uploads.end(stream_id);
            }
            ClientMessage::ClientStreamAbort { stream_id, reason } => {
                self.inner.upload_timeouts.clear_stream(stream_id);
                self.inner
                    .uploads
                    .abort(stream_id, reason.as_deref().unwrap_or("Stream aborted"));
            }
            ClientMessage::ServerStreamAbort { stream_id, reason } => {
                self.inner
                    .downloads
                    .abort(stream_id, reason.as_deref().unwrap_or("Stream aborted"));
                self.inner.download_timeouts.clear_stream(stream_id);
            }
            ClientMessage::ServerStreamPull { stream_id, size } => {
                if self.inner.downloads.pull(stream_id, size) {
                    self.inner.download_timeouts.on_activity(stream_id);
                }
            }
            ClientMessage::Ping { nonce } => {
                self.send(ServerMessage::Pong { nonce }).await;
            }
            ClientMessage::Pong { nonce } => {
                tracing::trace!(nonce, "pong received");
            }
        }
        Ok(())
    }

    /// Close the connection: abort its calls and streams, clear its timers.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.teardown(reason);
    }

    fn codec(&self) -> &'static dyn MessageCodec {
        self.inner.codec
    }

    fn format(&self) -> &dyn PayloadFormat {
        self.inner.format.as_ref()
    }

    async fn send(&self, message: ServerMessage) {
        let kind = message.message_type();
        let sent = match self.codec().encode_server(&message) {
            Ok(frame) => self.inner.sink.send(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::warn!(connection_id = self.id(), ?kind, "failed to send frame: {}", e);
        }
    }

    fn send_now(&self, message: ServerMessage) {
        let kind = message.message_type();
        let sent = self
            .codec()
            .encode_server(&message)
            .and_then(|frame| self.inner.sink.send_now(frame));
        if let Err(e) = sent {
            tracing::warn!(connection_id = self.id(), ?kind, "failed to send frame: {}", e);
        }
    }

    async fn start_call(&self, call_id: u32, procedure: String, payload: Bytes) {
        let signal = self.inner.signal.child();
        let calls = &self.inner.gateway.calls;
        calls.set(self.id(), call_id, signal.clone());
        tracing::debug!(connection_id = self.id(), call_id, procedure = %procedure, "call started");

        let mut uploads = UploadContext {
            connection: self,
            call_id,
            added: Vec::new(),
        };
        let decoded = self.format().decode_rpc(&payload, &mut uploads);
        let uploads = uploads.added;
        let payload = match decoded {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(call_id, "payload decode failed: {}", e);
                self.fail_uploads(&uploads, "Bad request");
                calls.delete(self.id(), call_id);
                let error = ProtocolError::new(ErrorCode::BadRequest, e.to_string());
                self.respond_error(call_id, error).await;
                return;
            }
        };

        let Ok(permit) = self.inner.gateway.permits.clone().try_acquire_owned() else {
            tracing::warn!(call_id, procedure = %procedure, "call capacity reached");
            self.fail_uploads(&uploads, "Service unavailable");
            calls.delete(self.id(), call_id);
            let error = ProtocolError::new(ErrorCode::ServiceUnavailable, "Too many calls");
            self.respond_error(call_id, error).await;
            return;
        };

        let request = CallRequest {
            procedure,
            payload,
            context: CallContext::new(self.inner.id.clone(), call_id, signal.clone()),
        };
        let call = ActiveCall {
            id: call_id,
            signal,
            uploads,
        };
        let connection = self.clone();
        tokio::spawn(async move {
            // Permit is held until the call completes
            let _permit = permit;
            connection.run_call(call, request).await;
        });
    }

    async fn run_call(&self, call: ActiveCall, request: CallRequest) {
        let call_id = call.id;
        let signal = &call.signal;
        let dispatch = self.inner.gateway.dispatcher.call(request);
        let outcome = tokio::select! {
            biased;
            _ = signal.cancelled() => None,
            outcome = dispatch => Some(outcome),
        };

        match outcome {
            None => self.on_call_cancelled(&call),
            Some(Ok(CallOutcome::Plain(value))) => self.respond_plain(&call, value).await,
            Some(Ok(CallOutcome::Stream(items))) => self.respond_stream(&call, items).await,
            Some(Err(_)) if signal.is_cancelled() => self.on_call_cancelled(&call),
            Some(Err(error)) => {
                self.finish_call(&call);
                self.respond_error(call_id, error).await;
            }
        }
        tracing::debug!(connection_id = self.id(), call_id, "call finished");
    }

    async fn respond_plain(&self, call: &ActiveCall, value: OutgoingValue) {
        let (call_id, signal) = (call.id, &call.signal);
        self.finish_call(call);

        let mut downloads = DownloadContext {
            connection: self,
            call_id,
            added: Vec::new(),
        };
        let encoded = self.format().encode_rpc(value, &mut downloads);
        let added = downloads.added;

        let body = match encoded {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(call_id, "result encode failed: {}", e);
                self.drop_downloads(&added, "Encode failed");
                let error = ProtocolError::new(ErrorCode::InternalServerError, e.to_string());
                self.respond_error(call_id, error).await;
                return;
            }
        };

        if signal.is_cancelled() {
            self.drop_downloads(&added, &signal.reason().unwrap_or_default());
            self.on_call_cancelled(call);
            return;
        }

        self.send(ServerMessage::RpcResponse {
            call_id,
            body: ResponseBody::Ok(body),
        })
        .await;
    }

    async fn respond_stream(&self, call: &ActiveCall, mut items: ResultStream) {
        let (call_id, signal) = (call.id, &call.signal);
        let calls = &self.inner.gateway.calls;
        calls.open_pull(self.id(), call_id);

        let first = tokio::select! {
            biased;
            _ = signal.cancelled() => None,
            item = items.next() => Some(item),
        };
        let Some(first) = first else {
            self.on_call_cancelled(call);
            return;
        };

        let mut next = match first {
            Some(Err(error)) => {
                self.finish_call(call);
                let error = self.encode_error(&error);
                self.send(ServerMessage::RpcStreamResponse {
                    call_id,
                    error: Some(error),
                })
                .await;
                return;
            }
            first => {
                self.send(ServerMessage::RpcStreamResponse {
                    call_id,
                    error: None,
                })
                .await;
                first
            }
        };

        loop {
            match next {
                None => {
                    self.finish_call(call);
                    self.send(ServerMessage::RpcStreamEnd { call_id }).await;
                    return;
                }
                Some(Err(error)) => {
                    self.finish_call(call);
                    self.send(ServerMessage::RpcStreamAbort {
                        call_id,
                        reason: Some(error.message),
                    })
                    .await;
                    return;
                }
                Some(Ok(chunk)) => {
                    let chunk = match self.format().encode(&chunk) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            self.finish_call(call);
                            self.send(ServerMessage::RpcStreamAbort {
                                call_id,
                                reason: Some(e.to_string()),
                            })
                            .await;
                            return;
                        }
                    };
                    self.send(ServerMessage::RpcStreamChunk { call_id, chunk }).await;
                }
            }

            match calls.await_pull(self.id(), call_id).await {
                Ok(PullOutcome::Pulled) => {}
                Ok(PullOutcome::Cancelled) | Err(_) => {
                    self.on_call_cancelled(call);
                    return;
                }
            }

            next = tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    self.on_call_cancelled(call);
                    return;
                }
                item = items.next() => item,
            };
        }
    }

    /// Forget a completed call. A cancelled call was already removed, and
    /// its id may belong to a newer call by now.
    fn finish_call(&self, call: &ActiveCall) {
        if !call.signal.is_cancelled() {
            self.inner.gateway.calls.delete(self.id(), call.id);
        }
    }

    async fn respond_error(&self, call_id: u32, error: ProtocolError) {
        let body = self.encode_error(&error);
        self.send(ServerMessage::RpcResponse {
            call_id,
            body: ResponseBody::Err(body),
        })
        .await;
    }

    fn encode_error(&self, error: &ProtocolError) -> Bytes {
        self.format()
            .encode(&error.to_value())
            .unwrap_or_else(|e| {
                tracing::warn!("error encode failed: {}", e);
                Bytes::new()
            })
    }

    /// A cancelled call sends nothing; its uploads are aborted locally.
    ///
    /// Only the streams the call declared are touched, so a newer call
    /// reusing its id keeps its own.
    fn on_call_cancelled(&self, call: &ActiveCall) {
        let reason = call.signal.reason().unwrap_or_default();
        tracing::debug!(connection_id = self.id(), call_id = call.id, reason = %reason, "call cancelled");

        for &stream_id in &call.uploads {
            if self.inner.uploads.abort(stream_id, &reason) {
                self.inner.upload_timeouts.clear_stream(stream_id);
            }
        }
    }

    /// Abort the uploads of a call that will not run, telling the client.
    fn fail_uploads(&self, stream_ids: &[u32], reason: &str) {
        for &stream_id in stream_ids {
            if !self.inner.uploads.abort(stream_id, reason) {
                continue;
            }
            self.inner.upload_timeouts.clear_stream(stream_id);
            self.send_now(ServerMessage::ClientStreamAbort {
                stream_id,
                reason: Some(reason.to_string()),
            });
        }
    }

    fn drop_downloads(&self, stream_ids: &[u32], reason: &str) {
        for &stream_id in stream_ids {
            self.inner.downloads.abort(stream_id, reason);
            self.inner.download_timeouts.clear_stream(stream_id);
        }
    }

    fn request_upload(&self, stream_id: u32, size: u32) {
        if !self.inner.uploads.contains(stream_id) {
            return;
        }
        self.inner.upload_timeouts.on_activity(stream_id);
        self.send_now(ServerMessage::ClientStreamPull { stream_id, size });
    }

    fn on_upload_timeout(&self, stream_id: u32, kind: StreamTimeout) {
        if self.inner.uploads.abort(stream_id, kind.reason()) {
            self.send_now(ServerMessage::ClientStreamAbort {
                stream_id,
                reason: Some(kind.reason().to_string()),
            });
        }
    }

    fn on_download_timeout(&self, stream_id: u32, kind: StreamTimeout) {
        if self.inner.downloads.abort(stream_id, kind.reason()) {
            self.send_now(ServerMessage::ServerStreamAbort {
                stream_id,
                reason: Some(kind.reason().to_string()),
            });
        }
    }
}

/// A call running on its own task.
struct ActiveCall {
    id: u32,
    signal: CancelSignal,
    /// Upload streams its payload declared.
    uploads: Vec<u32>,
}

/// Registers the uploads a call payload declares.
struct UploadContext<'a> {
    connection: &'a ServerConnection,
    call_id: u32,
    added: Vec<u32>,
}

impl DecodeRpcContext for UploadContext<'_> {
    fn add_stream(&mut self, stream_id: u32, metadata: BlobMetadata) -> Result<BlobReader> {
        let inner = &self.connection.inner;
        let weak = Arc::downgrade(inner);
        let demand: DemandHook = Arc::new(move |size| {
            if let Some(inner) = weak.upgrade() {
                ServerConnection { inner }.request_upload(stream_id, size);
            }
        });

        let reader = inner.uploads.add(
            self.call_id,
            stream_id,
            metadata,
            demand,
            inner.gateway.upload_chunk_size,
        )?;
        inner.upload_timeouts.on_created(stream_id, false);
        self.added.push(stream_id);
        Ok(reader)
    }
}

/// Registers the downloads a call result carries.
struct DownloadContext<'a> {
    connection: &'a ServerConnection,
    call_id: u32,
    added: Vec<u32>,
}

impl EncodeRpcContext for DownloadContext<'_> {
    fn add_stream(&mut self, blob: ProtocolBlob) -> Result<u32> {
        let inner = &self.connection.inner;
        let stream_id = inner
            .download_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_unused(|id| inner.downloads.contains(id))
            .ok_or_else(|| CallwireError::InvalidValue("No download stream id available".into()))?;

        let emitter: Arc<dyn StreamEmitter> = Arc::new(DownloadEmitter {
            connection: Arc::downgrade(inner),
        });
        inner.downloads.add(self.call_id, stream_id, blob, emitter)?;
        inner.download_timeouts.on_created(stream_id, true);
        self.added.push(stream_id);
        Ok(stream_id)
    }
}

/// Sends the frames of a download pump.
struct DownloadEmitter {
    connection: Weak<ConnectionInner>,
}

impl DownloadEmitter {
    fn connection(&self) -> Result<ServerConnection> {
        self.connection
            .upgrade()
            .map(|inner| ServerConnection { inner })
            .ok_or(CallwireError::ConnectionClosed)
    }

    async fn send(&self, stream_id: u32, message: ServerMessage) -> Result<()> {
        let connection = self.connection()?;
        let frame = connection.codec().encode_server(&message)?;
        let inner = &connection.inner;
        if !matches!(message, ServerMessage::ServerStreamPush { .. }) {
            inner.download_timeouts.clear_stream(stream_id);
        } else if inner.downloads.contains(stream_id) {
            inner.download_timeouts.on_activity(stream_id);
            // Aborted in between; the abort path may have cleared already
            if !inner.downloads.contains(stream_id) {
                inner.download_timeouts.clear_stream(stream_id);
            }
        }
        inner.sink.send(frame).await
    }
}

impl StreamEmitter for DownloadEmitter {
    fn push(&self, stream_id: u32, chunk: Bytes) -> BoxFuture<'_, Result<()>> {
        self.send(stream_id, ServerMessage::ServerStreamPush { stream_id, chunk })
            .boxed()
    }

    fn end(&self, stream_id: u32) -> BoxFuture<'_, Result<()>> {
        self.send(stream_id, ServerMessage::ServerStreamEnd { stream_id })
            .boxed()
    }

    fn abort(&self, stream_id: u32, reason: String) -> BoxFuture<'_, Result<()>> {
        self.send(
            stream_id,
            ServerMessage::ServerStreamAbort {
                stream_id,
                reason: Some(reason),
            },
        )
        .boxed()
    }
}
