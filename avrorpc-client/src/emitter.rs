//! Stateful emitter.
//!
//! One duplex channel, many correlated calls. The handshake runs inside
//! [`StatefulEmitter::connect`]; afterwards a spawned read loop matches
//! replies to callers through a pending table of oneshot senders.

use crate::error::ClientError;
use crate::handshake::{self, Negotiated};
use avrorpc_core::{
    Message, Protocol, RemoteError, SessionEvent, ClientResolverSet, Value,
};
use avrorpc_protocol::{
    codec, CallMetadata, FrameDecoder, FrameEncoder, HandshakeRequest, HandshakeResponse,
    DEFAULT_FRAME_SIZE, DEFAULT_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE, MIN_READ_BUFFER_SIZE,
};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;

/// Capacity of the session event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Emitter configuration.
#[derive(Debug, Clone, Copy)]
pub struct EmitterConfig {
    /// Frame size used when splitting outgoing messages.
    pub frame_size: usize,
    /// Read buffer size for the response loop.
    pub read_buffer_size: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl EmitterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_size(mut self, size: usize) -> Self {
        self.frame_size = size.max(1);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

struct PendingCall {
    message: Arc<Message>,
    tx: oneshot::Sender<Result<Value, ClientError>>,
}

struct EmitterShared {
    protocol: Protocol,
    encoder: FrameEncoder,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    pending: Mutex<HashMap<i64, PendingCall>>,
    next_id: AtomicI64,
    server_fingerprint: [u8; 16],
    resolvers: Arc<ClientResolverSet>,
    handshake: (HandshakeRequest, HandshakeResponse),
    /// New calls are refused once set.
    draining: AtomicBool,
    /// End-of-transmission has fired.
    finished: AtomicBool,
    /// Signalled whenever the pending table empties.
    idle: Notify,
    /// Signalled when the session finishes.
    done: Notify,
    events: broadcast::Sender<SessionEvent>,
}

/// Client-side session over one persistent duplex channel.
pub struct StatefulEmitter {
    shared: Arc<EmitterShared>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StatefulEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulEmitter").finish_non_exhaustive()
    }
}

impl StatefulEmitter {
    /// Connects over `stream`: performs the handshake, then starts the
    /// response loop. No call can be issued before the handshake has
    /// completed.
    pub async fn connect<S>(
        protocol: Protocol,
        stream: S,
        config: EmitterConfig,
    ) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: BoxReader = Box::new(read_half);
        let mut writer: BoxWriter = Box::new(write_half);
        let encoder = FrameEncoder::new(config.frame_size)?;
        let mut decoder = FrameDecoder::new();

        let Negotiated {
            server_fingerprint,
            resolvers,
            request,
            response,
        } = handshake::negotiate(&protocol, &mut reader, &mut writer, &mut decoder, &encoder, None)
            .await?;
        tracing::debug!(protocol = protocol.name(), "emitter handshake complete");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(EmitterShared {
            protocol,
            encoder,
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            server_fingerprint,
            resolvers,
            handshake: (request.clone(), response.clone()),
            draining: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            idle: Notify::new(),
            done: Notify::new(),
            events,
        });
        let _ = shared
            .events
            .send(SessionEvent::Handshake { request, response });

        let read_task = tokio::spawn(read_loop(
            shared.clone(),
            reader,
            decoder,
            config.read_buffer_size,
        ));
        Ok(Self {
            shared,
            read_task: Mutex::new(Some(read_task)),
        })
    }

    /// Issues a call and awaits its reply.
    ///
    /// One-way messages resolve to [`Value::Null`] as soon as the request
    /// has been written; no pending entry is created for them.
    pub async fn emit(&self, message: &str, request: Value) -> Result<Value, ClientError> {
        let shared = &self.shared;
        if shared.draining.load(Ordering::Acquire) || shared.finished.load(Ordering::Acquire) {
            return Err(ClientError::Destroyed);
        }
        let declared = shared
            .protocol
            .message(message)
            .cloned()
            .ok_or_else(|| ClientError::UnknownMessage(message.to_string()))?;
        if !declared.request().is_valid(&request) {
            return Err(ClientError::InvalidRequest(
                declared.request().validation_error(&request),
            ));
        }
        match shared.resolvers.get(message) {
            None => return Err(ClientError::MissingServerMessage(message.to_string())),
            Some(Err(reason)) => return Err(ClientError::Incompatible(reason.clone())),
            Some(Ok(_)) => {}
        }

        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let mut body = Vec::new();
        CallMetadata::with_id(id)?.write(&mut body)?;
        codec::write_string(message, &mut body)?;
        body.extend_from_slice(&declared.request().encode(&request)?);
        let framed = shared.encoder.encode(&body);
        tracing::debug!(message, id, bytes = framed.len(), "emitting request");

        if declared.is_one_way() {
            shared.send(framed).await?;
            return Ok(Value::Null);
        }

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().insert(
            id,
            PendingCall {
                message: declared,
                tx,
            },
        );
        if let Err(e) = shared.send(framed).await {
            shared.pending.lock().remove(&id);
            shared.maybe_idle();
            return Err(e);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Interrupted),
        }
    }

    /// Subscribes to session events. The handshake event predates any
    /// subscriber; read it via [`handshake`](Self::handshake) instead.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// The handshake exchange that opened this session.
    pub fn handshake(&self) -> (&HandshakeRequest, &HandshakeResponse) {
        (&self.shared.handshake.0, &self.shared.handshake.1)
    }

    /// Fingerprint negotiated for the server's protocol.
    pub fn server_fingerprint(&self) -> [u8; 16] {
        self.shared.server_fingerprint
    }

    /// Highest correlation id issued so far (0 before the first call).
    pub fn last_correlation_id(&self) -> i64 {
        self.shared.next_id.load(Ordering::SeqCst) - 1
    }

    /// Number of calls awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Tears the session down.
    ///
    /// With `no_wait` false, new calls are refused and the session waits
    /// for the pending table to empty before closing; with `no_wait`
    /// true, every pending call fails with `interrupted` immediately.
    /// Either way `end-of-transmission` fires exactly once, carrying the
    /// number of calls cut off.
    pub async fn destroy(&self, no_wait: bool) {
        let shared = &self.shared;
        shared.draining.store(true, Ordering::SeqCst);
        if !no_wait {
            loop {
                let notified = shared.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if shared.pending.lock().is_empty() || shared.finished.load(Ordering::SeqCst) {
                    break;
                }
                notified.await;
            }
        }
        if let Some(mut writer) = shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        shared.teardown();
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
    }

    /// Resolves once the session has finished (end-of-transmission fired).
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.finished.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

impl EmitterShared {
    async fn send(&self, framed: BytesMut) -> Result<(), ClientError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ClientError::Destroyed);
        };
        writer.write_all(&framed).await?;
        writer.flush().await?;
        Ok(())
    }

    fn maybe_idle(&self) {
        if self.pending.lock().is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn emit_error(&self, text: String) {
        tracing::warn!(error = %text, "emitter session error");
        let _ = self.events.send(SessionEvent::Error(text));
    }

    fn handle_reply(&self, bytes: &[u8]) {
        let mut cursor = bytes;
        let meta = match CallMetadata::read(&mut cursor) {
            Ok(meta) => meta,
            Err(_) => {
                self.emit_error("invalid metadata".to_string());
                return;
            }
        };
        let id = match meta.id() {
            Ok(id) => id,
            Err(_) => {
                self.emit_error("invalid metadata".to_string());
                return;
            }
        };
        let Some(call) = self.pending.lock().remove(&id) else {
            self.emit_error(format!("orphan response: {id}"));
            return;
        };
        let result = self.decode_reply(&call.message, &mut cursor);
        let _ = call.tx.send(result);
        self.maybe_idle();
    }

    fn decode_reply(
        &self,
        message: &Arc<Message>,
        cursor: &mut &[u8],
    ) -> Result<Value, ClientError> {
        let is_error = codec::read_flag(cursor).map_err(|_| ClientError::Truncated)?;
        let resolution = match self.resolvers.get(message.name()) {
            Some(Ok(resolution)) => Some(resolution),
            _ => None,
        };
        if is_error {
            let value = match resolution {
                Some(r) => r.errors.read(cursor),
                None => message.errors().decode(cursor),
            }
            .map_err(|_| ClientError::Truncated)?;
            Err(ClientError::Remote(remote_error(value)))
        } else {
            let value = match resolution {
                Some(r) => r.response.read(cursor),
                None => message.response().decode(cursor),
            }
            .map_err(|_| ClientError::Truncated)?;
            Ok(value)
        }
    }

    /// Final teardown; idempotent. Fails whatever is still pending with
    /// `interrupted` and fires `end-of-transmission` with the count.
    fn teardown(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.draining.store(true, Ordering::SeqCst);
        let cut: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, call)| call).collect()
        };
        let count = cut.len();
        for call in cut {
            let _ = call.tx.send(Err(ClientError::Interrupted));
        }
        self.idle.notify_waiters();
        tracing::debug!(pending = count, "emitter session finished");
        let _ = self
            .events
            .send(SessionEvent::EndOfTransmission { pending: count });
        self.done.notify_waiters();
    }
}

/// Converts a decoded error-union value into a [`RemoteError`].
pub(crate) fn remote_error(value: Value) -> RemoteError {
    match value {
        Value::Union(0, inner) => match *inner {
            Value::String(text) => RemoteError::System(text),
            other => RemoteError::Declared(other),
        },
        Value::Union(_, inner) => RemoteError::Declared(*inner),
        Value::String(text) => RemoteError::System(text),
        other => RemoteError::Declared(other),
    }
}

async fn read_loop(
    shared: Arc<EmitterShared>,
    mut reader: BoxReader,
    mut decoder: FrameDecoder,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    'outer: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                if decoder.finish().is_err() {
                    shared.emit_error("unexpected end of stream".to_string());
                }
                break;
            }
            Ok(n) => n,
            Err(e) => {
                shared.emit_error(format!("transport error: {e}"));
                break;
            }
        };
        decoder.extend(&buf[..n]);
        loop {
            match decoder.decode_message() {
                Ok(Some(message)) => shared.handle_reply(&message),
                Ok(None) => break,
                Err(e) => {
                    shared.emit_error(e.to_string());
                    break 'outer;
                }
            }
        }
    }
    // Transport gone: equivalent to destroy(no_wait = true) observed from
    // the read side.
    shared.teardown();
}
