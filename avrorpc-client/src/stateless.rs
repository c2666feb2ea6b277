//! Stateless emitter.
//!
//! One channel per call, acquired through an async factory. Each call
//! performs its own handshake (seeded from the last server fingerprint
//! this session learned, so the protocol-level resolver cache usually
//! turns it into a single round trip) and carries exactly one
//! request/response pair.

use crate::error::ClientError;
use crate::handshake::{self, Negotiated};
use avrorpc_core::{Protocol, Value};
use avrorpc_protocol::{codec, CallMetadata, FrameDecoder, FrameEncoder, ProtocolError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::emitter::EmitterConfig;

/// Client-side session that opens a fresh channel per call.
pub struct StatelessEmitter<F> {
    protocol: Protocol,
    factory: F,
    encoder: FrameEncoder,
    read_buffer_size: usize,
    last_server: Mutex<Option<[u8; 16]>>,
    next_id: AtomicI64,
    destroyed: AtomicBool,
    destroy_notify: Notify,
}

impl<F, Fut, S> StatelessEmitter<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::io::Result<S>> + Send,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(protocol: Protocol, factory: F, config: EmitterConfig) -> Result<Self, ClientError> {
        Ok(Self {
            protocol,
            factory,
            encoder: FrameEncoder::new(config.frame_size)?,
            read_buffer_size: config.read_buffer_size,
            last_server: Mutex::new(None),
            next_id: AtomicI64::new(1),
            destroyed: AtomicBool::new(false),
            destroy_notify: Notify::new(),
        })
    }

    /// Issues a call over a fresh channel.
    ///
    /// A factory failure is a `transport error`; a session destroyed
    /// while the exchange is in flight fails it with `interrupted`; a
    /// reply stream ending early is `no message decoded`.
    pub async fn emit(&self, message: &str, request: Value) -> Result<Value, ClientError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ClientError::Destroyed);
        }
        let exchange = self.exchange(message, request);
        tokio::select! {
            result = exchange => result,
            _ = self.destroy_notify.notified() => Err(ClientError::Interrupted),
        }
    }

    /// Stops the session; calls in flight fail with `interrupted`.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.destroy_notify.notify_waiters();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    async fn exchange(&self, message: &str, request: Value) -> Result<Value, ClientError> {
        let declared = self
            .protocol
            .message(message)
            .cloned()
            .ok_or_else(|| ClientError::UnknownMessage(message.to_string()))?;
        if !declared.request().is_valid(&request) {
            return Err(ClientError::InvalidRequest(
                declared.request().validation_error(&request),
            ));
        }

        let stream = (self.factory)().await.map_err(ClientError::Transport)?;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = FrameDecoder::new();

        let seed = *self.last_server.lock();
        let Negotiated {
            server_fingerprint,
            resolvers,
            ..
        } = handshake::negotiate(
            &self.protocol,
            &mut reader,
            &mut writer,
            &mut decoder,
            &self.encoder,
            seed,
        )
        .await?;
        *self.last_server.lock() = Some(server_fingerprint);

        let resolution = match resolvers.get(message) {
            None => return Err(ClientError::MissingServerMessage(message.to_string())),
            Some(Err(reason)) => return Err(ClientError::Incompatible(reason.clone())),
            Some(Ok(resolution)) => resolution.clone(),
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut body = Vec::new();
        CallMetadata::with_id(id)?.write(&mut body)?;
        codec::write_string(message, &mut body)?;
        body.extend_from_slice(&declared.request().encode(&request)?);
        writer.write_all(&self.encoder.encode(&body)).await?;
        writer.flush().await?;
        tracing::debug!(message, id, "stateless request sent");

        if declared.is_one_way() {
            return Ok(Value::Null);
        }

        let mut buf = vec![0u8; self.read_buffer_size];
        loop {
            let reply = match handshake::read_framed(&mut reader, &mut decoder, &mut buf).await {
                Ok(Some(reply)) => reply,
                // The channel ended without a complete framed response.
                Ok(None) => return Err(ClientError::NoMessageDecoded),
                Err(ClientError::Protocol(ProtocolError::UnexpectedEndOfStream)) => {
                    return Err(ClientError::NoMessageDecoded)
                }
                Err(e) => return Err(e),
            };
            let mut cursor = &reply[..];
            let Ok(meta) = CallMetadata::read(&mut cursor) else {
                return Err(ClientError::Truncated);
            };
            match meta.id() {
                Ok(reply_id) if reply_id == id => {}
                // Not ours; a stateless channel carries one pair, so skip.
                _ => {
                    tracing::warn!(id, "stateless reply with foreign correlation id");
                    continue;
                }
            }
            let is_error = codec::read_flag(&mut cursor).map_err(|_| ClientError::Truncated)?;
            return if is_error {
                let value = resolution
                    .errors
                    .read(&mut cursor)
                    .map_err(|_| ClientError::Truncated)?;
                Err(ClientError::Remote(crate::emitter::remote_error(value)))
            } else {
                resolution
                    .response
                    .read(&mut cursor)
                    .map_err(|_| ClientError::Truncated)
            };
        }
    }
}
