//! Stateful listener.
//!
//! One duplex channel, many correlated calls. The session task accepts
//! the handshake (with `NONE` retries), then runs a select loop over
//! framed reads and completed-handler replies; handlers run as spawned
//! tasks so a slow handler never blocks the read side.

use crate::config::ListenerConfig;
use crate::dispatch::{self, CallEnv, CallOutcome};
use avrorpc_core::{Protocol, SessionEvent};
use avrorpc_protocol::{FrameDecoder, FrameEncoder, HandshakeRequest, HandshakeResponse};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

/// Capacity of the session event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the internal reply channel.
const REPLY_CHANNEL_CAPACITY: usize = 64;

struct ListenerShared {
    protocol: Protocol,
    /// New requests are dropped once set.
    destroyed: AtomicBool,
    /// Outstanding handlers are abandoned instead of drained.
    abandon: AtomicBool,
    /// End-of-transmission has fired.
    finished: AtomicBool,
    outstanding: AtomicUsize,
    events: broadcast::Sender<SessionEvent>,
    destroy_notify: Notify,
    done: Notify,
}

/// Server-side session over one persistent duplex channel.
pub struct StatefulListener {
    shared: Arc<ListenerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatefulListener {
    /// Starts the session task over `stream`.
    pub fn spawn<S>(protocol: Protocol, stream: S, config: ListenerConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(ListenerShared {
            protocol,
            destroyed: AtomicBool::new(false),
            abandon: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            events,
            destroy_notify: Notify::new(),
            done: Notify::new(),
        });
        let task = tokio::spawn(session(shared.clone(), stream, config));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Subscribes to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Number of handlers currently running.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Tears the session down.
    ///
    /// With `no_wait` false, the session stops reading, lets outstanding
    /// handlers finish and flushes their replies; with `no_wait` true,
    /// outstanding handlers are abandoned. Resolves once
    /// `end-of-transmission` has fired.
    pub async fn destroy(&self, no_wait: bool) {
        self.shared.destroyed.store(true, Ordering::SeqCst);
        if no_wait {
            self.shared.abandon.store(true, Ordering::SeqCst);
        }
        self.shared.destroy_notify.notify_waiters();
        self.closed().await;
    }

    /// Resolves once the session has finished.
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

    /// Awaits the session task itself.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl ListenerShared {
    fn emit_error(&self, text: String) {
        tracing::warn!(error = %text, "listener session error");
        let _ = self.events.send(SessionEvent::Error(text));
    }

    fn finish(&self, pending: usize) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(pending, "listener session finished");
        let _ = self
            .events
            .send(SessionEvent::EndOfTransmission { pending });
        self.done.notify_waiters();
    }
}

async fn session<S>(shared: Arc<ListenerShared>, stream: S, config: ListenerConfig)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let encoder = match FrameEncoder::new(config.frame_size) {
        Ok(encoder) => encoder,
        Err(e) => {
            shared.emit_error(e.to_string());
            shared.finish(0);
            return;
        }
    };
    let mut decoder = FrameDecoder::new().with_max_message_size(config.max_message_size);
    let mut buf = vec![0u8; config.read_buffer_size];

    let env = match handshake_phase(
        &shared,
        &mut reader,
        &mut writer,
        &mut decoder,
        &encoder,
        &mut buf,
    )
    .await
    {
        Some(env) => Arc::new(env),
        None => {
            let _ = writer.shutdown().await;
            shared.finish(0);
            return;
        }
    };

    call_phase(&shared, env, reader, writer, decoder, &mut buf).await;
}

/// Accepts handshake requests until one succeeds. Returns `None` when the
/// stream ends or the session is destroyed first.
async fn handshake_phase<R, W>(
    shared: &Arc<ListenerShared>,
    reader: &mut R,
    writer: &mut W,
    decoder: &mut FrameDecoder,
    encoder: &FrameEncoder,
    buf: &mut [u8],
) -> Option<CallEnv>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            result = dispatch::read_framed(reader, decoder, buf) => match result {
                Ok(Some(message)) => message,
                Ok(None) => return None,
                Err(e) => {
                    shared.emit_error(e.to_string());
                    return None;
                }
            },
            _ = shared.destroy_notify.notified() => return None,
        };

        let mut cursor = &message[..];
        match HandshakeRequest::read(&mut cursor) {
            Err(_) => {
                // Undecodable handshake: answer NONE with no server data
                // and wait for a retry.
                shared.emit_error("invalid handshake request".to_string());
                let response = HandshakeResponse::none(None, None);
                if write_handshake(writer, encoder, &response).await.is_err() {
                    return None;
                }
            }
            Ok(request) => {
                let (response, accepted) = dispatch::negotiate(&shared.protocol, &request);
                tracing::debug!(matched = ?response.matched, "handshake request handled");
                if write_handshake(writer, encoder, &response).await.is_err() {
                    return None;
                }
                let _ = shared.events.send(SessionEvent::Handshake {
                    request,
                    response,
                });
                if let Some((fingerprint, resolvers)) = accepted {
                    return Some(CallEnv {
                        protocol: shared.protocol.clone(),
                        resolvers,
                        client_fingerprint: Some(fingerprint),
                        encoder: *encoder,
                    });
                }
            }
        }
    }
}

async fn write_handshake<W>(
    writer: &mut W,
    encoder: &FrameEncoder,
    response: &HandshakeResponse,
) -> Result<(), crate::error::ServerError>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = Vec::new();
    response.write(&mut bytes)?;
    dispatch::write_framed(writer, encoder, &bytes).await
}

async fn call_phase<R, W>(
    shared: &Arc<ListenerShared>,
    env: Arc<CallEnv>,
    mut reader: R,
    mut writer: W,
    mut decoder: FrameDecoder,
    buf: &mut [u8],
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    let (reply_tx, mut reply_rx) = mpsc::channel::<BytesMut>(REPLY_CHANNEL_CAPACITY);

    'session: loop {
        tokio::select! {
            biased;

            Some(framed) = reply_rx.recv() => {
                if writer.write_all(&framed).await.is_err() {
                    break 'session;
                }
                let _ = writer.flush().await;
            }

            _ = shared.destroy_notify.notified() => break 'session,

            result = reader.read(buf) => {
                let n = match result {
                    Ok(0) => break 'session,
                    Ok(n) => n,
                    Err(e) => {
                        shared.emit_error(format!("transport error: {e}"));
                        break 'session;
                    }
                };
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.decode_message() {
                        Ok(Some(message)) => spawn_call(shared, &env, message, &reply_tx),
                        Ok(None) => break,
                        Err(e) => {
                            shared.emit_error(e.to_string());
                            break 'session;
                        }
                    }
                }
            }
        }
    }

    // Graceful teardown: outstanding handlers hold reply senders; once
    // they all complete the channel closes and the drain ends. Abandoned
    // teardown skips the drain.
    drop(reply_tx);
    loop {
        if shared.abandon.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            maybe = reply_rx.recv() => match maybe {
                Some(framed) => {
                    if writer.write_all(&framed).await.is_err() {
                        break;
                    }
                    let _ = writer.flush().await;
                }
                None => break,
            },
            _ = shared.destroy_notify.notified() => {}
        }
    }

    let pending = shared.outstanding.load(Ordering::SeqCst);
    let _ = writer.shutdown().await;
    shared.finish(pending);
}

/// Spawns one call onto its own task; the task sends its framed reply
/// back through the channel.
fn spawn_call(
    shared: &Arc<ListenerShared>,
    env: &Arc<CallEnv>,
    bytes: Bytes,
    reply_tx: &mpsc::Sender<BytesMut>,
) {
    if shared.destroyed.load(Ordering::SeqCst) {
        return;
    }
    shared.outstanding.fetch_add(1, Ordering::SeqCst);
    let shared = shared.clone();
    let env = env.clone();
    let reply_tx = reply_tx.clone();
    tokio::spawn(async move {
        match dispatch::handle_message(&env, &bytes).await {
            CallOutcome::Reply(framed) => {
                let _ = reply_tx.send(framed).await;
            }
            CallOutcome::OneWay => {}
            CallOutcome::Skip(text) => shared.emit_error(text),
        }
        shared.outstanding.fetch_sub(1, Ordering::SeqCst);
    });
}
