//! Stateless listener.
//!
//! Serves exactly one request/response pair per channel: handshake
//! (with `NONE` retries), one call, one reply, done. Shares the dispatch
//! core with the stateful variant.

use crate::config::ListenerConfig;
use crate::dispatch::{self, CallEnv, CallOutcome};
use crate::error::ServerError;
use avrorpc_core::Protocol;
use avrorpc_protocol::{FrameDecoder, FrameEncoder, HandshakeRequest};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Server-side session for one-shot channels.
pub struct StatelessListener;

impl StatelessListener {
    /// Drives one exchange over `stream` and returns once the reply has
    /// been flushed (or the stream ended early).
    pub async fn serve<S>(
        protocol: Protocol,
        stream: S,
        config: ListenerConfig,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let encoder = FrameEncoder::new(config.frame_size)?;
        let mut decoder = FrameDecoder::new().with_max_message_size(config.max_message_size);
        let mut buf = vec![0u8; config.read_buffer_size];

        // Handshake, retrying on NONE.
        let env = loop {
            let Some(message) =
                dispatch::read_framed(&mut reader, &mut decoder, &mut buf).await?
            else {
                return Ok(());
            };
            let mut cursor = &message[..];
            let (response, accepted) = match HandshakeRequest::read(&mut cursor) {
                Err(_) => (
                    avrorpc_protocol::HandshakeResponse::none(None, None),
                    None,
                ),
                Ok(request) => dispatch::negotiate(&protocol, &request),
            };
            let mut bytes = Vec::new();
            response.write(&mut bytes)?;
            dispatch::write_framed(&mut writer, &encoder, &bytes).await?;
            if let Some((fingerprint, resolvers)) = accepted {
                break CallEnv {
                    protocol: protocol.clone(),
                    resolvers,
                    client_fingerprint: Some(fingerprint),
                    encoder,
                };
            }
        };

        // Exactly one call.
        let Some(message) = dispatch::read_framed(&mut reader, &mut decoder, &mut buf).await?
        else {
            return Ok(());
        };
        match dispatch::handle_message(&env, &message).await {
            CallOutcome::Reply(framed) => {
                writer.write_all(&framed).await?;
                writer.flush().await?;
            }
            CallOutcome::OneWay => {}
            CallOutcome::Skip(text) => {
                tracing::warn!(error = %text, "stateless call dropped");
            }
        }
        let _ = writer.shutdown().await;
        Ok(())
    }
}
