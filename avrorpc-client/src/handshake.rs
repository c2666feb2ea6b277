//! Emitter-side handshake negotiation.
//!
//! Both emitter variants drive the same algorithm: send a request carrying
//! only fingerprints, and on `NONE` resend once with the full protocol
//! text. Resolvers learned from the server's protocol are cached on the
//! protocol object under the server's fingerprint.

use crate::error::ClientError;
use avrorpc_protocol::{
    FrameDecoder, FrameEncoder, HandshakeMatch, HandshakeRequest, HandshakeResponse,
};
use avrorpc_core::{ClientResolverSet, Protocol, ProtocolOptions};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Outcome of a successful negotiation.
pub(crate) struct Negotiated {
    pub server_fingerprint: [u8; 16],
    pub resolvers: Arc<ClientResolverSet>,
    pub request: HandshakeRequest,
    pub response: HandshakeResponse,
}

/// Reads one framed message, returning `None` on a clean end of stream.
pub(crate) async fn read_framed<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buf: &mut [u8],
) -> Result<Option<Bytes>, ClientError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some(message) = decoder.decode_message()? {
            return Ok(Some(message));
        }
        let n = reader.read(buf).await?;
        if n == 0 {
            decoder.finish()?;
            return Ok(None);
        }
        decoder.extend(&buf[..n]);
    }
}

/// Runs the handshake over a fresh channel.
pub(crate) async fn negotiate<R, W>(
    protocol: &Protocol,
    reader: &mut R,
    writer: &mut W,
    decoder: &mut FrameDecoder,
    encoder: &FrameEncoder,
    seed_server_hash: Option<[u8; 16]>,
) -> Result<Negotiated, ClientError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let own = protocol.fingerprint();
    let mut request = HandshakeRequest::new(own, seed_server_hash.unwrap_or(own));
    let mut buf = vec![0u8; 8192];
    let mut resent = false;

    loop {
        let mut bytes = Vec::new();
        request.write(&mut bytes)?;
        writer.write_all(&encoder.encode(&bytes)).await?;
        writer.flush().await?;

        let Some(message) = read_framed(reader, decoder, &mut buf).await? else {
            return Err(ClientError::Handshake(
                "connection closed during handshake".to_string(),
            ));
        };
        let mut cursor = &message[..];
        let response = HandshakeResponse::read(&mut cursor)
            .map_err(|e| ClientError::Handshake(e.to_string()))?;
        tracing::debug!(matched = ?response.matched, "handshake response");

        match response.matched {
            HandshakeMatch::Both => {
                let fingerprint = request.server_hash;
                let resolvers = resolvers_for(protocol, fingerprint, None)?;
                return Ok(Negotiated {
                    server_fingerprint: fingerprint,
                    resolvers,
                    request,
                    response,
                });
            }
            HandshakeMatch::Client => {
                let Some(fingerprint) = response.server_hash else {
                    return Err(ClientError::Handshake(
                        "CLIENT response without server hash".to_string(),
                    ));
                };
                let resolvers =
                    resolvers_for(protocol, fingerprint, response.server_protocol.as_deref())?;
                return Ok(Negotiated {
                    server_fingerprint: fingerprint,
                    resolvers,
                    request,
                    response,
                });
            }
            HandshakeMatch::None => {
                if let Some(text) = response.error_text() {
                    return Err(ClientError::Handshake(text));
                }
                if resent {
                    return Err(ClientError::Handshake(
                        "server rejected the handshake".to_string(),
                    ));
                }
                // The server may have volunteered its protocol; prepare
                // resolvers now so a later BOTH/CLIENT finds them cached.
                if let (Some(fingerprint), Some(text)) =
                    (response.server_hash, response.server_protocol.as_deref())
                {
                    let _ = resolvers_for(protocol, fingerprint, Some(text));
                    request.server_hash = fingerprint;
                }
                request.client_protocol = Some(protocol.document().to_string());
                resent = true;
            }
        }
    }
}

/// Returns the cached resolver set for a server fingerprint, building it
/// from the server's protocol text (or from our own protocol when the
/// fingerprints coincide) on a miss.
fn resolvers_for(
    protocol: &Protocol,
    fingerprint: [u8; 16],
    server_protocol: Option<&str>,
) -> Result<Arc<ClientResolverSet>, ClientError> {
    if let Some(cached) = protocol.cached_client_resolvers(&fingerprint) {
        return Ok(cached);
    }
    let set = if fingerprint == protocol.fingerprint() {
        protocol.client_resolvers(protocol)
    } else {
        let Some(text) = server_protocol else {
            return Err(ClientError::Handshake(
                "server protocol text unavailable".to_string(),
            ));
        };
        let server = Protocol::parse(text, ProtocolOptions::default())
            .map_err(|e| ClientError::Handshake(format!("bad server protocol: {e}")))?;
        protocol.client_resolvers(&server)
    };
    protocol.cache_client_resolvers(fingerprint, set.clone());
    Ok(set)
}
