//! Shared listener machinery: handshake acceptance and call dispatch.
//!
//! Both listener variants funnel through [`handle_message`], which takes
//! one reassembled call, runs the registered handler and produces the
//! framed reply (or nothing, for one-way messages).

use crate::error::ServerError;
use avrorpc_core::{
    CallContext, CoreError, Handler, Message, Protocol, ProtocolOptions, RemoteError,
    ServerResolverSet, Value,
};
use avrorpc_protocol::{
    codec, CallMetadata, FrameDecoder, FrameEncoder, HandshakeRequest, HandshakeResponse,
};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Everything a call needs besides its bytes: the protocol (with its
/// handler registry), the resolvers negotiated for this peer (`None` when
/// the peer speaks our own protocol) and the reply framing.
pub(crate) struct CallEnv {
    pub protocol: Protocol,
    pub resolvers: Option<Arc<ServerResolverSet>>,
    pub client_fingerprint: Option<[u8; 16]>,
    pub encoder: FrameEncoder,
}

/// Result of handling one incoming call.
pub(crate) enum CallOutcome {
    /// A framed reply to write back.
    Reply(BytesMut),
    /// One-way call; nothing to write.
    OneWay,
    /// The call could not be answered; surface as a session error.
    Skip(String),
}

/// Reads one framed message, returning `None` on a clean end of stream.
pub(crate) async fn read_framed<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buf: &mut [u8],
) -> Result<Option<Bytes>, ServerError>
where
    R: AsyncRead + Unpin,
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

/// Frames and writes one logical message.
pub(crate) async fn write_framed<W>(
    writer: &mut W,
    encoder: &FrameEncoder,
    message: &[u8],
) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encoder.encode(message)).await?;
    writer.flush().await?;
    Ok(())
}

/// Listener-side handshake negotiation for one request.
///
/// Returns the response to send and, when the handshake succeeded, the
/// negotiated client fingerprint with its resolver set (`None` resolvers
/// mean the peer speaks our own protocol).
pub(crate) fn negotiate(
    protocol: &Protocol,
    request: &HandshakeRequest,
) -> (
    HandshakeResponse,
    Option<([u8; 16], Option<Arc<ServerResolverSet>>)>,
) {
    let own = protocol.fingerprint();

    // Figure out whether we know the client's protocol.
    let known: Option<Option<Arc<ServerResolverSet>>> = if request.client_hash == own {
        Some(None)
    } else if let Some(cached) = protocol.cached_server_resolvers(&request.client_hash) {
        Some(Some(cached))
    } else if let Some(text) = &request.client_protocol {
        match Protocol::parse(text, ProtocolOptions::default()) {
            Ok(client) => match protocol.server_resolvers(&client) {
                Ok(set) => {
                    protocol.cache_server_resolvers(request.client_hash, set.clone());
                    Some(Some(set))
                }
                Err(CoreError::Incompatible(reason)) => {
                    return (HandshakeResponse::none_with_error(&reason), None);
                }
                Err(e) => {
                    return (HandshakeResponse::none_with_error(&e.to_string()), None);
                }
            },
            Err(e) => {
                let text = format!("invalid client protocol: {e}");
                return (HandshakeResponse::none_with_error(&text), None);
            }
        }
    } else {
        None
    };

    match known {
        Some(resolvers) => {
            let server_match = request.server_hash == own;
            let response = if server_match && resolvers.is_none() {
                HandshakeResponse::both()
            } else {
                HandshakeResponse::client(protocol.document().to_string(), own)
            };
            (response, Some((request.client_hash, resolvers)))
        }
        // Unknown client and no protocol text: prompt a resend carrying
        // our own protocol so the client can pre-build resolvers.
        None => (
            HandshakeResponse::none(Some(protocol.document().to_string()), Some(own)),
            None,
        ),
    }
}

/// Handles one reassembled call message end to end.
pub(crate) async fn handle_message(env: &CallEnv, bytes: &[u8]) -> CallOutcome {
    let mut cursor = bytes;
    let Ok(meta) = CallMetadata::read(&mut cursor) else {
        return CallOutcome::Skip("invalid metadata".to_string());
    };
    let Ok(id) = meta.id() else {
        return CallOutcome::Skip("invalid metadata".to_string());
    };
    let Ok(name) = codec::read_string(&mut cursor) else {
        return CallOutcome::Skip("truncated message".to_string());
    };

    let Some(message) = env.protocol.message(&name).cloned() else {
        tracing::warn!(message = %name, "unknown message");
        return system_reply(env, &meta, &format!("unknown message: {name}"));
    };

    let request = {
        let resolution = env
            .resolvers
            .as_ref()
            .and_then(|set| set.get(&name));
        let decoded = match resolution {
            Some(resolution) => resolution.request.read(&mut cursor),
            None => message.request().decode(&mut cursor),
        };
        match decoded {
            Ok(value) => value,
            Err(e) => {
                let text = format!("invalid request: {e}");
                if message.is_one_way() {
                    return CallOutcome::Skip(text);
                }
                return system_reply(env, &meta, &text);
            }
        }
    };

    let ctx = CallContext {
        message: name.clone(),
        correlation_id: id,
        client_fingerprint: env.client_fingerprint,
    };

    match env.protocol.handler(&name) {
        None => {
            if message.is_one_way() {
                tracing::warn!(message = %name, "unhandled one-way message");
                return CallOutcome::OneWay;
            }
            system_reply(env, &meta, "unhandled message")
        }
        Some(Handler::OneWay(handler)) => {
            // Run on its own task so a panicking handler cannot take the
            // session down.
            let _ = tokio::spawn(handler(request, ctx)).await;
            CallOutcome::OneWay
        }
        Some(Handler::TwoWay(handler)) => {
            let outcome = match tokio::spawn(handler(request, ctx)).await {
                Ok(result) => result,
                Err(join) => Err(RemoteError::System(panic_text(join))),
            };
            match encode_reply(env, &meta, &message, outcome) {
                Ok(framed) => CallOutcome::Reply(framed),
                Err(e) => CallOutcome::Skip(format!("reply encoding failed: {e}")),
            }
        }
    }
}

/// Builds a string-branch error reply; used for per-call failures that
/// happen before (or instead of) the handler.
fn system_reply(env: &CallEnv, meta: &CallMetadata, text: &str) -> CallOutcome {
    match encode_system_reply(env, meta, text) {
        Ok(framed) => CallOutcome::Reply(framed),
        Err(e) => CallOutcome::Skip(format!("reply encoding failed: {e}")),
    }
}

fn encode_system_reply(
    env: &CallEnv,
    meta: &CallMetadata,
    text: &str,
) -> Result<BytesMut, ServerError> {
    let mut body = Vec::new();
    meta.write(&mut body)?;
    codec::write_flag(true, &mut body)?;
    codec::write_error_string(text, &mut body)?;
    Ok(env.encoder.encode(&body))
}

/// Encodes a handler outcome: echoed metadata, the error flag byte, then
/// the response payload or the error union.
fn encode_reply(
    env: &CallEnv,
    meta: &CallMetadata,
    message: &Arc<Message>,
    outcome: Result<Value, RemoteError>,
) -> Result<BytesMut, ServerError> {
    let (is_error, payload) = match outcome {
        Ok(value) => {
            if message.response().is_valid(&value) {
                (false, message.response().encode(&value)?)
            } else {
                tracing::warn!(message = message.name(), "handler returned invalid response");
                (true, string_branch("invalid response")?)
            }
        }
        Err(remote) => (true, error_union(env, message, remote)?),
    };
    let mut body = Vec::new();
    meta.write(&mut body)?;
    codec::write_flag(is_error, &mut body)?;
    body.extend_from_slice(&payload);
    Ok(env.encoder.encode(&body))
}

fn string_branch(text: &str) -> Result<Vec<u8>, ServerError> {
    let mut out = Vec::new();
    codec::write_error_string(text, &mut out)?;
    Ok(out)
}

/// Encodes a handler error into the message's error union. Declared
/// values are matched against the declared branches; a value matching
/// none becomes a system error (naming the mismatch under
/// `strict_errors`, carrying the debug rendering otherwise).
fn error_union(
    env: &CallEnv,
    message: &Arc<Message>,
    remote: RemoteError,
) -> Result<Vec<u8>, ServerError> {
    match remote {
        RemoteError::System(text) => string_branch(&text),
        RemoteError::Declared(value) => {
            for index in 1..message.error_branches() {
                let candidate = Value::Union(index as u32, Box::new(value.clone()));
                if message.errors().is_valid(&candidate) {
                    return Ok(message.errors().encode(&candidate)?);
                }
            }
            let text = if env.protocol.options().strict_errors {
                format!("invalid error for message \"{}\"", message.name())
            } else {
                format!("{value:?}")
            };
            tracing::warn!(
                message = message.name(),
                "declared error matches no union branch"
            );
            string_branch(&text)
        }
    }
}

fn panic_text(err: tokio::task::JoinError) -> String {
    if err.is_panic() {
        match err.into_panic().downcast::<String>() {
            Ok(text) => format!("handler panicked: {text}"),
            Err(any) => match any.downcast::<&'static str>() {
                Ok(text) => format!("handler panicked: {text}"),
                Err(_) => "handler panicked".to_string(),
            },
        }
    } else {
        "handler cancelled".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrorpc_protocol::HandshakeMatch;

    const HEARTBEAT: &str = r#"{
        "protocol": "Heartbeat",
        "messages": {
            "beat": {"request": [], "response": "int"}
        }
    }"#;

    fn protocol() -> Protocol {
        Protocol::parse(HEARTBEAT, ProtocolOptions::default()).unwrap()
    }

    #[test]
    fn test_negotiate_both() {
        let protocol = protocol();
        let own = protocol.fingerprint();
        let request = HandshakeRequest::new(own, own);
        let (response, accepted) = negotiate(&protocol, &request);
        assert_eq!(response.matched, HandshakeMatch::Both);
        assert!(response.server_hash.is_none());
        let (fingerprint, resolvers) = accepted.unwrap();
        assert_eq!(fingerprint, own);
        assert!(resolvers.is_none());
    }

    #[test]
    fn test_negotiate_stale_server_hash() {
        // Client speaks our protocol but guessed a stale server hash:
        // CLIENT, carrying our hash and protocol text.
        let protocol = protocol();
        let own = protocol.fingerprint();
        let request = HandshakeRequest::new(own, [0u8; 16]);
        let (response, accepted) = negotiate(&protocol, &request);
        assert_eq!(response.matched, HandshakeMatch::Client);
        assert_eq!(response.server_hash, Some(own));
        assert!(response.server_protocol.is_some());
        assert!(accepted.is_some());
    }

    #[test]
    fn test_negotiate_unknown_client_prompts_resend() {
        let protocol = protocol();
        let request = HandshakeRequest::new([1u8; 16], protocol.fingerprint());
        let (response, accepted) = negotiate(&protocol, &request);
        assert_eq!(response.matched, HandshakeMatch::None);
        assert!(response.server_protocol.is_some());
        assert!(response.error_text().is_none());
        assert!(accepted.is_none());
    }

    #[test]
    fn test_negotiate_with_client_protocol_caches() {
        let protocol = protocol();
        let client = Protocol::parse(HEARTBEAT, ProtocolOptions::default()).unwrap();
        let mut request = HandshakeRequest::new([1u8; 16], protocol.fingerprint());
        request.client_protocol = Some(client.document().to_string());

        let (response, accepted) = negotiate(&protocol, &request);
        assert_eq!(response.matched, HandshakeMatch::Client);
        assert!(accepted.is_some());
        assert!(protocol.cached_server_resolvers(&[1u8; 16]).is_some());

        // Second round trips on the cache without protocol text.
        let request = HandshakeRequest::new([1u8; 16], protocol.fingerprint());
        let (response, accepted) = negotiate(&protocol, &request);
        assert_eq!(response.matched, HandshakeMatch::Client);
        assert!(accepted.is_some());
    }

    #[test]
    fn test_negotiate_one_way_mismatch() {
        let server = Protocol::parse(
            r#"{"protocol": "Heartbeat", "messages": {
                "beat": {"request": [], "response": "null", "one-way": true}
            }}"#,
            ProtocolOptions::default(),
        )
        .unwrap();
        let client = Protocol::parse(
            r#"{"protocol": "Heartbeat", "messages": {
                "beat": {"request": [], "response": "null"}
            }}"#,
            ProtocolOptions::default(),
        )
        .unwrap();

        let mut request = HandshakeRequest::new(client.fingerprint(), server.fingerprint());
        request.client_protocol = Some(client.document().to_string());
        let (response, accepted) = negotiate(&server, &request);
        assert_eq!(response.matched, HandshakeMatch::None);
        assert!(accepted.is_none());
        let text = response.error_text().unwrap();
        assert!(text.contains("one-way"), "got: {text}");
    }

    #[tokio::test]
    async fn test_unknown_message_reply() {
        let protocol = protocol();
        let env = CallEnv {
            protocol: protocol.clone(),
            resolvers: None,
            client_fingerprint: Some(protocol.fingerprint()),
            encoder: FrameEncoder::new(64).unwrap(),
        };

        let mut call = Vec::new();
        CallMetadata::with_id(1).unwrap().write(&mut call).unwrap();
        codec::write_string("id", &mut call).unwrap();

        let CallOutcome::Reply(framed) = handle_message(&env, &call).await else {
            panic!("expected a reply");
        };
        let mut decoder = FrameDecoder::new();
        decoder.extend(&framed);
        let reply = decoder.decode_message().unwrap().unwrap();

        let mut cursor = &reply[..];
        let meta = CallMetadata::read(&mut cursor).unwrap();
        assert_eq!(meta.id().unwrap(), 1);
        assert!(codec::read_flag(&mut cursor).unwrap());
        // Union branch zero carries the string.
        assert_eq!(cursor[0], 0);
        let mut rest = &cursor[1..];
        assert_eq!(
            codec::read_string(&mut rest).unwrap(),
            "unknown message: id"
        );
    }

    #[tokio::test]
    async fn test_unhandled_message_reply() {
        let protocol = protocol();
        let env = CallEnv {
            protocol: protocol.clone(),
            resolvers: None,
            client_fingerprint: None,
            encoder: FrameEncoder::new(64).unwrap(),
        };
        let mut call = Vec::new();
        CallMetadata::with_id(4).unwrap().write(&mut call).unwrap();
        codec::write_string("beat", &mut call).unwrap();
        // Empty request record encodes to zero bytes.

        let CallOutcome::Reply(framed) = handle_message(&env, &call).await else {
            panic!("expected a reply");
        };
        let mut decoder = FrameDecoder::new();
        decoder.extend(&framed);
        let reply = decoder.decode_message().unwrap().unwrap();
        let mut cursor = &reply[..];
        CallMetadata::read(&mut cursor).unwrap();
        assert!(codec::read_flag(&mut cursor).unwrap());
        let mut rest = &cursor[1..];
        assert_eq!(codec::read_string(&mut rest).unwrap(), "unhandled message");
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_system_error() {
        let protocol = protocol();
        protocol
            .on("beat", |_value, _ctx| async { panic!("kaboom") })
            .unwrap();
        let env = CallEnv {
            protocol: protocol.clone(),
            resolvers: None,
            client_fingerprint: None,
            encoder: FrameEncoder::new(64).unwrap(),
        };
        let mut call = Vec::new();
        CallMetadata::with_id(9).unwrap().write(&mut call).unwrap();
        codec::write_string("beat", &mut call).unwrap();

        let CallOutcome::Reply(framed) = handle_message(&env, &call).await else {
            panic!("expected a reply");
        };
        let mut decoder = FrameDecoder::new();
        decoder.extend(&framed);
        let reply = decoder.decode_message().unwrap().unwrap();
        let mut cursor = &reply[..];
        CallMetadata::read(&mut cursor).unwrap();
        assert!(codec::read_flag(&mut cursor).unwrap());
        let mut rest = &cursor[1..];
        let text = codec::read_string(&mut rest).unwrap();
        assert!(text.contains("kaboom"), "got: {text}");
    }

    #[tokio::test]
    async fn test_metadata_keys_echoed() {
        let protocol = protocol();
        protocol
            .on("beat", |_value, _ctx| async { Ok(Value::Int(1)) })
            .unwrap();
        let env = CallEnv {
            protocol: protocol.clone(),
            resolvers: None,
            client_fingerprint: None,
            encoder: FrameEncoder::new(64).unwrap(),
        };
        let mut meta = CallMetadata::with_id(2).unwrap();
        meta.insert("trace", b"t-1".to_vec());
        let mut call = Vec::new();
        meta.write(&mut call).unwrap();
        codec::write_string("beat", &mut call).unwrap();

        let CallOutcome::Reply(framed) = handle_message(&env, &call).await else {
            panic!("expected a reply");
        };
        let mut decoder = FrameDecoder::new();
        decoder.extend(&framed);
        let reply = decoder.decode_message().unwrap().unwrap();
        let mut cursor = &reply[..];
        let echoed = CallMetadata::read(&mut cursor).unwrap();
        assert_eq!(echoed.id().unwrap(), 2);
        assert_eq!(echoed.get("trace"), Some(&b"t-1"[..]));
        assert!(!codec::read_flag(&mut cursor).unwrap());
    }
}
