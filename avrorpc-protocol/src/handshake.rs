//! Handshake records.
//!
//! The first exchange on every session negotiates which protocol each peer
//! speaks, identified by a 16-byte MD5 fingerprint:
//!
//! ```text
//! Emitter                                        Listener
//!   |                                               |
//!   | -- HandshakeRequest { clientHash, ... } -->   |
//!   |                                               |
//!   | <-- HandshakeResponse { match: BOTH } --------|
//!   |     OR  { match: CLIENT, serverHash, ... }    |
//!   |     OR  { match: NONE, meta.error? }          |
//!   |                                               |
//! ```
//!
//! On `NONE` the emitter re-sends the request with its full protocol text
//! so the listener can attempt schema resolution.

use crate::error::ProtocolError;
use apache_avro::{from_avro_datum, to_avro_datum, types::Value, Schema};
use std::collections::HashMap;
use std::io::Read;
use std::sync::LazyLock;

/// Metadata key carrying a negotiation failure explanation.
pub const HANDSHAKE_ERROR_KEY: &str = "error";

static REQUEST_SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
    Schema::parse_str(
        r#"{
            "type": "record",
            "name": "HandshakeRequest",
            "namespace": "org.apache.avro.ipc",
            "fields": [
                {"name": "clientHash", "type": {"type": "fixed", "name": "MD5", "size": 16}},
                {"name": "clientProtocol", "type": ["null", "string"]},
                {"name": "serverHash", "type": "MD5"},
                {"name": "meta", "type": ["null", {"type": "map", "values": "bytes"}]}
            ]
        }"#,
    )
    .expect("handshake request schema")
});

static RESPONSE_SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
    Schema::parse_str(
        r#"{
            "type": "record",
            "name": "HandshakeResponse",
            "namespace": "org.apache.avro.ipc",
            "fields": [
                {"name": "match", "type": {"type": "enum", "name": "HandshakeMatch",
                                           "symbols": ["BOTH", "CLIENT", "NONE"]}},
                {"name": "serverProtocol", "type": ["null", "string"]},
                {"name": "serverHash",
                 "type": ["null", {"type": "fixed", "name": "MD5", "size": 16}]},
                {"name": "meta", "type": ["null", {"type": "map", "values": "bytes"}]}
            ]
        }"#,
    )
    .expect("handshake response schema")
});

/// Negotiation outcome reported by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMatch {
    /// Both peers speak the same protocol.
    Both,
    /// The listener recognizes the emitter's protocol (its own differs).
    Client,
    /// The emitter's protocol is unknown or incompatible.
    None,
}

impl HandshakeMatch {
    fn symbol(self) -> &'static str {
        match self {
            HandshakeMatch::Both => "BOTH",
            HandshakeMatch::Client => "CLIENT",
            HandshakeMatch::None => "NONE",
        }
    }

    fn index(self) -> u32 {
        match self {
            HandshakeMatch::Both => 0,
            HandshakeMatch::Client => 1,
            HandshakeMatch::None => 2,
        }
    }

    fn from_symbol(symbol: &str) -> Result<Self, ProtocolError> {
        match symbol {
            "BOTH" => Ok(HandshakeMatch::Both),
            "CLIENT" => Ok(HandshakeMatch::Client),
            "NONE" => Ok(HandshakeMatch::None),
            other => Err(ProtocolError::InvalidHandshake(format!(
                "unknown match symbol: {other}"
            ))),
        }
    }
}

/// First message from the emitter on a session.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeRequest {
    pub client_hash: [u8; 16],
    pub client_protocol: Option<String>,
    pub server_hash: [u8; 16],
    pub meta: Option<HashMap<String, Vec<u8>>>,
}

impl HandshakeRequest {
    /// Creates a request carrying only fingerprints (the first round).
    pub fn new(client_hash: [u8; 16], server_hash: [u8; 16]) -> Self {
        Self {
            client_hash,
            client_protocol: None,
            server_hash,
            meta: None,
        }
    }

    /// Appends the Avro encoding of the request.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let record = Value::Record(vec![
            (
                "clientHash".to_string(),
                Value::Fixed(16, self.client_hash.to_vec()),
            ),
            (
                "clientProtocol".to_string(),
                optional_string(&self.client_protocol),
            ),
            (
                "serverHash".to_string(),
                Value::Fixed(16, self.server_hash.to_vec()),
            ),
            ("meta".to_string(), optional_meta(&self.meta)),
        ]);
        out.extend_from_slice(&to_avro_datum(&REQUEST_SCHEMA, record)?);
        Ok(())
    }

    /// Reads a request from the cursor; undecodable bytes are
    /// [`ProtocolError::InvalidHandshake`].
    pub fn read(reader: &mut impl Read) -> Result<Self, ProtocolError> {
        let value = from_avro_datum(&REQUEST_SCHEMA, reader, None)
            .map_err(|e| ProtocolError::InvalidHandshake(e.to_string()))?;
        let mut fields = record_fields(value)?;
        Ok(Self {
            client_hash: take_fixed16(&mut fields, "clientHash")?,
            client_protocol: take_optional_string(&mut fields, "clientProtocol")?,
            server_hash: take_fixed16(&mut fields, "serverHash")?,
            meta: take_optional_meta(&mut fields, "meta")?,
        })
    }
}

/// Listener's reply to a [`HandshakeRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeResponse {
    pub matched: HandshakeMatch,
    pub server_protocol: Option<String>,
    pub server_hash: Option<[u8; 16]>,
    pub meta: Option<HashMap<String, Vec<u8>>>,
}

impl HandshakeResponse {
    /// A `BOTH` response: no server data needed.
    pub fn both() -> Self {
        Self {
            matched: HandshakeMatch::Both,
            server_protocol: None,
            server_hash: None,
            meta: None,
        }
    }

    /// A `CLIENT` response carrying the listener's protocol.
    pub fn client(server_protocol: String, server_hash: [u8; 16]) -> Self {
        Self {
            matched: HandshakeMatch::Client,
            server_protocol: Some(server_protocol),
            server_hash: Some(server_hash),
            meta: None,
        }
    }

    /// A `NONE` response prompting the emitter to resend with its
    /// protocol text.
    pub fn none(server_protocol: Option<String>, server_hash: Option<[u8; 16]>) -> Self {
        Self {
            matched: HandshakeMatch::None,
            server_protocol,
            server_hash,
            meta: None,
        }
    }

    /// A fatal `NONE` response carrying an explanation in `meta.error`.
    pub fn none_with_error(text: &str) -> Self {
        let mut meta = HashMap::new();
        meta.insert(HANDSHAKE_ERROR_KEY.to_string(), text.as_bytes().to_vec());
        Self {
            matched: HandshakeMatch::None,
            server_protocol: None,
            server_hash: None,
            meta: Some(meta),
        }
    }

    /// Returns the UTF-8 content of `meta.error`, if present.
    pub fn error_text(&self) -> Option<String> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.get(HANDSHAKE_ERROR_KEY))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Appends the Avro encoding of the response.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let record = Value::Record(vec![
            (
                "match".to_string(),
                Value::Enum(self.matched.index(), self.matched.symbol().to_string()),
            ),
            (
                "serverProtocol".to_string(),
                optional_string(&self.server_protocol),
            ),
            (
                "serverHash".to_string(),
                match self.server_hash {
                    Some(hash) => Value::Union(1, Box::new(Value::Fixed(16, hash.to_vec()))),
                    None => Value::Union(0, Box::new(Value::Null)),
                },
            ),
            ("meta".to_string(), optional_meta(&self.meta)),
        ]);
        out.extend_from_slice(&to_avro_datum(&RESPONSE_SCHEMA, record)?);
        Ok(())
    }

    /// Reads a response from the cursor.
    pub fn read(reader: &mut impl Read) -> Result<Self, ProtocolError> {
        let value = from_avro_datum(&RESPONSE_SCHEMA, reader, None)
            .map_err(|e| ProtocolError::InvalidHandshake(e.to_string()))?;
        let mut fields = record_fields(value)?;
        let matched = match take_field(&mut fields, "match")? {
            Value::Enum(_, symbol) => HandshakeMatch::from_symbol(&symbol)?,
            other => {
                return Err(ProtocolError::InvalidHandshake(format!(
                    "match is not an enum: {other:?}"
                )))
            }
        };
        let server_protocol = take_optional_string(&mut fields, "serverProtocol")?;
        let server_hash = match take_field(&mut fields, "serverHash")? {
            Value::Union(0, _) => None,
            Value::Union(_, inner) => Some(fixed16(*inner)?),
            other => {
                return Err(ProtocolError::InvalidHandshake(format!(
                    "serverHash is not a union: {other:?}"
                )))
            }
        };
        Ok(Self {
            matched,
            server_protocol,
            server_hash,
            meta: take_optional_meta(&mut fields, "meta")?,
        })
    }
}

fn optional_string(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::Union(1, Box::new(Value::String(s.clone()))),
        None => Value::Union(0, Box::new(Value::Null)),
    }
}

fn optional_meta(meta: &Option<HashMap<String, Vec<u8>>>) -> Value {
    match meta {
        Some(map) => Value::Union(
            1,
            Box::new(Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::Bytes(v.clone())))
                    .collect(),
            )),
        ),
        None => Value::Union(0, Box::new(Value::Null)),
    }
}

fn record_fields(value: Value) -> Result<Vec<(String, Value)>, ProtocolError> {
    match value {
        Value::Record(fields) => Ok(fields),
        other => Err(ProtocolError::InvalidHandshake(format!(
            "handshake is not a record: {other:?}"
        ))),
    }
}

fn take_field(
    fields: &mut Vec<(String, Value)>,
    name: &str,
) -> Result<Value, ProtocolError> {
    fields
        .iter()
        .position(|(field, _)| field == name)
        .map(|idx| fields.remove(idx).1)
        .ok_or_else(|| ProtocolError::InvalidHandshake(format!("missing field: {name}")))
}

fn fixed16(value: Value) -> Result<[u8; 16], ProtocolError> {
    match value {
        Value::Fixed(16, bytes) => bytes.try_into().map_err(|_| {
            ProtocolError::InvalidHandshake("fingerprint is not 16 bytes".to_string())
        }),
        other => Err(ProtocolError::InvalidHandshake(format!(
            "fingerprint is not a 16-byte fixed: {other:?}"
        ))),
    }
}

fn take_fixed16(
    fields: &mut Vec<(String, Value)>,
    name: &str,
) -> Result<[u8; 16], ProtocolError> {
    fixed16(take_field(fields, name)?)
}

fn take_optional_string(
    fields: &mut Vec<(String, Value)>,
    name: &str,
) -> Result<Option<String>, ProtocolError> {
    match take_field(fields, name)? {
        Value::Union(0, _) => Ok(None),
        Value::Union(_, inner) => match *inner {
            Value::String(s) => Ok(Some(s)),
            other => Err(ProtocolError::InvalidHandshake(format!(
                "{name} is not a string: {other:?}"
            ))),
        },
        other => Err(ProtocolError::InvalidHandshake(format!(
            "{name} is not a union: {other:?}"
        ))),
    }
}

fn take_optional_meta(
    fields: &mut Vec<(String, Value)>,
    name: &str,
) -> Result<Option<HashMap<String, Vec<u8>>>, ProtocolError> {
    match take_field(fields, name)? {
        Value::Union(0, _) => Ok(None),
        Value::Union(_, inner) => match *inner {
            Value::Map(map) => {
                let mut entries = HashMap::with_capacity(map.len());
                for (key, value) in map {
                    match value {
                        Value::Bytes(bytes) => {
                            entries.insert(key, bytes);
                        }
                        other => {
                            return Err(ProtocolError::InvalidHandshake(format!(
                                "{name} value for {key:?} is not bytes: {other:?}"
                            )));
                        }
                    }
                }
                Ok(Some(entries))
            }
            other => Err(ProtocolError::InvalidHandshake(format!(
                "{name} is not a map: {other:?}"
            ))),
        },
        other => Err(ProtocolError::InvalidHandshake(format!(
            "{name} is not a union: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: [u8; 16] = [
        0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
    ];

    #[test]
    fn test_request_roundtrip_minimal() {
        let request = HandshakeRequest::new(FP, FP);
        let mut buf = Vec::new();
        request.write(&mut buf).unwrap();

        let decoded = HandshakeRequest::read(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, request);
        assert!(decoded.client_protocol.is_none());
    }

    #[test]
    fn test_request_roundtrip_with_protocol_text() {
        let mut request = HandshakeRequest::new(FP, [9u8; 16]);
        request.client_protocol = Some(r#"{"protocol":"Empty"}"#.to_string());

        let mut buf = Vec::new();
        request.write(&mut buf).unwrap();
        let decoded = HandshakeRequest::read(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_response_both_roundtrip() {
        let response = HandshakeResponse::both();
        let mut buf = Vec::new();
        response.write(&mut buf).unwrap();
        let decoded = HandshakeResponse::read(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.matched, HandshakeMatch::Both);
        assert!(decoded.server_hash.is_none());
        assert!(decoded.error_text().is_none());
    }

    #[test]
    fn test_response_client_roundtrip() {
        let response = HandshakeResponse::client(r#"{"protocol":"P"}"#.to_string(), FP);
        let mut buf = Vec::new();
        response.write(&mut buf).unwrap();
        let decoded = HandshakeResponse::read(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.matched, HandshakeMatch::Client);
        assert_eq!(decoded.server_hash, Some(FP));
        assert_eq!(decoded.server_protocol.as_deref(), Some(r#"{"protocol":"P"}"#));
    }

    #[test]
    fn test_response_error_text() {
        let response = HandshakeResponse::none_with_error("incompatible one-way flag");
        let mut buf = Vec::new();
        response.write(&mut buf).unwrap();
        let decoded = HandshakeResponse::read(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.matched, HandshakeMatch::None);
        assert_eq!(
            decoded.error_text().as_deref(),
            Some("incompatible one-way flag")
        );
    }

    #[test]
    fn test_invalid_request_bytes() {
        let mut cursor = &[0xffu8, 0x03][..];
        assert!(matches!(
            HandshakeRequest::read(&mut cursor),
            Err(ProtocolError::InvalidHandshake(_))
        ));
    }

    #[test]
    fn test_cursor_position_after_request() {
        let request = HandshakeRequest::new(FP, FP);
        let mut buf = Vec::new();
        request.write(&mut buf).unwrap();
        buf.extend_from_slice(b"tail");

        let mut cursor = buf.as_slice();
        HandshakeRequest::read(&mut cursor).unwrap();
        assert_eq!(cursor, b"tail");
    }
}
