//! Call metadata.
//!
//! Every call and reply starts with an Avro `map<bytes>`. The runtime uses
//! a single key, the correlation id, stored as a zig-zag varint long;
//! other keys are carried transparently and echoed back on replies.

use crate::error::ProtocolError;
use apache_avro::{from_avro_datum, to_avro_datum, types::Value, Schema};
use std::collections::HashMap;
use std::io::Read;
use std::sync::LazyLock;

/// Metadata key holding the correlation id.
pub const CORRELATION_ID_KEY: &str = "avro.id";

static METADATA_SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
    Schema::parse_str(r#"{"type": "map", "values": "bytes"}"#).expect("metadata schema")
});

/// Metadata attached to a call or reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallMetadata {
    entries: HashMap<String, Vec<u8>>,
}

impl CallMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates metadata carrying the given correlation id.
    pub fn with_id(id: i64) -> Result<Self, ProtocolError> {
        let mut meta = Self::new();
        meta.set_id(id)?;
        Ok(meta)
    }

    /// Sets the correlation id entry.
    pub fn set_id(&mut self, id: i64) -> Result<(), ProtocolError> {
        let bytes = to_avro_datum(&Schema::Long, Value::Long(id))?;
        self.entries.insert(CORRELATION_ID_KEY.to_string(), bytes);
        Ok(())
    }

    /// Returns the correlation id.
    pub fn id(&self) -> Result<i64, ProtocolError> {
        let raw = self
            .entries
            .get(CORRELATION_ID_KEY)
            .ok_or(ProtocolError::MissingCorrelationId)?;
        let mut cursor = raw.as_slice();
        match from_avro_datum(&Schema::Long, &mut cursor, None) {
            Ok(Value::Long(id)) => Ok(id),
            Ok(other) => Err(ProtocolError::InvalidMetadata(format!(
                "unexpected correlation id value: {other:?}"
            ))),
            Err(e) => Err(ProtocolError::InvalidMetadata(e.to_string())),
        }
    }

    /// Inserts an arbitrary metadata entry.
    pub fn insert(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.entries.insert(key.into(), value);
    }

    /// Looks up a metadata entry.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends the Avro encoding of the metadata map.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let map = Value::Map(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), Value::Bytes(v.clone())))
                .collect(),
        );
        out.extend_from_slice(&to_avro_datum(&METADATA_SCHEMA, map)?);
        Ok(())
    }

    /// Reads a metadata map from the cursor.
    pub fn read(reader: &mut impl Read) -> Result<Self, ProtocolError> {
        let value = from_avro_datum(&METADATA_SCHEMA, reader, None)
            .map_err(|e| ProtocolError::InvalidMetadata(e.to_string()))?;
        let Value::Map(map) = value else {
            return Err(ProtocolError::InvalidMetadata(
                "metadata is not a map".to_string(),
            ));
        };
        let mut entries = HashMap::with_capacity(map.len());
        for (key, value) in map {
            match value {
                Value::Bytes(bytes) => {
                    entries.insert(key, bytes);
                }
                other => {
                    return Err(ProtocolError::InvalidMetadata(format!(
                        "metadata value for {key:?} is not bytes: {other:?}"
                    )));
                }
            }
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        for id in [1i64, 2, 63, 64, 100_000, i64::MAX] {
            let meta = CallMetadata::with_id(id).unwrap();
            assert_eq!(meta.id().unwrap(), id);

            let mut buf = Vec::new();
            meta.write(&mut buf).unwrap();
            let mut cursor = buf.as_slice();
            let decoded = CallMetadata::read(&mut cursor).unwrap();
            assert_eq!(decoded.id().unwrap(), id);
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn test_missing_id() {
        let meta = CallMetadata::new();
        assert!(matches!(
            meta.id(),
            Err(ProtocolError::MissingCorrelationId)
        ));
    }

    #[test]
    fn test_extra_keys_survive() {
        let mut meta = CallMetadata::with_id(7).unwrap();
        meta.insert("trace", b"abc".to_vec());

        let mut buf = Vec::new();
        meta.write(&mut buf).unwrap();
        let decoded = CallMetadata::read(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.id().unwrap(), 7);
        assert_eq!(decoded.get("trace"), Some(&b"abc"[..]));
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn test_invalid_bytes() {
        // A map claiming one entry but cut short.
        let mut cursor = &[0x02][..];
        assert!(matches!(
            CallMetadata::read(&mut cursor),
            Err(ProtocolError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_cursor_advances_past_map() {
        let meta = CallMetadata::with_id(3).unwrap();
        let mut buf = Vec::new();
        meta.write(&mut buf).unwrap();
        buf.extend_from_slice(b"rest");

        let mut cursor = buf.as_slice();
        CallMetadata::read(&mut cursor).unwrap();
        assert_eq!(cursor, b"rest");
    }
}
