//! Wire-level primitive helpers.
//!
//! Calls and replies interleave a handful of bare Avro primitives with
//! schema-typed payloads: the message name (string), the reply error flag
//! (boolean) and the string branch of an error union. The cursor is a
//! plain `&mut impl Read` advanced by successive datum reads.

use crate::error::ProtocolError;
use apache_avro::{from_avro_datum, to_avro_datum, types::Value, Schema};
use std::io::Read;

/// Appends an Avro-encoded string.
pub fn write_string(value: &str, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    out.extend_from_slice(&to_avro_datum(
        &Schema::String,
        Value::String(value.to_string()),
    )?);
    Ok(())
}

/// Reads an Avro-encoded string.
pub fn read_string(reader: &mut impl Read) -> Result<String, ProtocolError> {
    match from_avro_datum(&Schema::String, reader, None) {
        Ok(Value::String(s)) => Ok(s),
        Ok(_) => Err(ProtocolError::TruncatedMessage),
        Err(_) => Err(ProtocolError::TruncatedMessage),
    }
}

/// Appends the reply error flag (one byte: 0 = response, 1 = error).
pub fn write_flag(is_error: bool, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    out.extend_from_slice(&to_avro_datum(&Schema::Boolean, Value::Boolean(is_error))?);
    Ok(())
}

/// Reads the reply error flag.
pub fn read_flag(reader: &mut impl Read) -> Result<bool, ProtocolError> {
    match from_avro_datum(&Schema::Boolean, reader, None) {
        Ok(Value::Boolean(b)) => Ok(b),
        Ok(_) => Err(ProtocolError::TruncatedMessage),
        Err(_) => Err(ProtocolError::TruncatedMessage),
    }
}

/// Appends a system error as the string branch of an error union.
///
/// Every error union declares `string` as branch zero, so the encoding is
/// the branch index followed by the string itself. This is how errors are
/// reported for messages whose declared union is unknown or unusable.
pub fn write_error_string(text: &str, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    out.extend_from_slice(&to_avro_datum(&Schema::Long, Value::Long(0))?);
    write_string(text, out)
}
