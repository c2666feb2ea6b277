//! Protocol error types.

use thiserror::Error;

/// Wire-level errors raised while framing or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("missing correlation id")]
    MissingCorrelationId,

    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("truncated message")]
    TruncatedMessage,

    #[error("avro error: {0}")]
    Avro(#[from] apache_avro::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
