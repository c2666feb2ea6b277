//! Client error types.

use avrorpc_core::{CoreError, RemoteError};
use avrorpc_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced to emitter callers.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// The request value does not fit the message's request record, e.g.
    /// `invalid "int": "hi"`.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("missing server message: {0}")]
    MissingServerMessage(String),

    /// A peer incompatibility recorded at handshake time and surfaced on
    /// the first affected call.
    #[error("{0}")]
    Incompatible(String),

    #[error("handshake error: {0}")]
    Handshake(String),

    /// The session was torn down while this call was in flight.
    #[error("interrupted")]
    Interrupted,

    /// The session no longer accepts calls.
    #[error("destroyed")]
    Destroyed,

    /// A reply arrived but its payload could not be decoded.
    #[error("truncated message")]
    Truncated,

    /// The reply stream ended without a complete framed response.
    #[error("no message decoded")]
    NoMessageDecoded,

    /// The peer reported an error: either a declared error-union value or
    /// a system error string.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The stateless channel factory failed before a channel existed.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl ClientError {
    /// Returns the remote error, if this is one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            ClientError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}
