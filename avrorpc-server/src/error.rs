//! Server error types.

use avrorpc_core::CoreError;
use avrorpc_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while driving a listener session.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("session destroyed")]
    Destroyed,
}
