//! Session events.

use avrorpc_protocol::{HandshakeRequest, HandshakeResponse};

/// Events emitted over a session's lifetime.
///
/// `EndOfTransmission` is terminal and fires exactly once per session,
/// carrying the number of calls left pending at teardown.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The handshake exchange completed (in either direction).
    Handshake {
        request: HandshakeRequest,
        response: HandshakeResponse,
    },
    /// A non-fatal per-session error (invalid metadata, orphan response,
    /// undecodable handshake attempt).
    Error(String),
    /// The session is over; no further events follow.
    EndOfTransmission { pending: usize },
}

impl SessionEvent {
    /// Convenience predicate for tests and teardown logic.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::EndOfTransmission { .. })
    }
}
