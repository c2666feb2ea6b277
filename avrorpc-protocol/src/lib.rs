//! # avrorpc-protocol
//!
//! Wire layer for the avrorpc runtime.
//!
//! This crate provides:
//! - Message framing (length-prefixed frames, zero-length terminator)
//! - Call metadata carrying the correlation id
//! - Handshake request/response records and their Avro encoding
//! - Wire-level primitive helpers (message names, the error flag byte)

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod metadata;

pub use error::ProtocolError;
pub use frame::{FrameDecoder, FrameEncoder};
pub use handshake::{HandshakeMatch, HandshakeRequest, HandshakeResponse};
pub use metadata::{CallMetadata, CORRELATION_ID_KEY};

/// Default frame size used when splitting messages (8 KiB).
pub const DEFAULT_FRAME_SIZE: usize = 8 * 1024;

/// Default read buffer size for session loops (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Maximum reassembled message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
