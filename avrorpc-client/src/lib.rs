//! # avrorpc-client
//!
//! Emitter state machines for the avrorpc runtime.
//!
//! Two variants share one handshake driver:
//! - [`StatefulEmitter`]: many correlated calls over one persistent
//!   duplex channel, with a pending table keyed by correlation id.
//! - [`StatelessEmitter`]: one call per channel, channels produced by an
//!   async factory.

pub mod emitter;
pub mod error;
pub mod stateless;

mod handshake;

pub use emitter::{EmitterConfig, StatefulEmitter};
pub use error::ClientError;
pub use stateless::StatelessEmitter;
