//! # avrorpc-core
//!
//! Protocol model for the avrorpc runtime.
//!
//! This crate provides:
//! - Protocol documents: parsing, fully-qualified naming, MD5 fingerprints
//! - Messages: request records, response types, error unions, one-way rules
//! - The type-system seam over `apache-avro` (datum coding and resolution)
//! - Resolver caches keyed by peer fingerprint, shared with subprotocols
//! - The runtime handler registry listeners dispatch through

pub mod error;
pub mod events;
pub mod message;
pub mod protocol;
pub mod types;

pub use error::CoreError;
pub use events::SessionEvent;
pub use message::{ClientResolution, Message, ServerResolution};
pub use protocol::{
    BoxFuture, CallContext, ClientResolverSet, Handler, Protocol, ProtocolOptions, RemoteError,
    ServerResolverSet,
};
pub use types::{can_read, DatumType, Resolver};

pub use apache_avro::types::Value;
pub use apache_avro::Schema;
