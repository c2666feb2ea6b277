//! Protocol objects.
//!
//! A [`Protocol`] is the immutable description of a named set of RPC
//! messages plus two mutable attachments: the resolver caches filled in as
//! peers are negotiated, and the handler registry the listener dispatches
//! through. Subprotocols share the description and the caches but get a
//! fresh registry.

use crate::error::CoreError;
use crate::message::{ClientResolution, Message, ServerResolution};
use crate::types::{canonical_schema, TypeBook};
use apache_avro::types::Value;
use dashmap::DashMap;
use md5::{Digest, Md5};
use serde_json::{Map, Value as Json};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future used by registered handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Construction options for [`Protocol::parse`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolOptions {
    /// Fail handlers whose declared error value matches no branch of the
    /// error union instead of coercing it to a system error.
    pub strict_errors: bool,
}

impl ProtocolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strict_errors(mut self, strict: bool) -> Self {
        self.strict_errors = strict;
        self
    }
}

/// An error produced by a message handler, mirroring the error union:
/// either a value of a declared error branch or a system error string.
#[derive(Debug, Clone)]
pub enum RemoteError {
    System(String),
    Declared(Value),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::System(text) => write!(f, "{text}"),
            RemoteError::Declared(value) => write!(f, "{value:?}"),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<String> for RemoteError {
    fn from(text: String) -> Self {
        RemoteError::System(text)
    }
}

impl From<&str> for RemoteError {
    fn from(text: &str) -> Self {
        RemoteError::System(text.to_string())
    }
}

/// Per-call context handed to handlers.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Message name being handled.
    pub message: String,
    /// Correlation id of the call (0 for one-way messages).
    pub correlation_id: i64,
    /// Fingerprint of the negotiated client protocol, when known.
    pub client_fingerprint: Option<[u8; 16]>,
}

/// A registered handler.
#[derive(Clone)]
pub enum Handler {
    TwoWay(Arc<dyn Fn(Value, CallContext) -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>),
    OneWay(Arc<dyn Fn(Value, CallContext) -> BoxFuture<'static, ()> + Send + Sync>),
}

/// Emitter-side resolvers negotiated against one peer, keyed by message.
///
/// Incompatibilities are kept per message and surfaced on the first
/// affected call rather than failing the whole session.
#[derive(Debug)]
pub struct ClientResolverSet {
    by_message: HashMap<String, Result<ClientResolution, String>>,
}

impl ClientResolverSet {
    pub fn get(&self, message: &str) -> Option<&Result<ClientResolution, String>> {
        self.by_message.get(message)
    }
}

/// Listener-side resolvers negotiated against one peer, keyed by message.
#[derive(Debug)]
pub struct ServerResolverSet {
    by_message: HashMap<String, ServerResolution>,
}

impl ServerResolverSet {
    pub fn get(&self, message: &str) -> Option<&ServerResolution> {
        self.by_message.get(message)
    }
}

struct ProtocolInner {
    name: String,
    document: String,
    options: ProtocolOptions,
    types: Vec<(String, Json)>,
    messages: Vec<Arc<Message>>,
    message_index: HashMap<String, usize>,
    fingerprint: [u8; 16],
    client_cache: DashMap<[u8; 16], Arc<ClientResolverSet>>,
    server_cache: DashMap<[u8; 16], Arc<ServerResolverSet>>,
}

/// A named collection of typed RPC messages.
///
/// Cloning yields another handle onto the same protocol (including its
/// handler registry); [`subprotocol`](Protocol::subprotocol) yields a
/// façade with an independent registry.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<ProtocolInner>,
    handlers: Arc<DashMap<String, Handler>>,
}

impl Protocol {
    /// Parses a protocol document.
    pub fn parse(document: &str, options: ProtocolOptions) -> Result<Self, CoreError> {
        let doc: Json = serde_json::from_str(document)
            .map_err(|e| CoreError::InvalidDocument(e.to_string()))?;

        let declared = doc
            .get("protocol")
            .and_then(Json::as_str)
            .filter(|name| !name.is_empty())
            .ok_or(CoreError::MissingName)?;
        let namespace = doc
            .get("namespace")
            .and_then(Json::as_str)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string);
        let (namespace, name) = match declared.rsplit_once('.') {
            Some((ns, _)) => (Some(ns.to_string()), declared.to_string()),
            None => {
                let full = match &namespace {
                    Some(ns) => format!("{ns}.{declared}"),
                    None => declared.to_string(),
                };
                (namespace, full)
            }
        };
        let namespace = namespace.as_deref();

        let mut book = TypeBook::new();
        if let Some(types) = doc.get("types") {
            let types = types.as_array().ok_or_else(|| {
                CoreError::InvalidDocument("\"types\" is not an array".to_string())
            })?;
            for schema in types {
                book.define(schema, namespace)?;
            }
        }

        let mut messages = Vec::new();
        let mut message_index = HashMap::new();
        if let Some(decls) = doc.get("messages") {
            let decls = decls.as_object().ok_or_else(|| {
                CoreError::InvalidDocument("\"messages\" is not an object".to_string())
            })?;
            for (msg_name, decl) in decls {
                let message = Message::parse(msg_name, decl, &mut book, namespace)?;
                message_index.insert(msg_name.clone(), messages.len());
                messages.push(Arc::new(message));
            }
        }

        let types: Vec<(String, Json)> = book.defs().to_vec();
        let fingerprint = fingerprint(&name, &types, &messages);

        Ok(Self {
            inner: Arc::new(ProtocolInner {
                name,
                document: document.to_string(),
                options,
                types,
                messages,
                message_index,
                fingerprint,
                client_cache: DashMap::new(),
                server_cache: DashMap::new(),
            }),
            handlers: Arc::new(DashMap::new()),
        })
    }

    /// Fully-qualified protocol name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The protocol text sent in handshakes.
    pub fn document(&self) -> &str {
        &self.inner.document
    }

    pub fn options(&self) -> ProtocolOptions {
        self.inner.options
    }

    /// MD5 of the canonical protocol representation.
    pub fn fingerprint(&self) -> [u8; 16] {
        self.inner.fingerprint
    }

    /// Named types in declaration order.
    pub fn types(&self) -> &[(String, Json)] {
        &self.inner.types
    }

    pub fn message(&self, name: &str) -> Option<&Arc<Message>> {
        self.inner
            .message_index
            .get(name)
            .map(|&idx| &self.inner.messages[idx])
    }

    pub fn messages(&self) -> &[Arc<Message>] {
        &self.inner.messages
    }

    /// Derives a protocol sharing this one's description and resolver
    /// caches but carrying its own handler registrations.
    pub fn subprotocol(&self) -> Protocol {
        Protocol {
            inner: self.inner.clone(),
            handlers: Arc::new(DashMap::new()),
        }
    }

    /// Registers a two-way handler for `message`.
    pub fn on<F, Fut>(&self, message: &str, handler: F) -> Result<(), CoreError>
    where
        F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let declared = self
            .message(message)
            .ok_or_else(|| CoreError::UnknownMessage(message.to_string()))?;
        if declared.is_one_way() {
            return Err(CoreError::HandlerMismatch(message.to_string()));
        }
        self.handlers.insert(
            message.to_string(),
            Handler::TwoWay(Arc::new(move |value, ctx| Box::pin(handler(value, ctx)))),
        );
        Ok(())
    }

    /// Registers a one-way handler for `message`.
    pub fn on_one_way<F, Fut>(&self, message: &str, handler: F) -> Result<(), CoreError>
    where
        F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let declared = self
            .message(message)
            .ok_or_else(|| CoreError::UnknownMessage(message.to_string()))?;
        if !declared.is_one_way() {
            return Err(CoreError::HandlerMismatch(message.to_string()));
        }
        self.handlers.insert(
            message.to_string(),
            Handler::OneWay(Arc::new(move |value, ctx| Box::pin(handler(value, ctx)))),
        );
        Ok(())
    }

    /// Looks up the registered handler for a message.
    pub fn handler(&self, message: &str) -> Option<Handler> {
        self.handlers.get(message).map(|entry| entry.value().clone())
    }

    /// Builds the emitter-side resolvers against a listener's protocol.
    /// Per-message incompatibilities are recorded, not raised.
    pub fn client_resolvers(&self, server: &Protocol) -> Arc<ClientResolverSet> {
        let mut by_message = HashMap::with_capacity(self.inner.messages.len());
        for message in &self.inner.messages {
            let entry = match server.message(message.name()) {
                None => Err(format!("missing server message: {}", message.name())),
                Some(peer) => message.resolve_as_client(peer),
            };
            by_message.insert(message.name().to_string(), entry);
        }
        Arc::new(ClientResolverSet { by_message })
    }

    /// Builds the listener-side resolvers against an emitter's protocol.
    /// Any incompatible or missing message fails the negotiation, per the
    /// handshake rules.
    pub fn server_resolvers(&self, client: &Protocol) -> Result<Arc<ServerResolverSet>, CoreError> {
        let mut by_message = HashMap::with_capacity(client.messages().len());
        for message in client.messages() {
            let own = self.message(message.name()).ok_or_else(|| {
                CoreError::Incompatible(format!("missing server message: {}", message.name()))
            })?;
            let resolution = own
                .resolve_as_server(message)
                .map_err(CoreError::Incompatible)?;
            by_message.insert(message.name().to_string(), resolution);
        }
        Ok(Arc::new(ServerResolverSet { by_message }))
    }

    pub fn cached_client_resolvers(&self, peer: &[u8; 16]) -> Option<Arc<ClientResolverSet>> {
        self.inner.client_cache.get(peer).map(|e| e.value().clone())
    }

    pub fn cache_client_resolvers(&self, peer: [u8; 16], set: Arc<ClientResolverSet>) {
        self.inner.client_cache.insert(peer, set);
    }

    pub fn cached_server_resolvers(&self, peer: &[u8; 16]) -> Option<Arc<ServerResolverSet>> {
        self.inner.server_cache.get(peer).map(|e| e.value().clone())
    }

    pub fn cache_server_resolvers(&self, peer: [u8; 16], set: Arc<ServerResolverSet>) {
        self.inner.server_cache.insert(peer, set);
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.inner.name)
            .field("messages", &self.inner.messages.len())
            .field("fingerprint", &self.inner.fingerprint)
            .finish()
    }
}

fn fingerprint(name: &str, types: &[(String, Json)], messages: &[Arc<Message>]) -> [u8; 16] {
    let mut doc = Map::new();
    doc.insert("protocol".to_string(), Json::String(name.to_string()));
    doc.insert(
        "types".to_string(),
        Json::Array(types.iter().map(|(_, def)| canonical_schema(def)).collect()),
    );
    let mut decls = Map::new();
    for message in messages {
        decls.insert(message.name().to_string(), message.canonical().clone());
    }
    doc.insert("messages".to_string(), Json::Object(decls));

    let mut hasher = Md5::new();
    hasher.update(Json::Object(doc).to_string().as_bytes());
    hasher.finalize().into()
}
