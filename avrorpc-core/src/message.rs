//! RPC message model.
//!
//! A message couples a request record (built from the declared fields), a
//! response type and an error union whose first branch is always `string`
//! (the carrier for system errors). One-way messages respond with nothing
//! and may not declare errors.

use crate::error::CoreError;
use crate::types::{can_read, canonical_schema, DatumType, Resolver, TypeBook};
use serde_json::{json, Map, Value as Json};

/// A single RPC endpoint.
#[derive(Debug, Clone)]
pub struct Message {
    name: String,
    request: DatumType,
    response: DatumType,
    errors: DatumType,
    error_branches: usize,
    one_way: bool,
    canonical: Json,
}

/// Resolvers an emitter needs for one negotiated message: decoding the
/// listener's responses and errors.
#[derive(Debug, Clone)]
pub struct ClientResolution {
    pub response: Resolver,
    pub errors: Resolver,
}

/// Resolvers a listener needs for one negotiated message: decoding the
/// emitter's requests.
#[derive(Debug, Clone)]
pub struct ServerResolution {
    pub request: Resolver,
}

impl Message {
    /// Builds a message from its protocol declaration.
    pub(crate) fn parse(
        name: &str,
        decl: &Json,
        book: &mut TypeBook,
        namespace: Option<&str>,
    ) -> Result<Self, CoreError> {
        if !valid_name(name) {
            return Err(CoreError::InvalidMessage(
                name.to_string(),
                "name is not a valid identifier".to_string(),
            ));
        }
        let decl = decl.as_object().ok_or_else(|| {
            CoreError::InvalidMessage(name.to_string(), "declaration is not an object".to_string())
        })?;

        let one_way = decl.get("one-way").and_then(Json::as_bool).unwrap_or(false);

        // Request record from the declared fields.
        let fields = decl.get("request").and_then(Json::as_array).ok_or_else(|| {
            CoreError::InvalidMessage(name.to_string(), "missing request fields".to_string())
        })?;
        let mut normalized_fields = Vec::with_capacity(fields.len());
        for field in fields {
            normalized_fields.push(normalize_field(field, name, book, namespace)?);
        }
        let request_record = json!({
            "type": "record",
            "name": format!("{name}Request"),
            "fields": normalized_fields,
        });
        let request = DatumType::parse(&book.expand(&request_record))?;

        // Response type; one-way messages must respond with null.
        let response_decl = decl.get("response");
        let response = match response_decl {
            Some(schema) => {
                let normalized = book.normalize(schema, namespace)?;
                DatumType::parse(&book.expand(&normalized))?
            }
            None if one_way => DatumType::null(),
            None => return Err(CoreError::MissingResponse(name.to_string())),
        };
        if one_way && !response.is_null() {
            return Err(CoreError::InvalidOneWay(name.to_string()));
        }

        // Error union: string first, declared branches after.
        let declared_errors = decl
            .get("errors")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();
        if one_way && !declared_errors.is_empty() {
            return Err(CoreError::InvalidOneWay(name.to_string()));
        }
        let mut branches = vec![Json::String("string".to_string())];
        for branch in &declared_errors {
            branches.push(book.normalize(branch, namespace)?);
        }
        let error_branches = branches.len();
        let errors_union = Json::Array(branches.clone());
        let errors = DatumType::parse(&book.expand(&errors_union))?;

        // Canonical declaration for the protocol fingerprint.
        let mut canonical = Map::new();
        canonical.insert(
            "request".to_string(),
            Json::Array(
                request_record["fields"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .iter()
                    .map(|field| {
                        json!({
                            "name": field["name"].clone(),
                            "type": canonical_schema(&field["type"]),
                        })
                    })
                    .collect(),
            ),
        );
        canonical.insert(
            "response".to_string(),
            canonical_schema(response.json()),
        );
        if !declared_errors.is_empty() {
            canonical.insert(
                "errors".to_string(),
                Json::Array(branches[1..].iter().map(canonical_schema).collect()),
            );
        }
        if one_way {
            canonical.insert("one-way".to_string(), Json::Bool(true));
        }

        Ok(Self {
            name: name.to_string(),
            request,
            response,
            errors,
            error_branches,
            one_way,
            canonical: Json::Object(canonical),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request(&self) -> &DatumType {
        &self.request
    }

    pub fn response(&self) -> &DatumType {
        &self.response
    }

    /// The error union (branch 0 is `string`).
    pub fn errors(&self) -> &DatumType {
        &self.errors
    }

    /// Number of branches in the error union, including the string branch.
    pub fn error_branches(&self) -> usize {
        self.error_branches
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    pub(crate) fn canonical(&self) -> &Json {
        &self.canonical
    }

    /// Checks compatibility with the listener's declaration of this
    /// message and builds the emitter-side resolvers.
    pub fn resolve_as_client(&self, server: &Message) -> Result<ClientResolution, String> {
        self.check_pair(server, self, server)?;
        Ok(ClientResolution {
            response: Resolver::between(&server.response, &self.response),
            errors: Resolver::between(&server.errors, &self.errors),
        })
    }

    /// Checks compatibility with the emitter's declaration of this
    /// message and builds the listener-side resolvers.
    pub fn resolve_as_server(&self, client: &Message) -> Result<ServerResolution, String> {
        self.check_pair(client, client, self)?;
        Ok(ServerResolution {
            request: Resolver::between(&client.request, &self.request),
        })
    }

    /// Shared §compatibility rule: request written by the emitter must be
    /// readable by the listener, response and errors written by the
    /// listener must be readable by the emitter, and the one-way flags
    /// must agree.
    fn check_pair(
        &self,
        other: &Message,
        emitter: &Message,
        listener: &Message,
    ) -> Result<(), String> {
        if self.one_way != other.one_way {
            return Err(format!(
                "incompatible one-way flag for message \"{}\"",
                self.name
            ));
        }
        if !can_read(&emitter.request, &listener.request) {
            return Err(format!("incompatible request for message \"{}\"", self.name));
        }
        if !can_read(&listener.response, &emitter.response) {
            return Err(format!(
                "incompatible response for message \"{}\"",
                self.name
            ));
        }
        if !can_read(&listener.errors, &emitter.errors) {
            return Err(format!("incompatible errors for message \"{}\"", self.name));
        }
        Ok(())
    }
}

fn normalize_field(
    field: &Json,
    message: &str,
    book: &mut TypeBook,
    namespace: Option<&str>,
) -> Result<Json, CoreError> {
    let obj = field.as_object().ok_or_else(|| {
        CoreError::InvalidMessage(message.to_string(), "request field is not an object".to_string())
    })?;
    let name = obj.get("name").and_then(Json::as_str).ok_or_else(|| {
        CoreError::InvalidMessage(message.to_string(), "request field has no name".to_string())
    })?;
    let ftype = obj.get("type").ok_or_else(|| {
        CoreError::InvalidMessage(
            message.to_string(),
            format!("request field {name} has no type"),
        )
    })?;
    let mut out = Map::new();
    out.insert("name".to_string(), Json::String(name.to_string()));
    out.insert("type".to_string(), book.normalize(ftype, namespace)?);
    if let Some(default) = obj.get("default") {
        out.insert("default".to_string(), default.clone());
    }
    Ok(Json::Object(out))
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
