//! The type-system seam.
//!
//! Everything schema-shaped goes through this module: schema JSON
//! normalization (fully-qualified names, self-contained definitions),
//! canonical forms for fingerprinting, datum encoding/decoding, value
//! validation and writer/reader resolution. The Avro heavy lifting is
//! delegated to `apache-avro`; protocol documents only ever hand it
//! self-contained schema JSON.

use crate::error::CoreError;
use apache_avro::schema_compatibility::SchemaCompatibility;
use apache_avro::{from_avro_datum, to_avro_datum, types::Value, Schema};
use serde_json::{json, Map, Value as Json};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;

const PRIMITIVES: &[&str] = &[
    "null", "boolean", "int", "long", "float", "double", "bytes", "string",
];

fn is_primitive(name: &str) -> bool {
    PRIMITIVES.contains(&name)
}

/// Registry of a protocol's named types, normalized to fully-qualified
/// names, in declaration order.
#[derive(Debug, Default)]
pub struct TypeBook {
    defs: Vec<(String, Json)>,
    index: HashMap<String, usize>,
}

impl TypeBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Named type definitions in declaration order.
    pub fn defs(&self) -> &[(String, Json)] {
        &self.defs
    }

    /// Registers a top-level named type from a protocol's `types` array.
    pub fn define(&mut self, schema: &Json, namespace: Option<&str>) -> Result<(), CoreError> {
        let normalized = self.normalize(schema, namespace)?;
        match &normalized {
            Json::Object(obj) if obj.contains_key("name") => Ok(()),
            other => Err(CoreError::InvalidDocument(format!(
                "protocol types must be named declarations, got {other}"
            ))),
        }
    }

    /// Rewrites a schema so every name and reference is fully qualified.
    /// Named definitions encountered along the way are registered.
    pub fn normalize(
        &mut self,
        schema: &Json,
        namespace: Option<&str>,
    ) -> Result<Json, CoreError> {
        match schema {
            Json::String(name) => Ok(Json::String(self.qualify_reference(name, namespace))),
            Json::Array(branches) => {
                let mut out = Vec::with_capacity(branches.len());
                for branch in branches {
                    out.push(self.normalize(branch, namespace)?);
                }
                Ok(Json::Array(out))
            }
            Json::Object(obj) => self.normalize_object(obj, namespace),
            other => Err(CoreError::InvalidDocument(format!(
                "unexpected schema form: {other}"
            ))),
        }
    }

    fn normalize_object(
        &mut self,
        obj: &Map<String, Json>,
        namespace: Option<&str>,
    ) -> Result<Json, CoreError> {
        let kind = obj
            .get("type")
            .and_then(Json::as_str)
            .ok_or_else(|| {
                CoreError::InvalidDocument("schema object has no \"type\" string".to_string())
            })?
            .to_string();

        match kind.as_str() {
            "array" => {
                let items = obj.get("items").ok_or_else(|| {
                    CoreError::InvalidDocument("array schema has no \"items\"".to_string())
                })?;
                Ok(json!({"type": "array", "items": self.normalize(items, namespace)?}))
            }
            "map" => {
                let values = obj.get("values").ok_or_else(|| {
                    CoreError::InvalidDocument("map schema has no \"values\"".to_string())
                })?;
                Ok(json!({"type": "map", "values": self.normalize(values, namespace)?}))
            }
            "record" | "error" | "enum" | "fixed" => {
                self.normalize_named(&kind, obj, namespace)
            }
            other if is_primitive(other) => Ok(Json::String(other.to_string())),
            // Bare reference written as an object, e.g. {"type": "Foo"}.
            other => Ok(Json::String(self.qualify_reference(other, namespace))),
        }
    }

    fn normalize_named(
        &mut self,
        kind: &str,
        obj: &Map<String, Json>,
        namespace: Option<&str>,
    ) -> Result<Json, CoreError> {
        let name = obj.get("name").and_then(Json::as_str).ok_or_else(|| {
            CoreError::InvalidDocument(format!("{kind} schema has no \"name\""))
        })?;
        let declared_ns = obj.get("namespace").and_then(Json::as_str);
        let fullname = fullname(name, declared_ns, namespace);
        let own_ns = split_namespace(&fullname);

        if self.index.contains_key(&fullname) {
            return Err(CoreError::InvalidDocument(format!(
                "duplicate type definition: {fullname}"
            )));
        }
        // Reserve the slot before walking children so self-references
        // resolve.
        let slot = self.defs.len();
        self.index.insert(fullname.clone(), slot);
        self.defs.push((fullname.clone(), Json::Null));
        if !fullname.contains('.') || !self.index.contains_key(name) {
            self.index.entry(name.to_string()).or_insert(slot);
        }

        let mut out = Map::new();
        // Avro treats "error" records identically to "record" on the wire.
        let wire_kind = if kind == "error" { "record" } else { kind };
        out.insert("type".to_string(), Json::String(wire_kind.to_string()));
        out.insert("name".to_string(), Json::String(fullname.clone()));
        match wire_kind {
            "record" => {
                let fields = obj
                    .get("fields")
                    .and_then(Json::as_array)
                    .ok_or_else(|| {
                        CoreError::InvalidDocument(format!(
                            "record {fullname} has no \"fields\" array"
                        ))
                    })?;
                let mut out_fields = Vec::with_capacity(fields.len());
                for field in fields {
                    out_fields.push(self.normalize_field(field, own_ns.as_deref())?);
                }
                out.insert("fields".to_string(), Json::Array(out_fields));
            }
            "enum" => {
                let symbols = obj.get("symbols").cloned().ok_or_else(|| {
                    CoreError::InvalidDocument(format!("enum {fullname} has no \"symbols\""))
                })?;
                out.insert("symbols".to_string(), symbols);
            }
            "fixed" => {
                let size = obj.get("size").cloned().ok_or_else(|| {
                    CoreError::InvalidDocument(format!("fixed {fullname} has no \"size\""))
                })?;
                out.insert("size".to_string(), size);
            }
            _ => unreachable!("normalize_named only sees named kinds"),
        }
        let normalized = Json::Object(out);
        self.defs[slot].1 = normalized.clone();
        Ok(normalized)
    }

    fn normalize_field(
        &mut self,
        field: &Json,
        namespace: Option<&str>,
    ) -> Result<Json, CoreError> {
        let obj = field.as_object().ok_or_else(|| {
            CoreError::InvalidDocument("record field is not an object".to_string())
        })?;
        let name = obj.get("name").and_then(Json::as_str).ok_or_else(|| {
            CoreError::InvalidDocument("record field has no \"name\"".to_string())
        })?;
        let ftype = obj.get("type").ok_or_else(|| {
            CoreError::InvalidDocument(format!("field {name} has no \"type\""))
        })?;

        let mut out = Map::new();
        out.insert("name".to_string(), Json::String(name.to_string()));
        out.insert("type".to_string(), self.normalize(ftype, namespace)?);
        if let Some(default) = obj.get("default") {
            out.insert("default".to_string(), default.clone());
        }
        Ok(Json::Object(out))
    }

    fn qualify_reference(&self, name: &str, namespace: Option<&str>) -> String {
        if is_primitive(name) || name.contains('.') {
            return name.to_string();
        }
        if let Some(ns) = namespace {
            let qualified = format!("{ns}.{name}");
            if self.index.contains_key(&qualified) || !self.index.contains_key(name) {
                return qualified;
            }
        }
        name.to_string()
    }

    /// Produces a self-contained copy of a normalized schema: the first
    /// occurrence of every named reference is replaced by its full
    /// definition, later occurrences stay references.
    pub fn expand(&self, schema: &Json) -> Json {
        let mut defined = HashSet::new();
        self.expand_inner(schema, &mut defined)
    }

    fn expand_inner(&self, schema: &Json, defined: &mut HashSet<String>) -> Json {
        match schema {
            Json::String(name) => {
                if is_primitive(name) || defined.contains(name) {
                    return schema.clone();
                }
                match self.index.get(name) {
                    Some(&slot) => {
                        let (ref fullname, ref def) = self.defs[slot];
                        if defined.contains(fullname) {
                            return Json::String(fullname.clone());
                        }
                        defined.insert(fullname.clone());
                        self.expand_definition(def, defined)
                    }
                    // Unknown reference; schema parsing will report it.
                    None => schema.clone(),
                }
            }
            Json::Array(branches) => Json::Array(
                branches
                    .iter()
                    .map(|b| self.expand_inner(b, defined))
                    .collect(),
            ),
            Json::Object(_) => self.expand_definition(schema, defined),
            other => other.clone(),
        }
    }

    fn expand_definition(&self, def: &Json, defined: &mut HashSet<String>) -> Json {
        let Some(obj) = def.as_object() else {
            return def.clone();
        };
        if let Some(name) = obj.get("name").and_then(Json::as_str) {
            defined.insert(name.to_string());
        }
        let mut out = Map::new();
        for (key, value) in obj {
            let walked = match key.as_str() {
                "items" | "values" => self.expand_inner(value, defined),
                "fields" => Json::Array(
                    value
                        .as_array()
                        .map(|fields| {
                            fields
                                .iter()
                                .map(|field| self.expand_field(field, defined))
                                .collect()
                        })
                        .unwrap_or_default(),
                ),
                _ => value.clone(),
            };
            out.insert(key.clone(), walked);
        }
        Json::Object(out)
    }

    fn expand_field(&self, field: &Json, defined: &mut HashSet<String>) -> Json {
        let Some(obj) = field.as_object() else {
            return field.clone();
        };
        let mut out = Map::new();
        for (key, value) in obj {
            let walked = if key == "type" {
                self.expand_inner(value, defined)
            } else {
                value.clone()
            };
            out.insert(key.clone(), walked);
        }
        Json::Object(out)
    }
}

fn fullname(name: &str, declared_ns: Option<&str>, enclosing_ns: Option<&str>) -> String {
    if name.contains('.') {
        return name.to_string();
    }
    match declared_ns.filter(|ns| !ns.is_empty()).or(enclosing_ns) {
        Some(ns) => format!("{ns}.{name}"),
        None => name.to_string(),
    }
}

fn split_namespace(fullname: &str) -> Option<String> {
    fullname.rsplit_once('.').map(|(ns, _)| ns.to_string())
}

/// Reduces a normalized schema to its canonical form: only structural
/// attributes, in a fixed key order. The canonical text feeds the protocol
/// fingerprint and schema-equality checks.
pub fn canonical_schema(schema: &Json) -> Json {
    match schema {
        Json::String(_) => schema.clone(),
        Json::Array(branches) => Json::Array(branches.iter().map(canonical_schema).collect()),
        Json::Object(obj) => {
            let kind = obj.get("type").and_then(Json::as_str).unwrap_or("");
            if is_primitive(kind) {
                return Json::String(kind.to_string());
            }
            let mut out = Map::new();
            if let Some(name) = obj.get("name") {
                out.insert("name".to_string(), name.clone());
            }
            out.insert("type".to_string(), Json::String(kind.to_string()));
            match kind {
                "record" => {
                    let fields = obj
                        .get("fields")
                        .and_then(Json::as_array)
                        .map(|fields| {
                            fields
                                .iter()
                                .map(|field| {
                                    let mut f = Map::new();
                                    if let Some(name) = field.get("name") {
                                        f.insert("name".to_string(), name.clone());
                                    }
                                    if let Some(ftype) = field.get("type") {
                                        f.insert("type".to_string(), canonical_schema(ftype));
                                    }
                                    Json::Object(f)
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    out.insert("fields".to_string(), Json::Array(fields));
                }
                "enum" => {
                    if let Some(symbols) = obj.get("symbols") {
                        out.insert("symbols".to_string(), symbols.clone());
                    }
                }
                "fixed" => {
                    if let Some(size) = obj.get("size") {
                        out.insert("size".to_string(), size.clone());
                    }
                }
                "array" => {
                    if let Some(items) = obj.get("items") {
                        out.insert("items".to_string(), canonical_schema(items));
                    }
                }
                "map" => {
                    if let Some(values) = obj.get("values") {
                        out.insert("values".to_string(), canonical_schema(values));
                    }
                }
                _ => {}
            }
            Json::Object(out)
        }
        other => other.clone(),
    }
}

/// A parsed datum type: encode, decode and validate values of one schema.
#[derive(Debug, Clone)]
pub struct DatumType {
    schema: Arc<Schema>,
    json: Arc<Json>,
    canonical: Arc<str>,
}

impl DatumType {
    /// Parses a self-contained schema JSON value.
    pub fn parse(json: &Json) -> Result<Self, CoreError> {
        let schema = Schema::parse_str(&json.to_string())?;
        let canonical = canonical_schema(json).to_string();
        Ok(Self {
            schema: Arc::new(schema),
            json: Arc::new(json.clone()),
            canonical: canonical.into(),
        })
    }

    /// The `"null"` type.
    pub fn null() -> Self {
        Self {
            schema: Arc::new(Schema::Null),
            json: Arc::new(Json::String("null".to_string())),
            canonical: "\"null\"".into(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn json(&self) -> &Json {
        &self.json
    }

    /// Canonical text; two types with equal canonical text encode
    /// identically on the wire.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn is_null(&self) -> bool {
        matches!(*self.schema, Schema::Null)
    }

    pub fn is_valid(&self, value: &Value) -> bool {
        value.validate(&self.schema)
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, CoreError> {
        to_avro_datum(&self.schema, value.clone()).map_err(CoreError::Schema)
    }

    pub fn decode(&self, reader: &mut impl Read) -> Result<Value, CoreError> {
        from_avro_datum(&self.schema, reader, None).map_err(CoreError::Schema)
    }

    /// Describes why `value` does not fit this type, pointing at the
    /// offending leaf, e.g. `invalid "int": "hi"`.
    pub fn validation_error(&self, value: &Value) -> String {
        find_mismatch(&self.json, value)
            .unwrap_or_else(|| format!("invalid {}: {}", type_label(&self.json), show(value)))
    }
}

/// Reads data written under a compatible writer schema into the reader's
/// shape. Identity resolvers skip resolution entirely.
#[derive(Debug, Clone)]
pub struct Resolver {
    writer: DatumType,
    reader: Option<DatumType>,
}

impl Resolver {
    pub fn identity(datum: &DatumType) -> Self {
        Self {
            writer: datum.clone(),
            reader: None,
        }
    }

    /// Builds a resolver between two types, collapsing to identity when
    /// they are canonically equal.
    pub fn between(writer: &DatumType, reader: &DatumType) -> Self {
        if writer.canonical() == reader.canonical() {
            Self::identity(reader)
        } else {
            Self {
                writer: writer.clone(),
                reader: Some(reader.clone()),
            }
        }
    }

    pub fn read(&self, reader: &mut impl Read) -> Result<Value, CoreError> {
        let reader_schema = self.reader.as_ref().map(|t| t.schema());
        from_avro_datum(self.writer.schema(), reader, reader_schema).map_err(CoreError::Schema)
    }
}

/// Whether data written under `writer` can be read as `reader`.
pub fn can_read(writer: &DatumType, reader: &DatumType) -> bool {
    writer.canonical() == reader.canonical()
        || SchemaCompatibility::can_read(writer.schema(), reader.schema())
}

fn json_valid(schema: &Json, value: &Value) -> bool {
    match schema {
        Json::String(name) => match name.as_str() {
            "null" => matches!(value, Value::Null),
            "boolean" => matches!(value, Value::Boolean(_)),
            "int" => matches!(value, Value::Int(_)),
            "long" => matches!(value, Value::Int(_) | Value::Long(_)),
            "float" => matches!(value, Value::Int(_) | Value::Long(_) | Value::Float(_)),
            "double" => matches!(
                value,
                Value::Int(_) | Value::Long(_) | Value::Float(_) | Value::Double(_)
            ),
            "bytes" => matches!(value, Value::Bytes(_)),
            "string" => matches!(value, Value::String(_)),
            // Named reference: nothing to check locally.
            _ => true,
        },
        Json::Array(branches) => match value {
            Value::Union(index, inner) => branches
                .get(*index as usize)
                .is_some_and(|branch| json_valid(branch, inner)),
            other => branches.iter().any(|branch| json_valid(branch, other)),
        },
        Json::Object(obj) => {
            let kind = obj.get("type").and_then(Json::as_str).unwrap_or("");
            match kind {
                "record" => {
                    let Value::Record(entries) = value else {
                        return false;
                    };
                    let Some(fields) = obj.get("fields").and_then(Json::as_array) else {
                        return false;
                    };
                    fields.iter().all(|field| {
                        let name = field.get("name").and_then(Json::as_str).unwrap_or("");
                        let ftype = field.get("type").unwrap_or(&Json::Null);
                        match entries.iter().find(|(n, _)| n == name) {
                            Some((_, v)) => json_valid(ftype, v),
                            None => field.get("default").is_some(),
                        }
                    })
                }
                "enum" => {
                    let symbols = obj.get("symbols").and_then(Json::as_array);
                    let symbol = match value {
                        Value::Enum(_, s) => s.as_str(),
                        Value::String(s) => s.as_str(),
                        _ => return false,
                    };
                    symbols.is_some_and(|symbols| {
                        symbols.iter().any(|s| s.as_str() == Some(symbol))
                    })
                }
                "fixed" => {
                    let size = obj.get("size").and_then(Json::as_u64).unwrap_or(0) as usize;
                    matches!(value, Value::Fixed(n, bytes) if *n == size && bytes.len() == size)
                }
                "array" => {
                    let items = obj.get("items").unwrap_or(&Json::Null);
                    matches!(value, Value::Array(values)
                        if values.iter().all(|v| json_valid(items, v)))
                }
                "map" => {
                    let values_schema = obj.get("values").unwrap_or(&Json::Null);
                    matches!(value, Value::Map(entries)
                        if entries.values().all(|v| json_valid(values_schema, v)))
                }
                other if is_primitive(other) => {
                    json_valid(&Json::String(other.to_string()), value)
                }
                _ => true,
            }
        }
        _ => true,
    }
}

fn find_mismatch(schema: &Json, value: &Value) -> Option<String> {
    if json_valid(schema, value) {
        return None;
    }
    if let Json::Object(obj) = schema {
        if obj.get("type").and_then(Json::as_str) == Some("record") {
            if let (Value::Record(entries), Some(fields)) =
                (value, obj.get("fields").and_then(Json::as_array))
            {
                for field in fields {
                    let name = field.get("name").and_then(Json::as_str).unwrap_or("");
                    let ftype = field.get("type").unwrap_or(&Json::Null);
                    match entries.iter().find(|(n, _)| n == name) {
                        Some((_, v)) => {
                            if let Some(detail) = find_mismatch(ftype, v) {
                                return Some(detail);
                            }
                        }
                        None if field.get("default").is_none() => {
                            return Some(format!(
                                "invalid {}: missing field \"{name}\"",
                                type_label(schema)
                            ));
                        }
                        None => {}
                    }
                }
            }
        }
    }
    Some(format!("invalid {}: {}", type_label(schema), show(value)))
}

fn type_label(schema: &Json) -> String {
    match schema {
        Json::String(name) => format!("{:?}", short_name(name)),
        Json::Array(_) => "\"union\"".to_string(),
        Json::Object(obj) => {
            let kind = obj.get("type").and_then(Json::as_str).unwrap_or("?");
            match obj.get("name").and_then(Json::as_str) {
                Some(name) => format!("{:?}", short_name(name)),
                None => format!("{kind:?}"),
            }
        }
        _ => "\"?\"".to_string(),
    }
}

fn short_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn show(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Long(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Double(n) => n.to_string(),
        Value::String(s) => format!("{s:?}"),
        Value::Bytes(b) => format!("<{} bytes>", b.len()),
        Value::Record(_) => "{...}".to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_with(types: &[Json], ns: Option<&str>) -> TypeBook {
        let mut book = TypeBook::new();
        for t in types {
            book.define(t, ns).unwrap();
        }
        book
    }

    #[test]
    fn test_normalize_qualifies_names() {
        let book = book_with(
            &[json!({"type": "record", "name": "Pair",
                     "fields": [{"name": "left", "type": "int"},
                                {"name": "right", "type": "Pair"}]})],
            Some("org.example"),
        );
        let (fullname, def) = &book.defs()[0];
        assert_eq!(fullname, "org.example.Pair");
        assert_eq!(def["name"], "org.example.Pair");
        assert_eq!(def["fields"][1]["type"], "org.example.Pair");
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut book = TypeBook::new();
        let def = json!({"type": "fixed", "name": "Id", "size": 8});
        book.define(&def, None).unwrap();
        assert!(matches!(
            book.define(&def, None),
            Err(CoreError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_expand_is_self_contained() {
        let book = book_with(
            &[json!({"type": "enum", "name": "Suit",
                     "symbols": ["HEARTS", "SPADES"]})],
            None,
        );
        let expanded = book.expand(&json!({
            "type": "record", "name": "Hand",
            "fields": [{"name": "first", "type": "Suit"},
                       {"name": "second", "type": "Suit"}]
        }));
        // First use is the definition, second a reference.
        assert_eq!(expanded["fields"][0]["type"]["type"], "enum");
        assert_eq!(expanded["fields"][1]["type"], "Suit");
        DatumType::parse(&expanded).unwrap();
    }

    #[test]
    fn test_expand_recursive_type() {
        let book = book_with(
            &[json!({"type": "record", "name": "Node",
                     "fields": [{"name": "next", "type": ["null", "Node"]}]})],
            None,
        );
        let expanded = book.expand(&Json::String("Node".to_string()));
        let datum = DatumType::parse(&expanded).unwrap();
        assert!(!datum.is_null());
    }

    #[test]
    fn test_canonical_collapses_primitive_objects() {
        assert_eq!(
            canonical_schema(&json!({"type": "string"})),
            Json::String("string".to_string())
        );
    }

    #[test]
    fn test_canonical_is_deterministic() {
        let a = canonical_schema(&json!({
            "type": "record", "name": "R", "doc": "ignored",
            "fields": [{"name": "x", "type": "int", "doc": "ignored"}]
        }))
        .to_string();
        let b = canonical_schema(&json!({
            "fields": [{"doc": "ignored", "type": "int", "name": "x"}],
            "doc": "ignored", "name": "R", "type": "record"
        }))
        .to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn test_datum_roundtrip() {
        let datum = DatumType::parse(&json!({
            "type": "record", "name": "Point",
            "fields": [{"name": "x", "type": "int"}, {"name": "y", "type": "int"}]
        }))
        .unwrap();
        let value = Value::Record(vec![
            ("x".to_string(), Value::Int(3)),
            ("y".to_string(), Value::Int(-4)),
        ]);
        assert!(datum.is_valid(&value));

        let bytes = datum.encode(&value).unwrap();
        let decoded = datum.decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_validation_error_points_at_leaf() {
        let datum = DatumType::parse(&json!({
            "type": "record", "name": "Args",
            "fields": [{"name": "n", "type": "int"}]
        }))
        .unwrap();
        let bad = Value::Record(vec![("n".to_string(), Value::String("hi".to_string()))]);
        assert!(!datum.is_valid(&bad));
        let detail = datum.validation_error(&bad);
        assert!(detail.contains("invalid \"int\""), "got: {detail}");
        assert!(detail.contains("\"hi\""), "got: {detail}");
    }

    #[test]
    fn test_validation_error_missing_field() {
        let datum = DatumType::parse(&json!({
            "type": "record", "name": "Args",
            "fields": [{"name": "n", "type": "int"}]
        }))
        .unwrap();
        let bad = Value::Record(vec![]);
        let detail = datum.validation_error(&bad);
        assert!(detail.contains("missing field \"n\""), "got: {detail}");
    }

    #[test]
    fn test_resolver_promotes_int_to_long() {
        let writer = DatumType::parse(&json!("int")).unwrap();
        let reader = DatumType::parse(&json!("long")).unwrap();
        assert!(can_read(&writer, &reader));
        assert!(!can_read(&reader, &writer));

        let bytes = writer.encode(&Value::Int(20)).unwrap();
        let resolver = Resolver::between(&writer, &reader);
        let resolved = resolver.read(&mut bytes.as_slice()).unwrap();
        assert_eq!(resolved, Value::Long(20));
    }

    #[test]
    fn test_identity_resolver_collapses() {
        let a = DatumType::parse(&json!("string")).unwrap();
        let b = DatumType::parse(&json!({"type": "string"})).unwrap();
        assert_eq!(a.canonical(), b.canonical());
        let resolver = Resolver::between(&a, &b);
        let bytes = a.encode(&Value::String("ok".to_string())).unwrap();
        assert_eq!(
            resolver.read(&mut bytes.as_slice()).unwrap(),
            Value::String("ok".to_string())
        );
    }
}
