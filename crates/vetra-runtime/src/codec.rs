//! Format decoding/encoding and the schema layer for shared streams.

use crate::error::{EngineError, Result};
use crate::tuple::FxIndexMap;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use vetra_core::Value;

/// Wire format of a stream's payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Json,
    /// Header-less delimiter-separated values; field names come from the
    /// schema, in order.
    Delimited { delimiter: char },
}

impl Default for Format {
    fn default() -> Self {
        Format::Json
    }
}

/// Declared field shape of a stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Field names in declaration order. Values outside this set are
    /// projected away unless the schema is a wildcard.
    pub fields: Vec<String>,
}

impl Schema {
    pub fn new(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Payload produced by a decode.
#[derive(Debug, Clone)]
pub enum Decoded {
    One(FxIndexMap<Arc<str>, Value>),
    /// An array payload; elements may or may not be maps. Non-map elements
    /// are turned into error tuples by the decode operator.
    Many(Vec<Value>),
}

/// Decoder/encoder keyed by `(format, schema, delimiter)`.
#[derive(Debug, Clone)]
pub struct Converter {
    format: Format,
    /// `None` means wildcard: decode everything as-is.
    schema: Option<Schema>,
}

impl Converter {
    pub fn new(format: Format, schema: Option<Schema>) -> Self {
        Self { format, schema }
    }

    /// Swap in the schema view computed by the schema layer.
    pub fn reset_schema(&mut self, schema: Option<Schema>) {
        self.schema = schema;
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn decode(&self, raw: &[u8]) -> Result<Decoded> {
        match &self.format {
            Format::Json => self.decode_json(raw),
            Format::Delimited { delimiter } => self.decode_delimited(raw, *delimiter),
        }
    }

    fn decode_json(&self, raw: &[u8]) -> Result<Decoded> {
        let parsed: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| EngineError::decode(format!("invalid json: {}", e)))?;
        match parsed {
            serde_json::Value::Object(obj) => {
                let map = self.project(obj.into_iter().map(|(k, v)| (k, Value::from(v))));
                Ok(Decoded::One(map))
            }
            serde_json::Value::Array(arr) => {
                Ok(Decoded::Many(arr.into_iter().map(Value::from).collect()))
            }
            other => Err(EngineError::decode(format!(
                "expect json object or array but got {}",
                other
            ))),
        }
    }

    fn decode_delimited(&self, raw: &[u8], delimiter: char) -> Result<Decoded> {
        let Some(schema) = &self.schema else {
            return Err(EngineError::decode(
                "delimited format requires a schema".to_string(),
            ));
        };
        let text = std::str::from_utf8(raw)
            .map_err(|e| EngineError::decode(format!("invalid utf-8: {}", e)))?;
        let mut map: FxIndexMap<Arc<str>, Value> = IndexMap::with_hasher(FxBuildHasher);
        for (name, field) in schema.fields.iter().zip(text.trim_end().split(delimiter)) {
            map.insert(Arc::from(name.as_str()), parse_scalar(field));
        }
        Ok(Decoded::One(map))
    }

    /// Project a decoded map through the schema. Wildcard keeps everything.
    pub fn project(
        &self,
        entries: impl IntoIterator<Item = (String, Value)>,
    ) -> FxIndexMap<Arc<str>, Value> {
        let mut map: FxIndexMap<Arc<str>, Value> = IndexMap::with_hasher(FxBuildHasher);
        match &self.schema {
            None => {
                for (k, v) in entries {
                    map.insert(Arc::from(k.as_str()), v);
                }
            }
            Some(schema) => {
                for (k, v) in entries {
                    if schema.fields.iter().any(|f| f == &k) {
                        map.insert(Arc::from(k.as_str()), v);
                    }
                }
            }
        }
        map
    }

    pub fn encode(&self, payload: &FxIndexMap<Arc<str>, Value>) -> Result<Vec<u8>> {
        match &self.format {
            Format::Json => serde_json::to_vec(payload)
                .map_err(|e| EngineError::decode(format!("encode json: {}", e))),
            Format::Delimited { delimiter } => {
                let Some(schema) = &self.schema else {
                    return Err(EngineError::decode(
                        "delimited format requires a schema".to_string(),
                    ));
                };
                let line = schema
                    .fields
                    .iter()
                    .map(|f| match payload.get(f.as_str()) {
                        Some(Value::Str(s)) => s.clone(),
                        Some(v) => v.to_string(),
                        None => String::new(),
                    })
                    .collect::<Vec<_>>()
                    .join(&delimiter.to_string());
                Ok(line.into_bytes())
            }
        }
    }
}

fn parse_scalar(field: &str) -> Value {
    if let Ok(i) = field.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = field.parse::<f64>() {
        Value::Float(f)
    } else if let Ok(b) = field.parse::<bool>() {
        Value::Bool(b)
    } else {
        Value::Str(field.to_string())
    }
}

#[derive(Debug, Clone)]
struct AttachedSchema {
    schema: Option<Schema>,
    wildcard: bool,
}

/// Per-source schema layer for streams shared by several rules.
///
/// Each rule attaches its view of the stream; the effective schema is the
/// union of all attached fields, or wildcard if any rule is schemaless.
/// Detach leaves the union of the remaining rules. Copy-on-write: the
/// converter receives a freshly computed schema after each change.
#[derive(Debug, Default)]
pub struct SchemaLayer {
    attached: HashMap<String, AttachedSchema>,
}

impl SchemaLayer {
    pub fn new(rule_id: &str, schema: Option<Schema>, wildcard: bool) -> Self {
        let mut layer = Self::default();
        layer.merge(rule_id, schema, wildcard);
        layer
    }

    /// Attach or replace one rule's schema. Merging is additive.
    pub fn merge(&mut self, rule_id: &str, schema: Option<Schema>, wildcard: bool) {
        self.attached
            .insert(rule_id.to_string(), AttachedSchema { schema, wildcard });
    }

    /// Detach one rule's schema. Returns whether anything changed.
    pub fn detach(&mut self, rule_id: &str) -> bool {
        self.attached.remove(rule_id).is_some()
    }

    /// The merged schema view: `None` when any attached rule is wildcard or
    /// schemaless.
    pub fn effective(&self) -> Option<Schema> {
        if self.attached.is_empty() {
            return None;
        }
        let mut fields: Vec<String> = Vec::new();
        for att in self.attached.values() {
            if att.wildcard {
                return None;
            }
            match &att.schema {
                None => return None,
                Some(s) => {
                    for f in &s.fields {
                        if !fields.contains(f) {
                            fields.push(f.clone());
                        }
                    }
                }
            }
        }
        Some(Schema { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_json_object() {
        let conv = Converter::new(Format::Json, None);
        let out = conv.decode(br#"{"a": 1, "b": "x"}"#).unwrap();
        match out {
            Decoded::One(map) => {
                assert_eq!(map.get("a"), Some(&Value::Int(1)));
                assert_eq!(map.get("b"), Some(&Value::Str("x".to_string())));
            }
            _ => panic!("expected single map"),
        }
    }

    #[test]
    fn test_decode_json_array() {
        let conv = Converter::new(Format::Json, None);
        let out = conv.decode(br#"[{"a": 1}, {"a": 2}, 3]"#).unwrap();
        match out {
            Decoded::Many(items) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0].get("a"), Some(&Value::Int(1)));
                assert_eq!(items[2], Value::Int(3));
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn test_decode_json_scalar_is_error() {
        let conv = Converter::new(Format::Json, None);
        assert!(conv.decode(b"42").is_err());
        assert!(conv.decode(b"not json").is_err());
    }

    #[test]
    fn test_schema_projection() {
        let conv = Converter::new(Format::Json, Some(Schema::new(["a", "c"])));
        let out = conv.decode(br#"{"a": 1, "b": 2, "c": 3}"#).unwrap();
        match out {
            Decoded::One(map) => {
                assert_eq!(map.len(), 2);
                assert!(map.get("b").is_none());
            }
            _ => panic!("expected single map"),
        }
    }

    #[test]
    fn test_delimited_roundtrip() {
        let conv = Converter::new(
            Format::Delimited { delimiter: ',' },
            Some(Schema::new(["device", "temp"])),
        );
        let out = conv.decode(b"dev1,21.5").unwrap();
        let map = match out {
            Decoded::One(map) => map,
            _ => panic!("expected single map"),
        };
        assert_eq!(map.get("device"), Some(&Value::Str("dev1".to_string())));
        assert_eq!(map.get("temp"), Some(&Value::Float(21.5)));

        let encoded = conv.encode(&map).unwrap();
        assert_eq!(encoded, b"dev1,21.5");
    }

    #[test]
    fn test_json_roundtrip() {
        let conv = Converter::new(Format::Json, None);
        let out = conv.decode(br#"{"a":1,"b":"x"}"#).unwrap();
        let map = match out {
            Decoded::One(map) => map,
            _ => panic!("expected single map"),
        };
        let encoded = conv.encode(&map).unwrap();
        let again = conv.decode(&encoded).unwrap();
        match again {
            Decoded::One(map2) => assert_eq!(map, map2),
            _ => panic!("expected single map"),
        }
    }

    #[test]
    fn test_schema_layer_union_and_detach() {
        let mut layer = SchemaLayer::new("r1", Some(Schema::new(["a"])), false);
        layer.merge("r2", Some(Schema::new(["b", "a"])), false);
        let eff = layer.effective().unwrap();
        assert_eq!(eff.fields, vec!["a".to_string(), "b".to_string()]);

        assert!(layer.detach("r2"));
        let eff = layer.effective().unwrap();
        assert_eq!(eff.fields, vec!["a".to_string()]);
        assert!(!layer.detach("r2"));
    }

    #[test]
    fn test_schema_layer_wildcard_wins() {
        let mut layer = SchemaLayer::new("r1", Some(Schema::new(["a"])), false);
        layer.merge("r2", None, true);
        assert!(layer.effective().is_none());
        layer.detach("r2");
        assert!(layer.effective().is_some());
    }
}
