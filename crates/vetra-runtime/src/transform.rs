//! Sink-side payload transformation: template rendering, field selection
//! and format encoding.

use crate::codec::Converter;
use crate::error::{EngineError, Result};
use crate::tuple::FxIndexMap;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use std::sync::Arc;
use vetra_core::Value;

/// Sink transform per the delivery contract:
/// 1. if a template is defined, render it to bytes and mark transformed;
/// 2. if `select` is off or no fields are configured, encode directly;
/// 3. otherwise re-parse the transformed bytes, select fields, encode.
#[derive(Debug, Clone)]
pub struct Transform {
    template: Option<Template>,
    fields: Vec<String>,
    converter: Converter,
}

impl Transform {
    pub fn new(template: Option<&str>, fields: Vec<String>, converter: Converter) -> Result<Self> {
        let template = template.map(Template::parse).transpose()?;
        Ok(Self {
            template,
            fields,
            converter,
        })
    }

    /// Returns the encoded bytes and whether the data was transformed.
    pub fn apply(&self, data: &FxIndexMap<Arc<str>, Value>, select: bool) -> Result<(Vec<u8>, bool)> {
        let mut transformed = false;
        let mut rendered: Option<Vec<u8>> = None;
        if let Some(tp) = &self.template {
            rendered = Some(tp.render(data)?);
            transformed = true;
        }

        if !select || self.fields.is_empty() {
            return match rendered {
                Some(bs) => Ok((bs, true)),
                None => Ok((self.converter.encode(data)?, false)),
            };
        }

        let source: FxIndexMap<Arc<str>, Value> = match rendered {
            Some(bs) => {
                let parsed: serde_json::Value = serde_json::from_slice(&bs).map_err(|e| {
                    EngineError::decode(format!(
                        "fail to decode data after applying template: {}",
                        e
                    ))
                })?;
                let serde_json::Value::Object(obj) = parsed else {
                    return Err(EngineError::decode(
                        "template output is not a json object".to_string(),
                    ));
                };
                obj.into_iter()
                    .map(|(k, v)| (Arc::from(k.as_str()), Value::from(v)))
                    .collect()
            }
            None => data.clone(),
        };

        let mut selected: FxIndexMap<Arc<str>, Value> = IndexMap::with_hasher(FxBuildHasher);
        for field in &self.fields {
            let v = source.get(field.as_str()).cloned().unwrap_or(Value::Null);
            selected.insert(Arc::from(field.as_str()), v);
        }
        Ok((self.converter.encode(&selected)?, true))
    }
}

/// Minimal `{{field}}` substitution template.
#[derive(Debug, Clone)]
pub struct Template {
    parts: Vec<TemplatePart>,
}

#[derive(Debug, Clone)]
enum TemplatePart {
    Literal(String),
    Field(String),
}

impl Template {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = text;
        while let Some(open) = rest.find("{{") {
            let Some(close_rel) = rest[open..].find("}}") else {
                return Err(EngineError::Plan(format!(
                    "unterminated placeholder in template {:?}",
                    text
                )));
            };
            let close = open + close_rel;
            if open > 0 {
                parts.push(TemplatePart::Literal(rest[..open].to_string()));
            }
            let field = rest[open + 2..close].trim();
            if field.is_empty() {
                return Err(EngineError::Plan("empty placeholder in template".to_string()));
            }
            parts.push(TemplatePart::Field(field.to_string()));
            rest = &rest[close + 2..];
        }
        if !rest.is_empty() {
            parts.push(TemplatePart::Literal(rest.to_string()));
        }
        Ok(Self { parts })
    }

    pub fn render(&self, data: &FxIndexMap<Arc<str>, Value>) -> Result<Vec<u8>> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(s) => out.push_str(s),
                TemplatePart::Field(f) => match data.get(f.as_str()) {
                    Some(Value::Str(s)) => out.push_str(s),
                    Some(v) => out.push_str(&v.to_string()),
                    None => {
                        return Err(EngineError::decode(format!(
                            "template field {} missing from data",
                            f
                        )))
                    }
                },
            }
        }
        Ok(out.into_bytes())
    }
}
