//! Declarative output schemas and validation.
//!
//! Schemas are plain data (serializable, comparable), not trait
//! hierarchies, so a pipeline can declare the shape it expects and the
//! validator can map raw model output into a typed value or reject it.
//! Model output is messy in practice; the validator strips markdown
//! fences, tolerates stray prose around the JSON body, and coerces
//! near-miss scalar types instead of failing outright.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;

/// Maximum raw byte length of model output accepted by the validator.
const MAX_RAW_OUTPUT_LEN: usize = 200_000;

/// A named output schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema name, used in error messages and logs.
    pub name: String,
    /// Root node; almost always an object.
    pub root: SchemaNode,
}

impl Schema {
    /// Creates an object schema from field specs.
    #[must_use]
    pub fn object(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            root: SchemaNode::Object { fields },
        }
    }
}

/// A single node in a schema tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchemaNode {
    /// A JSON object with declared fields. Unknown fields are dropped.
    Object {
        /// Declared fields.
        fields: Vec<FieldSpec>,
    },
    /// A string, optionally restricted to an enumerated set.
    String {
        /// Allowed values (case-insensitive match, canonical form kept).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enum_values: Option<Vec<String>>,
        /// Maximum length in bytes; longer values are truncated.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_len: Option<usize>,
    },
    /// A floating-point number, clamped to the given bounds.
    Number {
        /// Inclusive lower bound.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        /// Inclusive upper bound.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// An integer, clamped to the given bounds.
    Integer {
        /// Inclusive lower bound.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        /// Inclusive upper bound.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    /// A boolean.
    Boolean,
    /// An array of homogeneous items, truncated to `max_items`.
    Array {
        /// Item schema.
        items: Box<SchemaNode>,
        /// Maximum item count; extra items are dropped.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_items: Option<usize>,
    },
}

/// A declared object field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Field schema.
    pub node: SchemaNode,
    /// Whether the field must be present (after defaulting).
    pub required: bool,
    /// Value substituted when the field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSpec {
    /// A required field with no default.
    #[must_use]
    pub fn required(name: impl Into<String>, node: SchemaNode) -> Self {
        Self {
            name: name.into(),
            node,
            required: true,
            default: None,
        }
    }

    /// An optional field that falls back to `default` when absent.
    #[must_use]
    pub fn with_default(name: impl Into<String>, node: SchemaNode, default: Value) -> Self {
        Self {
            name: name.into(),
            node,
            required: false,
            default: Some(default),
        }
    }
}

/// Validates raw model output against a declared [`Schema`].
pub trait SchemaValidator: Send + Sync {
    /// Parses and coerces `raw` into a value matching `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SchemaValidation`] when the output cannot
    /// be parsed as JSON or a required field is missing or untypeable.
    fn validate(&self, schema: &Schema, raw: &str) -> Result<Value, ClientError>;
}

/// Default validator: strips delimiters, parses, coerces scalars.
#[derive(Debug, Clone, Copy, Default)]
pub struct LenientValidator;

impl LenientValidator {
    fn reject(schema: &Schema, raw: &str, message: String) -> ClientError {
        ClientError::SchemaValidation {
            message: format!("schema '{}': {message}", schema.name),
            content: raw.to_string(),
        }
    }

    /// Extracts the JSON body from raw model output.
    ///
    /// Strips markdown code fences first; if the remainder still fails
    /// to parse, falls back to the outermost `{...}` span, which covers
    /// models that wrap JSON in prose.
    fn extract_json(raw: &str) -> Result<Value, String> {
        let trimmed = raw.trim();
        let unfenced = if trimmed.starts_with("```") {
            trimmed
                .trim_start_matches("```json")
                .trim_start_matches("```")
                .trim_end_matches("```")
                .trim()
        } else {
            trimmed
        };

        let direct_err = match serde_json::from_str::<Value>(unfenced) {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        if let (Some(open), Some(close)) = (unfenced.find('{'), unfenced.rfind('}'))
            && open < close
            && let Ok(v) = serde_json::from_str::<Value>(&unfenced[open..=close])
        {
            return Ok(v);
        }

        Err(format!(
            "not valid JSON: {direct_err} (output length {} bytes)",
            raw.len()
        ))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn coerce(node: &SchemaNode, value: Value, path: &str) -> Result<Value, String> {
        match node {
            SchemaNode::Object { fields } => {
                let Value::Object(mut map) = value else {
                    return Err(format!("{path}: expected object"));
                };
                let mut out = serde_json::Map::with_capacity(fields.len());
                for field in fields {
                    let field_path = format!("{path}.{}", field.name);
                    match map.remove(&field.name) {
                        Some(Value::Null) | None => {
                            if let Some(default) = &field.default {
                                out.insert(field.name.clone(), default.clone());
                            } else if field.required {
                                return Err(format!("{field_path}: missing required field"));
                            }
                        }
                        Some(v) => {
                            out.insert(field.name.clone(), Self::coerce(&field.node, v, &field_path)?);
                        }
                    }
                }
                // Unknown fields in `map` are dropped for forward compatibility.
                Ok(Value::Object(out))
            }
            SchemaNode::String {
                enum_values,
                max_len,
            } => {
                let mut s = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => return Err(format!("{path}: expected string, got {other}")),
                };
                if let Some(allowed) = enum_values {
                    let matched = allowed
                        .iter()
                        .find(|a| a.eq_ignore_ascii_case(s.trim()))
                        .cloned();
                    s = matched.ok_or_else(|| {
                        format!("{path}: {s:?} not in allowed set {allowed:?}")
                    })?;
                }
                if let Some(cap) = max_len
                    && s.len() > *cap
                {
                    let mut cut = *cap;
                    while cut > 0 && !s.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    s.truncate(cut);
                }
                Ok(Value::String(s))
            }
            SchemaNode::Number { min, max } => {
                let mut n = match &value {
                    Value::Number(n) => n
                        .as_f64()
                        .ok_or_else(|| format!("{path}: unrepresentable number"))?,
                    Value::String(s) => s
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| format!("{path}: {s:?} is not a number"))?,
                    other => return Err(format!("{path}: expected number, got {other}")),
                };
                if let Some(lo) = min {
                    n = n.max(*lo);
                }
                if let Some(hi) = max {
                    n = n.min(*hi);
                }
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .ok_or_else(|| format!("{path}: non-finite number"))
            }
            SchemaNode::Integer { min, max } => {
                let mut n = match &value {
                    Value::Number(n) => n.as_i64().map_or_else(
                        || n.as_f64().map(|f| f.round() as i64),
                        Some,
                    ),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| format!("{path}: expected integer, got {value}"))?;
                if let Some(lo) = min {
                    n = n.max(*lo);
                }
                if let Some(hi) = max {
                    n = n.min(*hi);
                }
                Ok(Value::from(n))
            }
            SchemaNode::Boolean => match &value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "yes" => Ok(Value::Bool(true)),
                    "false" | "no" => Ok(Value::Bool(false)),
                    _ => Err(format!("{path}: {s:?} is not a boolean")),
                },
                other => Err(format!("{path}: expected boolean, got {other}")),
            },
            SchemaNode::Array { items, max_items } => {
                // A bare scalar where an array is expected becomes a
                // one-element array.
                let mut arr = match value {
                    Value::Array(a) => a,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                if let Some(cap) = max_items {
                    arr.truncate(*cap);
                }
                arr.into_iter()
                    .enumerate()
                    .map(|(i, v)| Self::coerce(items, v, &format!("{path}[{i}]")))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
        }
    }
}

impl SchemaValidator for LenientValidator {
    fn validate(&self, schema: &Schema, raw: &str) -> Result<Value, ClientError> {
        if raw.len() > MAX_RAW_OUTPUT_LEN {
            return Err(Self::reject(
                schema,
                "",
                format!(
                    "output too large ({} bytes, max {MAX_RAW_OUTPUT_LEN})",
                    raw.len()
                ),
            ));
        }
        let value =
            Self::extract_json(raw).map_err(|m| Self::reject(schema, raw, m))?;
        Self::coerce(&schema.root, value, "$").map_err(|m| Self::reject(schema, raw, m))
    }
}
