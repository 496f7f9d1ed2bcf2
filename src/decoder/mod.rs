//! # Structured-result decoding
//!
//! Turns a completed model reply into a typed record. A [`Shape`] describes
//! the target (field names, kinds, optionality); the [`StructuredDecoder`]
//! renders format instructions for the system prompt, extracts the JSON
//! payload from the reply, checks it against the shape and deserializes it.
//!
//! Decoding never retries and never fills in defaults: a reply that does not
//! fit the shape is a [`DecodeError`] carrying the full raw text.
//!
//! ```
//! use advisor_pipeline::decoder::{FieldKind, Shape, StructuredDecoder};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Report { title: String, suggestions: Vec<String> }
//!
//! let decoder = StructuredDecoder::new(
//!     Shape::new("Report")
//!         .field("title", FieldKind::String)
//!         .field("suggestions", FieldKind::list(FieldKind::String)),
//! );
//! let report: Report = decoder
//!     .decode("```json\n{\"title\": \"Plan\", \"suggestions\": [\"rest\"]}\n```")
//!     .unwrap();
//! assert_eq!(report.title, "Plan");
//! ```

pub mod extract;
pub mod repair;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::fmt;

/// Decoding failed; carries the untouched model reply.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("could not decode {shape} from model reply: {reason} (reply: {})", truncate(.raw, 200))]
pub struct DecodeError {
    /// Name of the target shape.
    pub shape: String,
    /// Why the reply did not fit.
    pub reason: String,
    /// The full reply text.
    pub raw: String,
}

/// Truncate a string to at most `max_len` bytes on a char boundary, appending "...".
pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Kind of a field in a [`Shape`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    List(Box<FieldKind>),
    /// Any JSON object; its contents are not checked.
    Object,
}

impl FieldKind {
    pub fn list(item: FieldKind) -> Self {
        FieldKind::List(Box::new(item))
    }

    fn schema(&self) -> Value {
        match self {
            FieldKind::String => json!({"type": "string"}),
            FieldKind::Integer => json!({"type": "integer"}),
            FieldKind::Number => json!({"type": "number"}),
            FieldKind::Boolean => json!({"type": "boolean"}),
            FieldKind::List(item) => json!({"type": "array", "items": item.schema()}),
            FieldKind::Object => json!({"type": "object"}),
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldKind::String, Value::String(_)) => true,
            (FieldKind::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldKind::Number, Value::Number(_)) => true,
            (FieldKind::Boolean, Value::Bool(_)) => true,
            (FieldKind::List(item), Value::Array(items)) => items.iter().all(|v| item.matches(v)),
            (FieldKind::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::String => f.write_str("string"),
            FieldKind::Integer => f.write_str("integer"),
            FieldKind::Number => f.write_str("number"),
            FieldKind::Boolean => f.write_str("boolean"),
            FieldKind::List(item) => write!(f, "list<{}>", item),
            FieldKind::Object => f.write_str("object"),
        }
    }
}

/// One named field of a [`Shape`].
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub description: Option<String>,
}

/// Caller-supplied description of the record a reply must decode into.
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    name: String,
    description: Option<String>,
    fields: Vec<Field>,
}

impl Shape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            fields: Vec::new(),
        }
    }

    /// Add a required field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: true,
            description: None,
        });
        self
    }

    /// Add a field that may be missing or `null`.
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: false,
            description: None,
        });
        self
    }

    /// Attach a description to the most recently added field, or to the
    /// shape itself when no field has been added yet.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        let description = Some(description.into());
        match self.fields.last_mut() {
            Some(last) => last.description = description,
            None => self.description = description,
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// JSON Schema (draft 2020-12 subset) for this shape.
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut schema = field.kind.schema();
            if let Some(ref d) = field.description {
                schema["description"] = json!(d);
            }
            properties.insert(field.name.clone(), schema);
            if field.required {
                required.push(json!(field.name));
            }
        }
        let mut schema = json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        });
        if let Some(ref d) = self.description {
            schema["description"] = json!(d);
        }
        schema
    }

    /// Check a parsed value against this shape. Extra keys are tolerated.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("expected a JSON object, got {}", kind_of(value)))?;

        for field in &self.fields {
            match obj.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(v) if !field.kind.matches(v) => {
                    return Err(format!(
                        "field '{}' should be {}, got {}",
                        field.name,
                        field.kind,
                        kind_of(v)
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse the JSON payload out of a free-form reply.
///
/// Tries, in order: the whole cleaned reply, a fenced block, the last
/// `{...}`, the last `[...]`; each candidate is also tried after repair.
/// The first successful parse wins.
pub fn parse_json_value(reply: &str) -> std::result::Result<Value, String> {
    let cleaned = extract::strip_think_tags(reply);
    if cleaned.is_empty() {
        return Err("empty response".to_string());
    }

    let mut first_error = None;
    for candidate in extract::json_candidates(&cleaned) {
        match serde_json::from_str::<Value>(candidate) {
            Ok(v) => return Ok(v),
            Err(e) => {
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
        if let Some(v) = repair::repair_json(candidate)
            .and_then(|fixed| serde_json::from_str::<Value>(&fixed).ok())
        {
            return Ok(v);
        }
    }
    Err(first_error.unwrap_or_else(|| "no JSON found".to_string()))
}

/// Decodes completed replies into records of one [`Shape`].
#[derive(Debug, Clone)]
pub struct StructuredDecoder {
    shape: Shape,
}

impl StructuredDecoder {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Text appended to the system prompt so the model answers in shape.
    pub fn format_instructions(&self) -> String {
        let schema = serde_json::to_string_pretty(&self.shape.json_schema())
            .unwrap_or_else(|_| self.shape.json_schema().to_string());
        format!(
            "Your response should be in JSON format.\n\
             Do not include any explanations, only provide a RFC8259 compliant JSON response \
             following this format without deviation.\n\
             Do not include markdown code blocks in your response.\n\
             Here is the JSON Schema instance your output must adhere to:\n{}",
            schema
        )
    }

    /// Append the format instructions to an existing system text.
    pub fn augment_system(&self, system_text: &str) -> String {
        if system_text.trim().is_empty() {
            self.format_instructions()
        } else {
            format!("{}\n\n{}", system_text.trim_end(), self.format_instructions())
        }
    }

    /// Extract and validate the JSON value without binding it to a type.
    pub fn decode_value(&self, reply: &str) -> std::result::Result<Value, DecodeError> {
        let value = parse_json_value(reply).map_err(|reason| self.error(reply, reason))?;
        self.shape
            .validate(&value)
            .map_err(|reason| self.error(reply, reason))?;
        Ok(value)
    }

    /// Decode a reply into `T`.
    pub fn decode<T: DeserializeOwned>(&self, reply: &str) -> std::result::Result<T, DecodeError> {
        let value = self.decode_value(reply)?;
        serde_json::from_value(value).map_err(|e| self.error(reply, e.to_string()))
    }

    fn error(&self, reply: &str, reason: String) -> DecodeError {
        tracing::debug!(shape = %self.shape.name, %reason, "structured decode failed");
        DecodeError {
            shape: self.shape.name.clone(),
            reason,
            raw: reply.to_string(),
        }
    }
}
