//! Structural view of a tool's JSON input schema.
//!
//! Only the parts needed to reject obviously wrong arguments before a round
//! trip are interpreted: the top-level object shape, property types,
//! `required`, `enum` and `additionalProperties: false`. Anything else in the
//! schema is carried along untouched and left to the server.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl SchemaType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "object" => Self::Object,
            "array" => Self::Array,
            "string" => Self::String,
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "null" => Self::Null,
            _ => return None,
        })
    }

    pub fn of(value: &Value) -> Self {
        match value {
            Value::Object(_) => Self::Object,
            Value::Array(_) => Self::Array,
            Value::String(_) => Self::String,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Number,
            Value::Bool(_) => Self::Boolean,
            Value::Null => Self::Null,
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Number, Value::Number(_)) => true,
            (Self::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => Self::of(value) == self,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Null => "null",
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PropertySchema {
    /// Empty means any type.
    pub types: Vec<SchemaType>,
    pub allowed: Option<Vec<Value>>,
    pub description: Option<String>,
}

impl PropertySchema {
    fn from_value(value: &Value) -> Self {
        let types = match value.get("type") {
            Some(Value::String(name)) => SchemaType::parse(name).into_iter().collect(),
            Some(Value::Array(names)) => names
                .iter()
                .filter_map(Value::as_str)
                .filter_map(SchemaType::parse)
                .collect(),
            _ => Vec::new(),
        };
        Self {
            types,
            allowed: value.get("enum").and_then(Value::as_array).cloned(),
            description: value
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_owned),
        }
    }

    fn check(&self, field: &str, value: &Value) -> Result<(), SchemaViolation> {
        if !self.types.is_empty() && !self.types.iter().any(|t| t.accepts(value)) {
            return Err(SchemaViolation::WrongType {
                field: field.to_string(),
                expected: self
                    .types
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(" | "),
                found: SchemaType::of(value),
            });
        }
        match &self.allowed {
            Some(allowed) if !allowed.contains(value) => Err(SchemaViolation::NotAllowed {
                field: field.to_string(),
                value: value.clone(),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(SchemaType),
    #[error("missing required field '{0}'")]
    MissingRequired(String),
    #[error("field '{field}' must be {expected}, got {found}")]
    WrongType {
        field: String,
        expected: String,
        found: SchemaType,
    },
    #[error("field '{field}' has value {value} outside its enum")]
    NotAllowed { field: String, value: Value },
    #[error("unexpected field '{0}'")]
    UnexpectedField(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputSchema {
    raw: Value,
    properties: BTreeMap<String, PropertySchema>,
    required: BTreeSet<String>,
    additional_properties: bool,
}

impl InputSchema {
    /// Interpret a raw schema. Unrecognised shapes yield a permissive schema.
    pub fn from_value(raw: Value) -> Self {
        let empty = Map::new();
        let properties = raw
            .get("properties")
            .and_then(Value::as_object)
            .unwrap_or(&empty)
            .iter()
            .map(|(name, schema)| (name.clone(), PropertySchema::from_value(schema)))
            .collect();
        let required = raw
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let additional_properties = !matches!(raw.get("additionalProperties"), Some(Value::Bool(false)));

        Self {
            raw,
            properties,
            required,
            additional_properties,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.raw
    }

    pub fn properties(&self) -> &BTreeMap<String, PropertySchema> {
        &self.properties
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn allows_additional_properties(&self) -> bool {
        self.additional_properties
    }

    /// `null` arguments are treated as an empty object.
    pub fn validate(&self, args: &Value) -> Result<(), SchemaViolation> {
        let empty = Map::new();
        let object = match args {
            Value::Null => &empty,
            Value::Object(object) => object,
            other => return Err(SchemaViolation::NotAnObject(SchemaType::of(other))),
        };

        if let Some(missing) = self.required.iter().find(|name| !object.contains_key(*name)) {
            return Err(SchemaViolation::MissingRequired(missing.clone()));
        }

        for (field, value) in object {
            match self.properties.get(field) {
                Some(property) => property.check(field, value)?,
                None if !self.additional_properties => {
                    return Err(SchemaViolation::UnexpectedField(field.clone()));
                }
                None => {}
            }
        }
        Ok(())
    }
}

impl Default for InputSchema {
    fn default() -> Self {
        Self::from_value(serde_json::json!({ "type": "object" }))
    }
}

impl Serialize for InputSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}
