//! Parameter schemas for tool definitions.
//!
//! A [`ParamSchema`] is an ordered list of [`ParamSpec`]s. Order matters:
//! validation walks parameters in declaration order and stops at the first
//! violation, and the rendered JSON Schema lists properties in the same order.

use serde_json::{Map, Number, Value, json};
use thiserror::Error;

/// Primitive or structured type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    /// JSON Schema name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Coerce `value` into this type, or `None` if it cannot be.
    ///
    /// Accepted coercions: numbers to strings, numeric strings to
    /// integers/numbers, integral floats to integers, and `"true"`/`"false"`
    /// to booleans.
    pub fn coerce(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::String, Value::String(_)) => Some(value.clone()),
            (Self::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (Self::Integer, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    Some(value.clone())
                } else {
                    n.as_f64()
                        .filter(|f| f.is_finite() && f.fract() == 0.0)
                        .filter(|f| *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                        .map(|f| Value::from(f as i64))
                }
            }
            (Self::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (Self::Number, Value::Number(_)) => Some(value.clone()),
            (Self::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            (Self::Boolean, Value::Bool(_)) => Some(value.clone()),
            (Self::Boolean, Value::String(s)) => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (Self::Array, Value::Array(_)) | (Self::Object, Value::Object(_)) => Some(value.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single named parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    /// `None` accepts any JSON value. Only legal for optional parameters.
    pub ty: Option<ParamType>,
    pub required: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty: Some(ty),
            required: true,
            default: None,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty: Some(ty),
            required: false,
            default: None,
            description: None,
        }
    }

    /// An optional parameter accepting any value.
    pub fn any(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: None,
            required: false,
            default: None,
            description: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The first violation found while validating arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("missing required parameter '{0}'")]
    MissingRequired(String),

    #[error("parameter '{name}' must be {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: ParamType,
        found: &'static str,
    },

    #[error("unknown parameter '{0}'")]
    UnknownArgument(String),
}

/// Ordered parameter list for a tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSchema {
    params: Vec<ParamSpec>,
    allow_extra: bool,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Accept argument keys that are not declared.
    pub fn allow_extra(mut self) -> Self {
        self.allow_extra = true;
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn allows_extra(&self) -> bool {
        self.allow_extra
    }

    /// Check that the schema itself is well formed.
    pub fn check(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for spec in &self.params {
            if spec.name.trim().is_empty() {
                return Err("parameter with empty name".to_string());
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(format!("duplicate parameter '{}'", spec.name));
            }
            match (spec.ty, spec.required) {
                (None, true) => {
                    return Err(format!("required parameter '{}' has no type", spec.name));
                }
                (Some(ty), _) => {
                    let bad_default = spec.default.as_ref().is_some_and(|d| ty.coerce(d).is_none());
                    if bad_default {
                        return Err(format!("default for '{}' is not a valid {ty}", spec.name));
                    }
                }
                (None, false) => {}
            }
        }
        Ok(())
    }

    /// Validate `args` and return the coerced argument map.
    ///
    /// Parameters are checked in declaration order; unknown keys are checked
    /// last, in the order they appear in `args`. Absent optional parameters
    /// receive their default, if any. Explicit `null` counts as absent.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<Map<String, Value>, SchemaViolation> {
        let mut validated = Map::new();

        for spec in &self.params {
            let value = args.get(&spec.name).filter(|v| !v.is_null());
            match (value, spec.ty) {
                (None, _) if spec.required => {
                    return Err(SchemaViolation::MissingRequired(spec.name.clone()));
                }
                (None, _) => {
                    if let Some(default) = &spec.default {
                        let default = match spec.ty {
                            Some(ty) => ty.coerce(default).unwrap_or_else(|| default.clone()),
                            None => default.clone(),
                        };
                        validated.insert(spec.name.clone(), default);
                    }
                }
                (Some(value), Some(ty)) => {
                    let coerced = ty.coerce(value).ok_or_else(|| SchemaViolation::TypeMismatch {
                        name: spec.name.clone(),
                        expected: ty,
                        found: json_type_name(value),
                    })?;
                    validated.insert(spec.name.clone(), coerced);
                }
                (Some(value), None) => {
                    validated.insert(spec.name.clone(), value.clone());
                }
            }
        }

        for (key, value) in args {
            if self.params.iter().any(|p| &p.name == key) {
                continue;
            }
            if !self.allow_extra {
                return Err(SchemaViolation::UnknownArgument(key.clone()));
            }
            validated.insert(key.clone(), value.clone());
        }

        Ok(validated)
    }

    /// Render as a JSON Schema object for capability discovery.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for spec in &self.params {
            let mut prop = Map::new();
            if let Some(ty) = spec.ty {
                prop.insert("type".into(), Value::String(ty.as_str().into()));
            }
            if let Some(description) = &spec.description {
                prop.insert("description".into(), Value::String(description.clone()));
            }
            if let Some(default) = &spec.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(spec.name.clone(), Value::Object(prop));
        }

        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": self.allow_extra,
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
