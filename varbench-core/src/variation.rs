//! Variation groups and combinations.
//!
//! A variation is one candidate value for a named parameter group; a
//! combination picks one variation per group and represents a single
//! treatment under test.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::json::canonical_string;

/// Supported scalar types for variation values.
///
/// Coercion from the raw value happens once at construction time; there is no
/// dynamic evaluation of type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Str,
    Int,
    Float,
    Bool,
}

/// One candidate value within a variation group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    pub value_type: ValueType,
    pub raw_value: Value,
    /// Computed once at creation and immutable thereafter.
    pub instantiated_value: Value,
}

impl Variation {
    /// Builds a variation, coercing `raw_value` into `value_type`.
    pub fn new(value_type: ValueType, raw_value: Value) -> Result<Self, Error> {
        let instantiated_value = instantiate(value_type, &raw_value)?;
        Ok(Self {
            value_type,
            raw_value,
            instantiated_value,
        })
    }

    /// Builds a variation directly from an already-instantiated value,
    /// inferring the value type from the JSON type.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let value_type = match &value {
            Value::String(_) => ValueType::Str,
            Value::Bool(_) => ValueType::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => ValueType::Int,
            Value::Number(_) => ValueType::Float,
            other => {
                return Err(Error::config(format!(
                    "unsupported variation value: {other}"
                )))
            }
        };
        Ok(Self {
            value_type,
            raw_value: value.clone(),
            instantiated_value: value,
        })
    }
}

fn instantiate(value_type: ValueType, raw: &Value) -> Result<Value, Error> {
    let fail = || Error::config(format!("cannot coerce {raw} to {value_type:?}"));
    match value_type {
        ValueType::Str => match raw {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(fail()),
        },
        ValueType::Int => match raw {
            Value::Number(n) if n.is_i64() => Ok(raw.clone()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|i| Value::Number(i.into()))
                .map_err(|_| fail()),
            _ => Err(fail()),
        },
        ValueType::Float => {
            let parsed = match raw {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            parsed
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(fail)
        }
        ValueType::Bool => match raw {
            Value::Bool(_) => Ok(raw.clone()),
            Value::String(s) => match s.trim() {
                "true" | "True" => Ok(Value::Bool(true)),
                "false" | "False" => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
    }
}

/// A named group of candidate variations, in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariationGroup {
    pub name: String,
    pub candidates: Vec<Variation>,
}

impl VariationGroup {
    pub fn new(name: impl Into<String>, candidates: Vec<Variation>) -> Self {
        Self {
            name: name.into(),
            candidates,
        }
    }

    /// A group pinned to a single candidate, as used when re-running a
    /// specific treatment.
    pub fn single(name: impl Into<String>, value: Value) -> Result<Self, Error> {
        Ok(Self {
            name: name.into(),
            candidates: vec![Variation::from_value(value)?],
        })
    }
}

/// One choice of variation per group: a full treatment under test.
///
/// The canonical (key-sorted JSON) string form is the combination's identity
/// key for aggregation and for enhancer candidate bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Combination {
    values: Map<String, Value>,
}

impl Combination {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical identity key.
    pub fn key(&self) -> String {
        canonical_string(&Value::Object(self.values.clone()))
    }

    /// Parses a combination back from its canonical key.
    pub fn from_key(key: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(key)?;
        match value {
            Value::Object(values) => Ok(Self { values }),
            other => Err(Error::config(format!(
                "combination key is not a JSON object: {other}"
            ))),
        }
    }
}
